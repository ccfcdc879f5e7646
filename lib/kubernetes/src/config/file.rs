use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::pem::{self as pki_pem, SectionKind};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_native_certs::CertificateResult;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Auth, Config, LoadDataError, RefreshableToken, pem_certificates};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to read kube config
    #[error("failed to read '{1:?}': {0}")]
    ReadFile(#[source] std::io::Error, PathBuf),
    /// Failed to parse kube config YAML
    #[error("failed to parse kube config YAML: {0}")]
    Parse(#[source] serde_yaml::Error),
    #[error("current-context is not set")]
    CurrentContextNotSet,
    #[error("context \"{0}\" not found")]
    LoadContext(String),
    #[error("cluster \"{0}\" of current context not found")]
    LoadClusterOfContext(String),
    #[error("user \"{0}\" of current context not found")]
    FindUser(String),
    #[error("cluster url is missing on selected cluster")]
    MissingClusterUrl,
    #[error("failed to parse cluster url: {0}")]
    ParseClusterUri(#[source] http::uri::InvalidUri),
    #[error("failed to load client certificate: {0}")]
    LoadClientCertificate(#[source] LoadDataError),
    #[error("failed to load client key: {0}")]
    LoadClientKey(#[source] LoadDataError),
    #[error("failed to load certificate authority: {0}")]
    LoadCertificateAuthority(#[source] LoadDataError),
    #[error("failed to parse PEM-encoded certificates: {0}")]
    ParseCertificates(#[source] pem::PemError),
    #[error("load native certificates: {0:?}")]
    LoadNativeCertificates(Vec<rustls_native_certs::Error>),
    #[error("client identity PEM is invalid: {0}")]
    InvalidIdentityPem(#[source] pki_pem::Error),
    #[error("client identity is missing a private key, the key must be PKCS8, PKCS1 or SEC1")]
    MissingPrivateKey,
    #[error("client identity is missing certificate")]
    MissingCertificate,
    #[error("unknown private key format")]
    UnknownPrivateKeyFormat,
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(#[source] rustls::Error),
    #[error("failed to add a root certificate: {0}")]
    AddRootCertificate(#[source] rustls::Error),
}

#[derive(Clone, Debug, Default, Deserialize)]
struct AuthInfo {
    /// The username for basic authentication to the kubernetes cluster.
    pub username: Option<String>,
    /// the password for basic authentication to the kubernetes cluster.
    pub password: Option<String>,

    /// The bearer token for authentication to the kubernetes cluster.
    pub token: Option<String>,
    /// Pointer to a file that contains a bearer token (as described above).
    #[serde(rename = "tokenFile")]
    pub token_file: Option<PathBuf>,

    /// Path to a client cert file for TLS.
    #[serde(rename = "client-certificate")]
    pub client_certificate: Option<PathBuf>,
    /// PEM-encoded data from a client cert file for TLS. Overrides `client_certificate`
    #[serde(rename = "client-certificate-data")]
    pub client_certificate_data: Option<String>,

    /// Path to a client key file for TLS
    #[serde(rename = "client-key")]
    pub client_key: Option<PathBuf>,
    /// PEM-encoded data from a client key file for TLS. Overrides `client_key`
    #[serde(rename = "client-key-data")]
    pub client_key_data: Option<String>,
}

/// NamedAuthInfo associates name with authentication.
#[derive(Deserialize)]
struct NamedAuthInfo {
    /// Name of the user
    name: String,

    /// Information that describes identity of the user
    #[serde(rename = "user")]
    auth_info: Option<AuthInfo>,
}

/// Cluster stores information to connect Kubernetes cluster.
#[derive(Clone, Deserialize)]
struct Cluster {
    /// The address of the kubernetes cluster (https://hostname:port)
    server: Option<String>,

    /// Skips the validity check for the server's certificate. This will make your HTTPS
    /// connections insecure.
    #[serde(rename = "insecure-skip-tls-verify", default)]
    insecure_skip_tls_verify: bool,

    /// The path to a cert file for the certificate authority.
    #[serde(rename = "certificate-authority")]
    certificate_authority: Option<PathBuf>,

    /// PEM-encoded certificate authority certificates. Overrides `certificate_authority`
    #[serde(rename = "certificate-authority-data")]
    certificate_authority_data: Option<String>,
}

/// NamedCluster associates name with cluster.
#[derive(Deserialize)]
struct NamedCluster {
    /// Name of cluster
    name: String,

    /// Information about how to communicate with  a kubernetes cluster.
    cluster: Option<Cluster>,
}

/// Context stores tuple of cluster and user information.
#[derive(Clone, Deserialize)]
struct Context {
    /// Name of the cluster for this context.
    cluster: String,

    /// Name of the `AuthInfo` for this context.
    user: String,
}

/// NamedContext associates name with context.
#[derive(Deserialize)]
struct NamedContext {
    /// Name of the context
    name: String,

    /// Associations for the context
    context: Option<Context>,
}

/// [`KubeConfig`] represents information on how to connect to a remote
/// Kubernetes cluster.
///
/// NOTE: Only necessary fields are present here.
///
/// Stored in `~/.kube/config` by default, but can be distributed across
/// multiple paths in passed through `KUBECONFIG`.
/// An analogue of the [config type from client-go](https://github.com/kubernetes/client-go/blob/7697067af71046b18e03dbda04e01a5bb17f9809/tools/clientcmd/api/types.go).
#[derive(Deserialize)]
struct KubeConfig {
    /// Referencable names to cluster configs
    #[serde(default)]
    clusters: Vec<NamedCluster>,

    /// Referencable names to user configs
    #[serde(default, rename = "users")]
    auth_infos: Vec<NamedAuthInfo>,

    /// Referencable names to context configs
    #[serde(default)]
    contexts: Vec<NamedContext>,

    /// The name of the context that you would like to use by default
    #[serde(rename = "current-context")]
    current_context: Option<String>,
}

pub fn from_config(path: impl AsRef<Path>) -> Result<Config, Error> {
    let path = path.as_ref();
    let data = std::fs::read(path).map_err(|err| Error::ReadFile(err, path.into()))?;
    let config = serde_yaml::from_slice::<KubeConfig>(&data).map_err(Error::Parse)?;

    // relative file references are resolved against the kubeconfig itself
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    build(config, base)
}

fn build(config: KubeConfig, base: &Path) -> Result<Config, Error> {
    let context_name = config.current_context.ok_or(Error::CurrentContextNotSet)?;
    let context = config
        .contexts
        .into_iter()
        .find(|ctx| ctx.name == context_name)
        .and_then(|ctx| ctx.context)
        .ok_or(Error::LoadContext(context_name))?;
    let cluster = config
        .clusters
        .into_iter()
        .find(|cluster| cluster.name == context.cluster)
        .and_then(|named_cluster| named_cluster.cluster)
        .ok_or_else(|| Error::LoadClusterOfContext(context.cluster.clone()))?;
    let auth_info = config
        .auth_infos
        .into_iter()
        .find(|named_user| named_user.name == context.user)
        .and_then(|named_user| named_user.auth_info)
        .ok_or_else(|| Error::FindUser(context.user.clone()))?;

    let cluster_url = cluster
        .server
        .as_deref()
        .ok_or(Error::MissingClusterUrl)?
        .trim_end_matches('/')
        .parse::<http::Uri>()
        .map_err(Error::ParseClusterUri)?;

    let root_store = if cluster.certificate_authority.is_none()
        && cluster.certificate_authority_data.is_none()
    {
        native_root_store()?
    } else {
        let data = load_base64_or_file(
            cluster.certificate_authority_data.as_ref(),
            cluster.certificate_authority.as_ref().map(|p| base.join(p)).as_ref(),
        )
        .map_err(Error::LoadCertificateAuthority)?;

        let mut root_store = RootCertStore::empty();
        for cert in pem_certificates(data).map_err(Error::ParseCertificates)? {
            root_store.add(cert).map_err(Error::AddRootCertificate)?;
        }

        root_store
    };

    let builder = ClientConfig::builder().with_root_certificates(root_store);
    let has_identity = auth_info.client_certificate.is_some()
        || auth_info.client_certificate_data.is_some();
    let mut tls = if has_identity {
        let client_cert = load_base64_or_file(
            auth_info.client_certificate_data.as_ref(),
            auth_info.client_certificate.as_ref().map(|p| base.join(p)).as_ref(),
        )
        .map_err(Error::LoadClientCertificate)?;
        let client_key = load_base64_or_file(
            auth_info.client_key_data.as_ref(),
            auth_info.client_key.as_ref().map(|p| base.join(p)).as_ref(),
        )
        .map_err(Error::LoadClientKey)?;

        let (chain, key) = client_identity(&client_cert, &client_key)?;
        builder
            .with_client_auth_cert(chain, key)
            .map_err(Error::InvalidPrivateKey)?
    } else {
        builder.with_no_client_auth()
    };

    if cluster.insecure_skip_tls_verify {
        warn!(message = "TLS verification of the API server is disabled by kubeconfig");

        tls.dangerous()
            .set_certificate_verifier(Arc::new(NoCertificateVerification));
    }

    let auth = if let (Some(username), Some(password)) = (auth_info.username, auth_info.password) {
        Auth::Basic { username, password }
    } else if let Some(path) = auth_info.token_file {
        let path = base.join(path);
        let refreshable_token =
            RefreshableToken::new(path.clone()).map_err(|err| Error::ReadFile(err, path))?;

        Auth::RefreshableToken(refreshable_token)
    } else if let Some(token) = auth_info.token {
        Auth::Bearer { token }
    } else {
        Auth::None
    };

    Ok(Config {
        cluster_url,
        auth,
        tls,
    })
}

/// Split PEM encoded client certificate and key into what rustls wants. The key
/// may be PKCS8, PKCS1 (RSA) or SEC1 (EC).
fn client_identity(
    cert: &[u8],
    key: &[u8],
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), Error> {
    let mut chain = Vec::new();
    let mut private_key = None;

    for data in [cert, key] {
        let mut reader = std::io::Cursor::new(data);
        while let Some((kind, der)) =
            pki_pem::from_buf(&mut reader).map_err(Error::InvalidIdentityPem)?
        {
            match kind {
                SectionKind::Certificate => chain.push(der.into()),
                SectionKind::PrivateKey => private_key = Some(PrivateKeyDer::Pkcs8(der.into())),
                SectionKind::RsaPrivateKey => private_key = Some(PrivateKeyDer::Pkcs1(der.into())),
                SectionKind::EcPrivateKey => private_key = Some(PrivateKeyDer::Sec1(der.into())),
                _ => return Err(Error::UnknownPrivateKeyFormat),
            }
        }
    }

    if chain.is_empty() {
        return Err(Error::MissingCertificate);
    }
    let private_key = private_key.ok_or(Error::MissingPrivateKey)?;

    Ok((chain, private_key))
}

fn native_root_store() -> Result<RootCertStore, Error> {
    let CertificateResult { certs, errors, .. } = rustls_native_certs::load_native_certs();
    if certs.is_empty() && !errors.is_empty() {
        return Err(Error::LoadNativeCertificates(errors));
    }

    let mut root_store = RootCertStore::empty();
    for cert in certs {
        if let Err(err) = root_store.add(cert) {
            debug!(message = "native certificate parse failed", %err);
        }
    }

    if root_store.is_empty() {
        warn!(message = "no valid native root CA certificates found");
    }

    Ok(root_store)
}

fn load_base64_or_file(
    data: Option<&String>,
    file: Option<&PathBuf>,
) -> Result<Vec<u8>, LoadDataError> {
    if let Some(data) = data {
        return base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .map_err(LoadDataError::DecodeBase64);
    }

    // files referenced by a kubeconfig hold plain PEM, not base64
    match file {
        Some(path) => std::fs::read(path).map_err(|err| LoadDataError::ReadFile(err, path.clone())),
        None => Err(LoadDataError::MissingDataOrFile),
    }
}

#[derive(Debug)]
pub struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        _server_name: &ServerName,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        tracing::warn!("Server cert bypassed");
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        use rustls::SignatureScheme;

        vec![
            SignatureScheme::RSA_PKCS1_SHA1,
            SignatureScheme::ECDSA_SHA1_Legacy,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}
