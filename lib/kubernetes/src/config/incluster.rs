use std::env;
use std::path::PathBuf;

use rustls::{ClientConfig, RootCertStore};

use super::{Auth, Config, RefreshableToken, pem_certificates};

const SERVICE_HOSTENV: &str = "KUBERNETES_SERVICE_HOST";
const SERVICE_PORTENV: &str = "KUBERNETES_SERVICE_PORT";

// Mounted credential files
const SERVICE_TOKENFILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_CERTFILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Errors from loading in-cluster config
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to read the in-cluster environment variables
    #[error("failed to read an in-cluster environment variable {0}, {1}")]
    ReadEnvironmentVariable(&'static str, #[source] env::VarError),

    /// Failed to read a certificate
    #[error("failed to read the certificate file {0}")]
    ReadCertificate(#[source] std::io::Error),

    /// Failed to parse cluster port value
    #[error("failed to parse cluster port: {0}")]
    ParseClusterPort(#[source] std::num::ParseIntError),

    /// Failed to parse cluster url
    #[error("failed to parse cluster uri: {0}")]
    ParseClusterUri(#[source] http::uri::InvalidUri),

    /// Failed to parse PEM-encoded certificates
    #[error("failed to parse PEM-encoded certificates: {0}")]
    ParseCertificates(#[source] pem::PemError),

    /// Failed to read token file
    #[error("failed to read token file: '{1:?}': {0}")]
    ReadTokenFile(#[source] std::io::Error, PathBuf),

    #[error("failed to build a RootCertStore: {0}")]
    BuildRootCertStore(#[source] rustls::Error),
}

pub fn incluster_env() -> Result<Config, Error> {
    let host = env::var(SERVICE_HOSTENV)
        .map_err(|err| Error::ReadEnvironmentVariable(SERVICE_HOSTENV, err))?;
    let port = env::var(SERVICE_PORTENV)
        .map_err(|err| Error::ReadEnvironmentVariable(SERVICE_PORTENV, err))?
        .parse::<u16>()
        .map_err(Error::ParseClusterPort)?;
    let cluster_url = cluster_uri(&host, port)?;
    let tls = load_tls()?;
    let refreshable_token = RefreshableToken::new(PathBuf::from(SERVICE_TOKENFILE))
        .map_err(|err| Error::ReadTokenFile(err, SERVICE_TOKENFILE.into()))?;

    Ok(Config {
        cluster_url,
        auth: Auth::RefreshableToken(refreshable_token),
        tls,
    })
}

/// Builds the URI of the API server from the `KUBERNETES_SERVICE_HOST` and
/// `KUBERNETES_SERVICE_PORT` values. The port is omitted when it is 443 and
/// IPv6 addresses are bracketed.
fn cluster_uri(host: &str, port: u16) -> Result<http::Uri, Error> {
    let host = match host.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V6(ip)) => format!("[{ip}]"),
        _ => host.to_string(),
    };

    let uri = if port == 443 {
        format!("https://{host}")
    } else {
        format!("https://{host}:{port}")
    };

    uri.parse().map_err(Error::ParseClusterUri)
}

/// Trust exactly the CA bundle mounted with the service account.
fn load_tls() -> Result<ClientConfig, Error> {
    let data = std::fs::read(SERVICE_CERTFILE).map_err(Error::ReadCertificate)?;

    let mut root_store = RootCertStore::empty();
    for cert in pem_certificates(data).map_err(Error::ParseCertificates)? {
        root_store.add(cert).map_err(Error::BuildRootCertStore)?;
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_cluster_uri() {
        for (host, port, want) in [
            ("10.0.0.1", 443, "https://10.0.0.1/"),
            ("10.0.0.1", 6443, "https://10.0.0.1:6443/"),
            ("fd00::1", 443, "https://[fd00::1]/"),
            ("fd00::1", 6443, "https://[fd00::1]:6443/"),
            ("kubernetes.default.svc", 443, "https://kubernetes.default.svc/"),
        ] {
            assert_eq!(cluster_uri(host, port).unwrap().to_string(), want);
        }
    }
}
