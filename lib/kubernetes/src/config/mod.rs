mod file;
mod incluster;

use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use headers::{Authorization, HeaderMapExt};
use http::Request;
use parking_lot::Mutex;
use rustls::pki_types::CertificateDer;
use tracing::debug;

/// Environment variable pointing at a kubeconfig file
pub const KUBECONFIG: &str = "KUBECONFIG";

/// How long a token read from disk is trusted before it is read again.
const TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Errors from loading data from a base64 string or a file
#[derive(Debug, thiserror::Error)]
pub enum LoadDataError {
    /// Failed to decode base64 data
    #[error("failed to decode base64 data: {0}")]
    DecodeBase64(#[source] base64::DecodeError),

    /// Failed to read file
    #[error("failed to read file '{1:?}': {0}")]
    ReadFile(#[source] std::io::Error, PathBuf),

    /// No base64 data or file path was provided
    #[error("missing base64 data or file")]
    MissingDataOrFile,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    InCluster(#[from] incluster::Error),

    #[error(transparent)]
    File(#[from] file::Error),

    #[error("no credentials found, KUBECONFIG is unset, not running in a cluster ({0}) and no kubeconfig in $HOME")]
    NotFound(#[source] incluster::Error),
}

struct Inner {
    token: String,
    expire_at: Instant,
}

/// A bearer token backed by a file that is rotated by someone else, e.g. the
/// projected service account token of a pod.
#[derive(Clone)]
pub struct RefreshableToken {
    path: PathBuf,
    inner: Arc<Mutex<Inner>>,
}

impl Debug for RefreshableToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshableToken")
            .field("path", &self.path)
            .field("expire_at", &self.inner.lock().expire_at)
            .finish()
    }
}

impl RefreshableToken {
    pub(crate) fn new(path: PathBuf) -> std::io::Result<Self> {
        let token = std::fs::read_to_string(&path)?;

        Ok(RefreshableToken {
            path,
            inner: Arc::new(Mutex::new(Inner {
                token: token.trim().to_string(),
                expire_at: Instant::now() + TOKEN_REFRESH_INTERVAL,
            })),
        })
    }

    pub fn token(&self) -> std::io::Result<String> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if now > inner.expire_at {
            let content = std::fs::read_to_string(&self.path)?;
            inner.token = content.trim().to_string();
            inner.expire_at = now + TOKEN_REFRESH_INTERVAL;

            debug!(message = "token refreshed", path = ?self.path);
        }

        Ok(inner.token.clone())
    }
}

#[derive(Clone, Debug)]
pub enum Auth {
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
    RefreshableToken(RefreshableToken),
}

impl Auth {
    pub fn apply<T>(&self, req: &mut Request<T>) -> std::io::Result<()> {
        let token = match self {
            Auth::None => return Ok(()),
            Auth::Basic { username, password } => {
                req.headers_mut()
                    .typed_insert(Authorization::basic(username, password));
                return Ok(());
            }
            Auth::Bearer { token } => token.clone(),
            Auth::RefreshableToken(refreshable_token) => refreshable_token.token()?,
        };

        let authorization = Authorization::bearer(&token).map_err(|_err| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "bearer token contains invalid characters",
            )
        })?;
        req.headers_mut().typed_insert(authorization);

        Ok(())
    }
}

/// Everything needed to talk to an API server: where it is, who we are and
/// which certificates to trust.
///
/// Prefer [`Config::load`], it resolves credentials the same way `kubectl` and
/// in-cluster workloads do.
#[derive(Debug)]
pub struct Config {
    /// The configured cluster url.
    pub cluster_url: http::Uri,

    /// Stores information to tell the cluster who you are.
    pub auth: Auth,

    pub tls: rustls::ClientConfig,
}

impl Config {
    /// Resolve credentials, in order:
    ///
    /// 1. the kubeconfig `KUBECONFIG` points at
    /// 2. the service account of the pod we are running in
    /// 3. `$HOME/.kube/config`
    pub fn load() -> Result<Config, Error> {
        if let Some(path) = std::env::var_os(KUBECONFIG).and_then(|paths| {
            // like kubectl, KUBECONFIG may be a list, take the first entry
            std::env::split_paths(&paths).find(|path| !path.as_os_str().is_empty())
        }) {
            debug!(message = "load kubeconfig from env", ?path);

            return file::from_config(path).map_err(Into::into);
        }

        let err = match incluster::incluster_env() {
            Ok(config) => return Ok(config),
            Err(err) => err,
        };

        if let Some(home) = std::env::var_os("HOME") {
            let path = PathBuf::from(home).join(".kube").join("config");
            if path.exists() {
                debug!(message = "load kubeconfig from home", ?path);

                return file::from_config(path).map_err(Into::into);
            }
        }

        Err(Error::NotFound(err))
    }
}

/// Every `CERTIFICATE` block of a PEM bundle, other blocks are ignored.
fn pem_certificates(data: impl AsRef<[u8]>) -> Result<Vec<CertificateDer<'static>>, pem::PemError> {
    let certs = pem::parse_many(data)?
        .into_iter()
        .filter(|p| p.tag() == "CERTIFICATE")
        .map(|p| CertificateDer::from(p.into_contents()))
        .collect();

    Ok(certs)
}
