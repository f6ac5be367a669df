mod file;
mod incluster;
mod tls;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use headers::{Authorization, HeaderMapExt};
use http::Request;

/// Projected service account tokens are rotated by the kubelet, so a token read
/// from a file is only trusted for this long.
const TOKEN_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    InCluster(#[from] incluster::Error),

    #[error(transparent)]
    File(#[from] file::Error),

    #[error("no kube config found in {path:?} and not running in a cluster: {err}")]
    NotFound {
        path: PathBuf,
        err: incluster::Error,
    },
}

/// A bearer token kept in a file.
#[derive(Clone)]
pub struct TokenFile {
    path: PathBuf,
    cached: Arc<Mutex<(String, Instant)>>,
}

impl fmt::Debug for TokenFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TokenFile").field(&self.path).finish()
    }
}

fn read_token(path: &Path) -> std::io::Result<String> {
    std::fs::read_to_string(path).map(|content| content.trim().to_string())
}

impl TokenFile {
    pub(crate) fn open(path: PathBuf) -> std::io::Result<Self> {
        let token = read_token(&path)?;

        Ok(TokenFile {
            path,
            cached: Arc::new(Mutex::new((token, Instant::now()))),
        })
    }

    /// The cached token, read again once it is older than [`TOKEN_TTL`].
    pub fn token(&self) -> std::io::Result<String> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| std::io::Error::other("token lock poisoned"))?;

        if cached.1.elapsed() > TOKEN_TTL {
            *cached = (read_token(&self.path)?, Instant::now());
        }

        Ok(cached.0.clone())
    }
}

#[derive(Clone)]
pub enum Auth {
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
    TokenFile(TokenFile),
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Auth::None => f.write_str("None"),
            Auth::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            Auth::Bearer { .. } => f.debug_struct("Bearer").finish_non_exhaustive(),
            Auth::TokenFile(file) => fmt::Debug::fmt(file, f),
        }
    }
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
            Auth::TokenFile(file) => file.token()?,
        };

        let header = Authorization::bearer(&token)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        req.headers_mut().typed_insert(header);

        Ok(())
    }
}

/// Where the API server is, and how to authenticate against it.
#[derive(Debug)]
pub struct Config {
    pub cluster_url: http::Uri,

    /// Namespace of the current context, or of the service account.
    pub default_namespace: String,

    pub auth: Auth,

    pub tls: rustls::ClientConfig,
}

impl Config {
    /// Load the kube config pointed by `KUBECONFIG`, or `~/.kube/config`, and fall
    /// back to the in-cluster service account when neither exists.
    pub fn load() -> Result<Config, Error> {
        let path = match std::env::var_os("KUBECONFIG") {
            Some(path) => Some(PathBuf::from(path)),
            None => std::env::var_os("HOME")
                .map(|home| PathBuf::from(home).join(".kube").join("config")),
        };

        match path {
            Some(path) if path.exists() => file::from_config(&path).map_err(Into::into),
            Some(path) => incluster::incluster_env().map_err(|err| Error::NotFound { path, err }),
            None => incluster::incluster_env().map_err(Into::into),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authorization(auth: &Auth) -> Option<String> {
        let mut req = Request::new(());
        auth.apply(&mut req).unwrap();

        req.headers()
            .get(http::header::AUTHORIZATION)
            .map(|value| value.to_str().unwrap().to_string())
    }

    #[test]
    fn apply() {
        assert_eq!(authorization(&Auth::None), None);
        assert_eq!(
            authorization(&Auth::Basic {
                username: "admin".to_string(),
                password: "secret".to_string(),
            }),
            Some("Basic YWRtaW46c2VjcmV0".to_string())
        );
        assert_eq!(
            authorization(&Auth::Bearer {
                token: "abc".to_string()
            }),
            Some("Bearer abc".to_string())
        );
    }

    #[test]
    fn token_file_cached() {
        let path = testify::temp_file();
        std::fs::write(&path, "first\n").unwrap();

        let auth = Auth::TokenFile(TokenFile::open(path.clone()).unwrap());
        std::fs::write(&path, "second\n").unwrap();

        // still within the ttl
        assert_eq!(authorization(&auth), Some("Bearer first".to_string()));

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn debug_hides_secrets() {
        let auth = Auth::Basic {
            username: "admin".to_string(),
            password: "secret".to_string(),
        };
        let text = format!("{auth:?}");
        assert!(text.contains("admin"));
        assert!(!text.contains("secret"));

        let text = format!(
            "{:?}",
            Auth::Bearer {
                token: "abc".to_string()
            }
        );
        assert!(!text.contains("abc"));
    }
}
