use std::path::{Path, PathBuf};

use base64::Engine;
use rustls::RootCertStore;
use serde::Deserialize;

use super::tls::{self, Identity};
use super::{Auth, Config, TokenFile};

const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("read {path:?} failed: {err}")]
    Read {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("parse kube config failed: {0}")]
    Parse(#[source] serde_yaml::Error),

    #[error("current-context is not set")]
    NoCurrentContext,

    #[error("context \"{0}\" not found")]
    ContextNotFound(String),

    #[error("cluster \"{0}\" not found")]
    ClusterNotFound(String),

    #[error("user \"{0}\" not found")]
    UserNotFound(String),

    #[error("cluster has no server url")]
    NoServer,

    #[error("invalid server url: {0}")]
    InvalidServer(#[source] http::uri::InvalidUri),

    #[error("decode base64 {field} failed: {err}")]
    Base64 {
        field: &'static str,
        #[source]
        err: base64::DecodeError,
    },

    #[error("client certificate is set without a client key")]
    NoClientKey,

    #[error(transparent)]
    Tls(#[from] tls::Error),
}

/// The subset of a kubeconfig file needed to reach one cluster.
#[derive(Deserialize)]
struct KubeConfig {
    #[serde(default)]
    clusters: Vec<Named<Cluster>>,
    #[serde(default)]
    contexts: Vec<Named<Context>>,
    #[serde(default)]
    users: Vec<Named<User>>,
    #[serde(rename = "current-context")]
    current_context: Option<String>,
}

/// Every list entry of a kubeconfig is a name plus one payload field, whose key
/// depends on the list.
#[derive(Deserialize)]
struct Named<T> {
    name: String,
    #[serde(alias = "cluster", alias = "context", alias = "user")]
    value: Option<T>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Cluster {
    server: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
    certificate_authority: Option<PathBuf>,
    certificate_authority_data: Option<String>,
}

#[derive(Deserialize)]
struct Context {
    cluster: String,
    user: String,
    namespace: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct User {
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
    #[serde(rename = "tokenFile")]
    token_file: Option<PathBuf>,
    client_certificate: Option<PathBuf>,
    client_certificate_data: Option<String>,
    client_key: Option<PathBuf>,
    client_key_data: Option<String>,
}

fn find<T>(list: Vec<Named<T>>, name: &str) -> Option<T> {
    list.into_iter()
        .find(|named| named.name == name)
        .and_then(|named| named.value)
}

/// Inline base64 data wins over the file path, `None` when neither is set.
fn load_data(
    field: &'static str,
    data: Option<&str>,
    path: Option<&Path>,
) -> Result<Option<Vec<u8>>, Error> {
    if let Some(data) = data {
        return base64::engine::general_purpose::STANDARD
            .decode(data)
            .map(Some)
            .map_err(|err| Error::Base64 { field, err });
    }

    match path {
        Some(path) => std::fs::read(path).map(Some).map_err(|err| Error::Read {
            path: path.to_path_buf(),
            err,
        }),
        None => Ok(None),
    }
}

impl KubeConfig {
    fn read(path: &Path) -> Result<Self, Error> {
        let data = std::fs::read(path).map_err(|err| Error::Read {
            path: path.to_path_buf(),
            err,
        })?;

        serde_yaml::from_slice(&data).map_err(Error::Parse)
    }

    /// Resolve the current context into its cluster, user and namespace.
    fn select(self) -> Result<(Cluster, User, String), Error> {
        let name = self.current_context.ok_or(Error::NoCurrentContext)?;
        let context = find(self.contexts, &name).ok_or(Error::ContextNotFound(name))?;
        let cluster = find(self.clusters, &context.cluster)
            .ok_or_else(|| Error::ClusterNotFound(context.cluster.clone()))?;
        let user = find(self.users, &context.user)
            .ok_or_else(|| Error::UserNotFound(context.user.clone()))?;
        let namespace = context
            .namespace
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        Ok((cluster, user, namespace))
    }
}

impl Cluster {
    fn url(&self) -> Result<http::Uri, Error> {
        self.server
            .as_deref()
            .ok_or(Error::NoServer)?
            .parse()
            .map_err(Error::InvalidServer)
    }

    fn roots(&self) -> Result<RootCertStore, Error> {
        let ca = load_data(
            "certificate-authority-data",
            self.certificate_authority_data.as_deref(),
            self.certificate_authority.as_deref(),
        )?;

        match ca {
            Some(data) => Ok(tls::roots_from_pem(&data)?),
            None => Ok(tls::native_roots()),
        }
    }
}

impl User {
    fn identity(&self) -> Result<Option<Identity>, Error> {
        let Some(cert) = load_data(
            "client-certificate-data",
            self.client_certificate_data.as_deref(),
            self.client_certificate.as_deref(),
        )?
        else {
            return Ok(None);
        };

        let mut pem = load_data(
            "client-key-data",
            self.client_key_data.as_deref(),
            self.client_key.as_deref(),
        )?
        .ok_or(Error::NoClientKey)?;
        pem.push(b'\n');
        pem.extend_from_slice(&cert);

        Ok(Some(Identity::from_pem(&pem)?))
    }

    /// Basic auth wins over tokens, and a token file wins over an inline token so
    /// rotated tokens are picked up.
    fn auth(self) -> Result<Auth, Error> {
        if let (Some(username), Some(password)) = (self.username, self.password) {
            return Ok(Auth::Basic { username, password });
        }

        if let Some(path) = self.token_file {
            return TokenFile::open(path.clone())
                .map(Auth::TokenFile)
                .map_err(|err| Error::Read { path, err });
        }

        Ok(match self.token {
            Some(token) => Auth::Bearer { token },
            None => Auth::None,
        })
    }
}

pub fn from_config(path: &Path) -> Result<Config, Error> {
    let (cluster, user, default_namespace) = KubeConfig::read(path)?.select()?;

    let cluster_url = cluster.url()?;
    let tls = tls::client_config(
        cluster.roots()?,
        user.identity()?,
        cluster.insecure_skip_tls_verify,
    )?;
    let auth = user.auth()?;

    Ok(Config {
        cluster_url,
        default_namespace,
        auth,
        tls,
    })
}
