use std::env;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use super::{Auth, Config, TokenFile, tls};

const SERVICE_HOST: &str = "KUBERNETES_SERVICE_HOST";
const SERVICE_PORT: &str = "KUBERNETES_SERVICE_PORT";

/// Token, CA bundle and namespace mounted into every pod.
const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("read environment variable {name} failed: {err}")]
    Env {
        name: &'static str,
        #[source]
        err: env::VarError,
    },

    #[error("invalid KUBERNETES_SERVICE_PORT: {0}")]
    Port(#[source] std::num::ParseIntError),

    #[error("invalid api server url: {0}")]
    Uri(#[source] http::uri::InvalidUri),

    #[error("read {path:?} failed: {err}")]
    Read {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("load service account CA failed: {0}")]
    Tls(#[from] tls::Error),
}

fn env_var(name: &'static str) -> Result<String, Error> {
    env::var(name).map_err(|err| Error::Env { name, err })
}

pub fn incluster_env() -> Result<Config, Error> {
    let host = env_var(SERVICE_HOST)?;
    let port = env_var(SERVICE_PORT)?;

    from_service_account(&host, &port, Path::new(SERVICE_ACCOUNT_DIR))
}

fn from_service_account(host: &str, port: &str, dir: &Path) -> Result<Config, Error> {
    let port = port.parse::<u16>().map_err(Error::Port)?;
    let cluster_url = cluster_uri(host, port).parse().map_err(Error::Uri)?;

    let read = |name: &str| {
        let path = dir.join(name);
        std::fs::read(&path).map_err(|err| Error::Read { path, err })
    };

    let namespace = read("namespace")?;
    let default_namespace = String::from_utf8_lossy(&namespace).trim().to_string();

    // only the mounted CA is trusted
    let roots = tls::roots_from_pem(&read("ca.crt")?)?;
    let tls = tls::client_config(roots, None, false)?;

    let token_path = dir.join("token");
    let token = TokenFile::open(token_path.clone()).map_err(|err| Error::Read {
        path: token_path,
        err,
    })?;

    Ok(Config {
        cluster_url,
        default_namespace,
        auth: Auth::TokenFile(token),
        tls,
    })
}

/// IPv6 hosts are bracketed, and the port is omitted when it is 443.
fn cluster_uri(host: &str, port: u16) -> String {
    let host = match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("[{ip}]"),
        _ => host.to_string(),
    };

    if port == 443 {
        format!("https://{host}")
    } else {
        format!("https://{host}:{port}")
    }
}
