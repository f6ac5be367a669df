mod external_service;
mod file;
mod secret;
mod stdout;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::resource::{Snapshot, StaticConfig};
pub use external_service::{ExternalServiceConfig, ExternalServiceOutput, Resolver, SystemResolver};
pub use file::{FileConfig, FileOutput};
pub use secret::{SecretConfig, SecretOutput};
pub use stdout::StdoutOutput;

/// Where the rendered scrape configs go.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Method {
    #[default]
    Stdout,
    File,
    K8sSecret,
    K8sExternalService,
}

/// Shape of the rendered content.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Format {
    /// One artifact, a list of scrape configs.
    #[default]
    ScrapeConfigs,
    /// One artifact per job, a list of the job's static configs, to be used
    /// with `file_sd_configs`.
    StaticConfigs,
    /// One artifact, the static configs of all jobs in one list.
    MergedStaticConfigs,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(default)]
    pub method: Method,

    #[serde(default)]
    pub format: Format,

    #[serde(default)]
    pub file: FileConfig,

    #[serde(default)]
    pub k8s_secret: SecretConfig,

    #[serde(default)]
    pub k8s_external_service: ExternalServiceConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("serialize output failed, {0}")]
    Serialization(#[from] serde_yaml::Error),

    #[error("persist {artifact} failed, {source}")]
    Persistence {
        artifact: String,
        source: crate::Error,
    },

    #[error(transparent)]
    Kubernetes(#[from] kubernetes::Error),
}

/// A sink of snapshots. Every write converges the external representation to
/// the snapshot, artifacts written before but absent from the snapshot are
/// removed.
#[async_trait]
pub trait Output: Send {
    async fn write_output(&mut self, snapshot: &Snapshot) -> Result<(), OutputError>;
}

/// Rendered snapshot, ready to be persisted.
#[derive(Debug, PartialEq)]
pub enum Rendered {
    /// The content of the one fixed artifact.
    Single(String),
    /// Job name and content, in snapshot order.
    PerJob(Vec<(String, String)>),
}

impl Format {
    pub fn render(&self, snapshot: &Snapshot) -> Result<Rendered, OutputError> {
        let rendered = match self {
            Format::ScrapeConfigs => Rendered::Single(serde_yaml::to_string(snapshot)?),
            Format::StaticConfigs => Rendered::PerJob(
                snapshot
                    .iter()
                    .map(|sc| {
                        serde_yaml::to_string(&sc.static_configs)
                            .map(|content| (sc.job_name.clone(), content))
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Format::MergedStaticConfigs => {
                let merged = snapshot
                    .iter()
                    .flat_map(|sc| &sc.static_configs)
                    .collect::<Vec<&StaticConfig>>();

                Rendered::Single(serde_yaml::to_string(&merged)?)
            }
        };

        Ok(rendered)
    }
}

/// Replace the first `*` of the pattern with the job name. Job names come from
/// Puppet, so characters other than ASCII alphanumerics, `-`, `_` and `.` become
/// `_`, and names made of dots only are escaped too. The result stays inside
/// the output directory and is a valid Secret key.
pub fn artifact_name(pattern: &str, job_name: &str) -> String {
    let mut job = job_name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect::<String>();
    if job.chars().all(|c| c == '.') {
        job = "_".repeat(job.len().max(1));
    }

    pattern.replacen('*', &job, 1)
}

/// Whether `name` could have been produced by [`artifact_name`] with `pattern`.
pub fn matches_pattern(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            name.len() > prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        }
        None => name == pattern,
    }
}

/// Log the version of the API server, so a broken kube config shows up at
/// startup instead of in the first cycle. Returns whether it answered.
async fn report_api_server(client: &kubernetes::Client) -> bool {
    match client.version().await {
        Ok(version) => {
            info!(
                message = "kubernetes api server connected",
                version = %version,
                platform = version.platform,
            );
            true
        }
        Err(err) => {
            warn!(message = "get kubernetes api server version failed", %err);
            false
        }
    }
}

/// Build the output the config asks for, Kubernetes outputs load the kube
/// config and check the API server here.
pub async fn build(config: &OutputConfig) -> Result<Box<dyn Output>, OutputError> {
    let output: Box<dyn Output> = match config.method {
        Method::Stdout => Box::new(StdoutOutput::new(config.format, std::io::stdout())),
        Method::File => Box::new(FileOutput::new(&config.file, config.format)?),
        Method::K8sSecret => {
            let secret = &config.k8s_secret;
            let client = kubernetes::Client::new(secret.namespace.clone())?;
            info!(
                message = "kubernetes client created",
                namespace = client.namespace(),
                secret = secret.secret_name,
            );
            report_api_server(&client).await;

            Box::new(SecretOutput::new(client, secret, config.format))
        }
        Method::K8sExternalService => {
            let external = &config.k8s_external_service;
            let client = kubernetes::Client::new(external.namespace.clone())?;
            info!(
                message = "kubernetes client created",
                namespace = client.namespace(),
                service_monitor = external.service_monitor_name,
            );
            report_api_server(&client).await;
            warn!(message = "output k8s-external-service is still an experimental feature");

            Box::new(ExternalServiceOutput::new(client, external, SystemResolver))
        }
    };

    Ok(output)
}
