use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use super::{Format, Output, OutputError, Rendered, artifact_name};
use crate::reconcile::Reconciler;
use crate::resource::Snapshot;

fn default_directory() -> PathBuf {
    PathBuf::from("/etc/prometheus")
}

fn default_filename() -> String {
    "puppetdb.yml".to_string()
}

fn default_filename_pattern() -> String {
    "puppetdb-*.yml".to_string()
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Created if it does not exist.
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    /// Used by the `scrape-configs` and `merged-static-configs` formats.
    #[serde(default = "default_filename")]
    pub filename: String,

    /// Used by the `static-configs` format, `*` is replaced with the job name.
    #[serde(default = "default_filename_pattern")]
    pub filename_pattern: String,
}

impl Default for FileConfig {
    fn default() -> Self {
        FileConfig {
            directory: default_directory(),
            filename: default_filename(),
            filename_pattern: default_filename_pattern(),
        }
    }
}

/// Write `content` to a temporary sibling, sync it and rename it to `path`,
/// so readers see the old or the new content, never a partial one.
async fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(content).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }

    result
}

/// Writes the rendered snapshot into a directory, so Prometheus can read it
/// with `file_sd_configs` or include the scrape configs.
pub struct FileOutput {
    directory: PathBuf,
    filename: String,
    filename_pattern: String,
    format: Format,
    reconciler: Reconciler<PathBuf>,
}

impl FileOutput {
    pub fn new(config: &FileConfig, format: Format) -> Result<Self, OutputError> {
        std::fs::create_dir_all(&config.directory).map_err(|err| OutputError::Persistence {
            artifact: config.directory.display().to_string(),
            source: err.into(),
        })?;

        Ok(FileOutput {
            directory: config.directory.clone(),
            filename: config.filename.clone(),
            filename_pattern: config.filename_pattern.clone(),
            format,
            reconciler: Reconciler::default(),
        })
    }

    fn artifacts(&self, rendered: Rendered) -> Vec<(PathBuf, String)> {
        match rendered {
            Rendered::Single(content) => vec![(self.directory.join(&self.filename), content)],
            Rendered::PerJob(jobs) => jobs
                .into_iter()
                .map(|(job, content)| {
                    let path = self
                        .directory
                        .join(artifact_name(&self.filename_pattern, &job));
                    (path, content)
                })
                .collect(),
        }
    }
}

#[async_trait]
impl Output for FileOutput {
    async fn write_output(&mut self, snapshot: &Snapshot) -> Result<(), OutputError> {
        let rendered = self.format.render(snapshot)?;

        let mut current = BTreeSet::new();
        for (path, content) in self.artifacts(rendered) {
            write_atomic(&path, content.as_bytes())
                .await
                .map_err(|err| OutputError::Persistence {
                    artifact: path.display().to_string(),
                    source: err.into(),
                })?;

            debug!(message = "file written", path = %path.display());
            current.insert(path);
        }

        let mut undeleted = vec![];
        for path in self.reconciler.stale(&current) {
            match tokio::fs::remove_file(path).await {
                Ok(()) => info!(message = "stale file removed", path = %path.display()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(
                        message = "remove stale file failed",
                        path = %path.display(),
                        %err,
                    );
                    undeleted.push(path.clone());
                }
            }
        }

        self.reconciler.commit(current, undeleted);

        Ok(())
    }
}
