use std::io::Write;

use async_trait::async_trait;

use super::{Format, Output, OutputError, Rendered};
use crate::resource::Snapshot;

/// Prints every snapshot, nothing is removed since nothing persists.
pub struct StdoutOutput<W> {
    format: Format,
    writer: W,
}

impl<W: Write + Send> StdoutOutput<W> {
    pub fn new(format: Format, writer: W) -> Self {
        StdoutOutput { format, writer }
    }

    fn print(&mut self, rendered: Rendered) -> std::io::Result<()> {
        match rendered {
            Rendered::Single(content) => self.writer.write_all(content.as_bytes())?,
            Rendered::PerJob(jobs) => {
                for (index, (_job, content)) in jobs.iter().enumerate() {
                    if index > 0 {
                        self.writer.write_all(b"---\n")?;
                    }

                    self.writer.write_all(content.as_bytes())?;
                }
            }
        }

        self.writer.flush()
    }
}

#[async_trait]
impl<W: Write + Send> Output for StdoutOutput<W> {
    async fn write_output(&mut self, snapshot: &Snapshot) -> Result<(), OutputError> {
        let rendered = self.format.render(snapshot)?;

        self.print(rendered)
            .map_err(|err| OutputError::Persistence {
                artifact: "stdout".to_string(),
                source: err.into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::outputs::tests::snapshot;

    async fn print(format: Format) -> String {
        let mut output = StdoutOutput::new(format, Vec::new());
        output.write_output(&snapshot()).await.unwrap();

        String::from_utf8(output.writer).unwrap()
    }

    #[tokio::test]
    async fn scrape_configs() {
        let text = print(Format::ScrapeConfigs).await;

        assert!(text.starts_with("- job_name: node\n"));
        assert!(text.contains("- job_name: apache\n  proxy_url: http://proxy:3128\n"));
    }

    #[tokio::test]
    async fn static_configs_documents() {
        let text = print(Format::StaticConfigs).await;

        let documents = text.split("---\n").collect::<Vec<_>>();
        assert_eq!(documents.len(), 2);
        assert!(documents[0].contains("s2:9100"));
        assert_eq!(
            documents[1],
            "- targets:\n  - s1:9117\n  labels:\n    certname: s1\n"
        );
    }

    #[tokio::test]
    async fn merged_static_configs() {
        let text = print(Format::MergedStaticConfigs).await;

        assert!(!text.contains("---"));
        assert_eq!(text.matches("- targets:").count(), 3);
    }
}
