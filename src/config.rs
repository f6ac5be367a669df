use std::path::{Path, PathBuf};
use std::time::Duration;

use http::Uri;
use serde::{Deserialize, Serialize};

use crate::outputs::{Format, Method, OutputConfig};
use crate::puppetdb;

const fn default_interval() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("read {path:?} failed, {err}")]
    Read { path: PathBuf, err: std::io::Error },

    #[error("parse {path:?} failed, {err}")]
    Parse {
        path: PathBuf,
        err: serde_yaml::Error,
    },

    #[error("invalid config, {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Sleep between two polls of PuppetDB.
    #[serde(default = "default_interval", with = "humanize::duration::serde")]
    pub interval: Duration,

    #[serde(default)]
    pub puppetdb: puppetdb::Config,

    /// Prometheus scrapes the targets through this proxy, `__scheme__` is
    /// moved to the `__param__scheme` parameter then.
    #[serde(default)]
    pub proxy_url: Option<String>,

    #[serde(default)]
    pub output: OutputConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            interval: default_interval(),
            puppetdb: puppetdb::Config::default(),
            proxy_url: None,
            output: OutputConfig::default(),
        }
    }
}

impl Config {
    /// Read and validate the YAML config file.
    pub fn load(path: &Path) -> Result<Config, Error> {
        let content = std::fs::read_to_string(path).map_err(|err| Error::Read {
            path: path.to_path_buf(),
            err,
        })?;

        let config = serde_yaml::from_str::<Config>(&content).map_err(|err| Error::Parse {
            path: path.to_path_buf(),
            err,
        })?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.interval.is_zero() {
            return Err(Error::Invalid("interval must be greater than zero".into()));
        }

        let url = self
            .puppetdb
            .url
            .parse::<Uri>()
            .map_err(|err| Error::Invalid(format!("puppetdb url {:?}, {err}", self.puppetdb.url)))?;
        if !matches!(url.scheme_str(), Some("http" | "https")) {
            return Err(Error::Invalid(format!(
                "puppetdb url {:?} must be http or https",
                self.puppetdb.url
            )));
        }

        let output = &self.output;
        let static_configs = output.format == Format::StaticConfigs;
        match output.method {
            Method::Stdout | Method::K8sExternalService => {}
            Method::File => {
                if static_configs && !output.file.filename_pattern.contains('*') {
                    return Err(Error::Invalid(format!(
                        "filename pattern {:?} must contain '*'",
                        output.file.filename_pattern
                    )));
                }
            }
            Method::K8sSecret => {
                let secret = &output.k8s_secret;
                if secret.secret_name.is_empty() {
                    return Err(Error::Invalid(
                        "secret name is required by the k8s-secret method".into(),
                    ));
                }

                if static_configs && !secret.secret_key_pattern.contains('*') {
                    return Err(Error::Invalid(format!(
                        "secret key pattern {:?} must contain '*'",
                        secret.secret_key_pattern
                    )));
                }

                if secret.extra_config_secret_name.is_some()
                    != secret.extra_config_secret_key.is_some()
                {
                    return Err(Error::Invalid(
                        "extra config secret name and key must be set together".into(),
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults() {
        let config = serde_yaml::from_str::<Config>("{}").unwrap();

        assert_eq!(config.interval, Duration::from_secs(5));
        assert_eq!(config.puppetdb.url, "http://puppetdb:8080");
        assert_eq!(config.puppetdb.query, puppetdb::DEFAULT_QUERY);
        assert_eq!(config.puppetdb.timeout, Duration::from_secs(30));
        assert!(config.puppetdb.tls.verify_certificate);
        assert_eq!(config.proxy_url, None);
        assert_eq!(config.output.method, Method::Stdout);
        assert_eq!(config.output.format, Format::ScrapeConfigs);
        assert_eq!(config.output.file.directory, PathBuf::from("/etc/prometheus"));
        assert_eq!(config.output.file.filename, "puppetdb.yml");
        assert_eq!(config.output.file.filename_pattern, "puppetdb-*.yml");
        assert_eq!(
            config.output.k8s_external_service.service_monitor_name,
            "prometheus-puppetdb"
        );

        config.validate().unwrap();
    }

    #[test]
    fn full() {
        let text = r#"
interval: 1m
puppetdb:
  url: https://puppetdb.example.com:8081
  query: "resources[certname, parameters] { type = 'Prometheus::Scrape_job' and environment = '{{env}}' }"
  parameters:
    env: production
  timeout: 10s
  tls:
    ca: certs/cacert.pem
    cert: certs/client.pem
    key: certs/client.key
    verify_hostname: false
proxy_url: http://proxy:3128
output:
  method: k8s-secret
  format: static-configs
  k8s_secret:
    secret_name: prometheus-puppetdb
    namespace: monitoring
    object_labels:
      team: infra
    secret_key_pattern: job-*.yml
"#;

        let config = serde_yaml::from_str::<Config>(text).unwrap();
        config.validate().unwrap();

        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(
            config.puppetdb.parameters,
            BTreeMap::from([("env".to_string(), "production".to_string())])
        );
        assert_eq!(config.puppetdb.timeout, Duration::from_secs(10));
        assert_eq!(
            config.puppetdb.tls.cert,
            Some(PathBuf::from("certs/client.pem"))
        );
        assert!(!config.puppetdb.tls.verify_hostname);
        assert_eq!(config.proxy_url.as_deref(), Some("http://proxy:3128"));
        assert_eq!(config.output.method, Method::K8sSecret);
        assert_eq!(config.output.format, Format::StaticConfigs);

        let secret = &config.output.k8s_secret;
        assert_eq!(secret.namespace.as_deref(), Some("monitoring"));
        assert_eq!(
            secret.object_labels,
            BTreeMap::from([("team".to_string(), "infra".to_string())])
        );
        assert_eq!(secret.secret_key, "puppetdb.yml");
        assert_eq!(secret.secret_key_pattern, "job-*.yml");
    }

    #[test]
    fn unknown_field() {
        assert!(serde_yaml::from_str::<Config>("intervall: 5s").is_err());
        assert!(serde_yaml::from_str::<Config>("output:\n  method: configmap").is_err());
    }

    #[test]
    fn invalid() {
        for (text, reason) in [
            ("interval: 0s", "zero interval"),
            ("puppetdb:\n  url: ftp://puppetdb", "url scheme"),
            ("output:\n  method: k8s-secret", "missing secret name"),
            (
                "output:\n  method: file\n  format: static-configs\n  file:\n    filename_pattern: puppetdb.yml",
                "file pattern without wildcard",
            ),
            (
                "output:\n  method: k8s-secret\n  format: static-configs\n  k8s_secret:\n    secret_name: foo\n    secret_key_pattern: foo.yml",
                "secret pattern without wildcard",
            ),
            (
                "output:\n  method: k8s-secret\n  k8s_secret:\n    secret_name: foo\n    extra_config_secret_name: extra",
                "extra config without key",
            ),
        ] {
            let config = serde_yaml::from_str::<Config>(text).unwrap();
            assert!(config.validate().is_err(), "{reason}");
        }
    }

    #[test]
    fn load_file() {
        let path = testify::temp_file();
        std::fs::write(&path, "interval: 30s\nproxy_url: http://proxy:3128\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.interval, Duration::from_secs(30));

        assert!(matches!(
            Config::load(&testify::temp_file()),
            Err(Error::Read { .. })
        ));

        std::fs::write(&path, "interval: [").unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Parse { .. })));

        std::fs::remove_file(&path).unwrap();
    }
}
