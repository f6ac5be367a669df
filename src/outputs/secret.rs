use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use kubernetes::{ObjectMeta, ObjectStore, Secret};
use serde::{Deserialize, Serialize};

use super::{Format, Output, OutputError, Rendered, artifact_name, matches_pattern};
use crate::reconcile::Reconciler;
use crate::resource::Snapshot;

pub(super) fn default_object_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(
        "app.kubernetes.io/name".to_string(),
        "prometheus-puppetdb".to_string(),
    )])
}

fn default_secret_key() -> String {
    "puppetdb.yml".to_string()
}

fn default_secret_key_pattern() -> String {
    "puppetdb-*.yml".to_string()
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SecretConfig {
    /// Name of the Secret to write, required.
    #[serde(default)]
    pub secret_name: String,

    /// Defaults to the namespace of the kube config.
    #[serde(default)]
    pub namespace: Option<String>,

    /// Labels set on the Secret.
    #[serde(default = "default_object_labels")]
    pub object_labels: BTreeMap<String, String>,

    /// Used by the `scrape-configs` and `merged-static-configs` formats.
    #[serde(default = "default_secret_key")]
    pub secret_key: String,

    /// Used by the `static-configs` format, `*` is replaced with the job name.
    #[serde(default = "default_secret_key_pattern")]
    pub secret_key_pattern: String,

    /// Content of this Secret's key is appended to the generated
    /// configuration, only for the single key formats.
    #[serde(default)]
    pub extra_config_secret_name: Option<String>,

    #[serde(default)]
    pub extra_config_secret_key: Option<String>,
}

impl Default for SecretConfig {
    fn default() -> Self {
        SecretConfig {
            secret_name: String::new(),
            namespace: None,
            object_labels: default_object_labels(),
            secret_key: default_secret_key(),
            secret_key_pattern: default_secret_key_pattern(),
            extra_config_secret_name: None,
            extra_config_secret_key: None,
        }
    }
}

/// Stores the rendered snapshot in the data of one Secret, so it can be
/// mounted into Prometheus or referenced by `additionalScrapeConfigs` of the
/// prometheus-operator.
pub struct SecretOutput<S> {
    store: S,
    secret_name: String,
    object_labels: BTreeMap<String, String>,
    secret_key: String,
    secret_key_pattern: String,
    extra: Option<(String, String)>,
    format: Format,
    reconciler: Reconciler<String>,
}

impl<S: ObjectStore> SecretOutput<S> {
    pub fn new(store: S, config: &SecretConfig, format: Format) -> Self {
        let extra = match (
            &config.extra_config_secret_name,
            &config.extra_config_secret_key,
        ) {
            (Some(name), Some(key)) => Some((name.clone(), key.clone())),
            _ => None,
        };

        SecretOutput {
            store,
            secret_name: config.secret_name.clone(),
            object_labels: config.object_labels.clone(),
            secret_key: config.secret_key.clone(),
            secret_key_pattern: config.secret_key_pattern.clone(),
            extra,
            format,
            reconciler: Reconciler::default(),
        }
    }

    async fn extra_config(&self) -> Result<Option<Vec<u8>>, OutputError> {
        let Some((name, key)) = &self.extra else {
            return Ok(None);
        };

        let missing = |reason: String| OutputError::Persistence {
            artifact: format!("secret {name}"),
            source: reason.into(),
        };

        let secret = self
            .store
            .get::<Secret>(name)
            .await?
            .ok_or_else(|| missing("extra config secret not found".to_string()))?;
        let data = secret
            .data
            .get(key)
            .ok_or_else(|| missing(format!("key {key:?} not found")))?;

        Ok(Some(data.0.clone()))
    }

    async fn data(&self, rendered: Rendered) -> Result<BTreeMap<String, Vec<u8>>, OutputError> {
        let data = match rendered {
            Rendered::Single(content) => {
                let content = match self.extra_config().await? {
                    Some(extra) => append_extra(content, extra),
                    None => content.into_bytes(),
                };

                BTreeMap::from([(self.secret_key.clone(), content)])
            }
            Rendered::PerJob(jobs) => jobs
                .into_iter()
                .map(|(job, content)| {
                    (
                        artifact_name(&self.secret_key_pattern, &job),
                        content.into_bytes(),
                    )
                })
                .collect(),
        };

        Ok(data)
    }

    /// Keys this output may have written, in this or an earlier process. The
    /// extra config key is never owned, even when it lives in the same Secret.
    fn owns(&self, key: &str) -> bool {
        if let Some((name, extra_key)) = &self.extra {
            if *name == self.secret_name && extra_key == key {
                return false;
            }
        }

        key == self.secret_key || matches_pattern(&self.secret_key_pattern, key)
    }
}

/// Both parts are YAML lists, an empty generated list is dropped so the
/// result is still one list.
fn append_extra(content: String, extra: Vec<u8>) -> Vec<u8> {
    if extra.trim_ascii().is_empty() {
        return content.into_bytes();
    }

    let mut content = if content.trim() == "[]" {
        Vec::new()
    } else {
        content.into_bytes()
    };
    if !content.is_empty() && !content.ends_with(b"\n") {
        content.push(b'\n');
    }
    content.extend_from_slice(&extra);
    if !content.ends_with(b"\n") {
        content.push(b'\n');
    }

    content
}

#[async_trait]
impl<S: ObjectStore> Output for SecretOutput<S> {
    async fn write_output(&mut self, snapshot: &Snapshot) -> Result<(), OutputError> {
        let rendered = self.format.render(snapshot)?;
        let data = self.data(rendered).await?;
        let current = data.keys().cloned().collect::<BTreeSet<_>>();

        match self.store.get::<Secret>(&self.secret_name).await? {
            Some(mut secret) => {
                let stale = secret
                    .data
                    .keys()
                    .filter(|key| !current.contains(*key) && self.owns(key))
                    .chain(self.reconciler.stale(&current))
                    .cloned()
                    .collect::<BTreeSet<_>>();
                for key in stale {
                    if secret.data.remove(&key).is_some() {
                        info!(
                            message = "stale key removed",
                            secret = self.secret_name,
                            key = %key,
                        );
                    }
                }

                secret.data.extend(
                    data.into_iter()
                        .map(|(key, content)| (key, content.into())),
                );
                secret.metadata.labels.extend(
                    self.object_labels
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone())),
                );

                self.store.replace(&self.secret_name, &secret).await?;
                debug!(message = "secret updated", secret = self.secret_name);
            }
            None => {
                let secret = Secret {
                    metadata: ObjectMeta::named(&self.secret_name)
                        .with_labels(self.object_labels.clone()),
                    data: data
                        .into_iter()
                        .map(|(key, content)| (key, content.into()))
                        .collect(),
                    typ: Some("Opaque".to_string()),
                    ..Default::default()
                };

                self.store.create(&secret).await?;
                info!(
                    message = "secret created",
                    secret = self.secret_name,
                    namespace = self.store.namespace(),
                );
            }
        }

        self.reconciler.commit(current, []);

        Ok(())
    }
}
