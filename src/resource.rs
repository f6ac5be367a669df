use std::collections::BTreeMap;
use std::fmt::Formatter;

use serde::de::{Error, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

/// Label set of a target, the sorted key order keeps rendered output stable.
pub type Labels = BTreeMap<String, String>;

/// All scrape configs produced by one poll.
pub type Snapshot = Vec<ScrapeConfig>;

/// A monitorable target exported by a Puppet node, e.g. a `prometheus::scrape_job`
/// resource.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(from = "RawResource")]
pub struct Resource {
    pub certname: String,
    pub job_name: String,
    pub targets: Vec<String>,
    pub labels: Labels,
}

/// The shape PuppetDB returns for `resources[certname, parameters]`.
#[derive(Deserialize)]
struct RawResource {
    certname: String,
    parameters: Parameters,
}

#[derive(Deserialize)]
struct Parameters {
    job_name: String,
    #[serde(default, deserialize_with = "deserialize_targets")]
    targets: Vec<String>,
    #[serde(default)]
    labels: Option<Labels>,
}

impl From<RawResource> for Resource {
    fn from(raw: RawResource) -> Self {
        Resource {
            certname: raw.certname,
            job_name: raw.parameters.job_name,
            targets: raw.parameters.targets,
            labels: raw.parameters.labels.unwrap_or_default(),
        }
    }
}

/// Targets can be a single string, a list of strings, or a list of exporter
/// records carrying the target in `url`. The last two shapes come from older
/// versions of the puppet module.
fn deserialize_targets<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    struct TargetsVisitor;

    impl<'de> Visitor<'de> for TargetsVisitor {
        type Value = Vec<String>;

        fn expecting(&self, f: &mut Formatter) -> std::fmt::Result {
            f.write_str("a target string, a list of target strings or a list of exporters")
        }

        fn visit_str<E: Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(vec![v.to_string()])
        }

        fn visit_unit<E: Error>(self) -> Result<Self::Value, E> {
            Ok(vec![])
        }

        fn visit_none<E: Error>(self) -> Result<Self::Value, E> {
            Ok(vec![])
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut targets = Vec::with_capacity(seq.size_hint().unwrap_or_default());
            while let Some(Target(target)) = seq.next_element()? {
                targets.push(target);
            }

            Ok(targets)
        }
    }

    deserializer.deserialize_any(TargetsVisitor)
}

/// One element of a targets list.
struct Target(String);

impl<'de> Deserialize<'de> for Target {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TargetVisitor;

        impl<'de> Visitor<'de> for TargetVisitor {
            type Value = Target;

            fn expecting(&self, f: &mut Formatter) -> std::fmt::Result {
                f.write_str("a target string or an exporter with url")
            }

            fn visit_str<E: Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(Target(v.to_string()))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut url = None;
                while let Some(key) = map.next_key::<String>()? {
                    if key.eq_ignore_ascii_case("url") {
                        url = Some(map.next_value::<String>()?);
                    } else {
                        map.next_value::<serde::de::IgnoredAny>()?;
                    }
                }

                url.map(Target).ok_or_else(|| A::Error::missing_field("url"))
            }
        }

        deserializer.deserialize_any(TargetVisitor)
    }
}

/// Prometheus `static_config`
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct StaticConfig {
    pub targets: Vec<String>,
    pub labels: Labels,
}

/// Prometheus `scrape_config`, only the fields this tool manages.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ScrapeConfig {
    pub job_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    pub static_configs: Vec<StaticConfig>,
}
