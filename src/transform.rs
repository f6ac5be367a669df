use indexmap::IndexMap;

use crate::resource::{Resource, ScrapeConfig, Snapshot, StaticConfig};

const SCHEME_LABEL: &str = "__scheme__";
const SCHEME_PARAM_LABEL: &str = "__param__scheme";
const CERTNAME_LABEL: &str = "certname";

/// Group resources into scrape configs by job name, jobs keep the order they
/// are first seen in. Resources without targets are dropped.
///
/// When `proxy_url` is set, Prometheus dials the proxy over plain HTTP and the
/// real scheme is passed along as the `scheme` URL parameter.
pub fn transform(resources: &[Resource], proxy_url: Option<&str>) -> Snapshot {
    let proxy_url = proxy_url.filter(|url| !url.is_empty());
    let mut jobs = IndexMap::<&str, ScrapeConfig>::new();

    for resource in resources {
        if resource.targets.is_empty() {
            continue;
        }

        let scrape_config = jobs
            .entry(resource.job_name.as_str())
            .or_insert_with(|| ScrapeConfig {
                job_name: resource.job_name.clone(),
                proxy_url: proxy_url.map(ToString::to_string),
                static_configs: vec![],
            });

        let mut labels = resource.labels.clone();
        if proxy_url.is_some() {
            if let Some(scheme) = labels.get_mut(SCHEME_LABEL) {
                let scheme = std::mem::replace(scheme, "http".to_string());
                labels.insert(SCHEME_PARAM_LABEL.to_string(), scheme);
            }
        }
        labels.insert(CERTNAME_LABEL.to_string(), resource.certname.clone());

        scrape_config.static_configs.push(StaticConfig {
            targets: resource.targets.clone(),
            labels,
        });
    }

    jobs.into_values().collect()
}
