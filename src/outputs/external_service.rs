use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use kubernetes::{
    Endpoint, EndpointAddress, EndpointPort, EndpointSubset, Endpoints, LabelSelector, ObjectMeta,
    ObjectStore, RelabelConfig, Resource, Service, ServiceMonitor, ServiceMonitorSpec,
    ServicePort, ServiceSpec,
};
use serde::{Deserialize, Serialize};

use super::secret::default_object_labels;
use super::{Output, OutputError};
use crate::reconcile::Reconciler;
use crate::resource::Snapshot;

/// Every Endpoints and Service this output manages carries this label with
/// the value `true`.
const DISCRIMINATOR: &str = "prometheus-puppetdb";

fn default_service_monitor_name() -> String {
    "prometheus-puppetdb".to_string()
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExternalServiceConfig {
    /// Defaults to the namespace of the kube config.
    #[serde(default)]
    pub namespace: Option<String>,

    /// Labels set on every created object, the ServiceMonitor included.
    #[serde(default = "default_object_labels")]
    pub object_labels: BTreeMap<String, String>,

    #[serde(default = "default_service_monitor_name")]
    pub service_monitor_name: String,
}

impl Default for ExternalServiceConfig {
    fn default() -> Self {
        ExternalServiceConfig {
            namespace: None,
            object_labels: default_object_labels(),
            service_monitor_name: default_service_monitor_name(),
        }
    }
}

/// Resolves host names to IPv4 addresses.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> io::Result<Ipv4Addr>;
}

/// Resolver backed by the system resolver, the first IPv4 address wins.
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> io::Result<Ipv4Addr> {
        tokio::net::lookup_host((host, 0))
            .await?
            .find_map(|addr| match addr.ip() {
                IpAddr::V4(ip) => Some(ip),
                IpAddr::V6(_) => None,
            })
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no IPv4 address found for {host}"),
                )
            })
    }
}

/// Split `address[:port]`, the port defaults to the one of the scheme.
fn split_target<'a>(target: &'a str, scheme: Option<&str>) -> Result<(&'a str, u16), String> {
    match target.rsplit_once(':') {
        Some((address, port)) => port
            .parse::<u16>()
            .map(|port| (address, port))
            .map_err(|err| format!("invalid port {port:?}, {err}")),
        None => {
            let port = if scheme == Some("https") { 443 } else { 80 };
            Ok((target, port))
        }
    }
}

/// Longest name of a Service, which must be a DNS label.
const MAX_NAME_LEN: usize = 63;

/// Name of the Endpoints and Service of a target. Host names are lower cased
/// and every character a DNS label cannot hold becomes `-`. `None` when the
/// result is longer than a DNS label.
fn object_name(address: &str, port: u16) -> Option<String> {
    let address = address
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9') => c,
            _ => '-',
        })
        .collect::<String>();
    let name = format!("puppetdb-{}-{}", address.trim_matches('-'), port);

    (name.len() <= MAX_NAME_LEN).then_some(name)
}

/// Mirrors every target as an `ExternalName` Service with a manually managed
/// Endpoints object, and one ServiceMonitor which selects all of them, so
/// prometheus-operator scrapes targets outside the cluster.
pub struct ExternalServiceOutput<S, R> {
    store: S,
    resolver: R,
    object_labels: BTreeMap<String, String>,
    service_monitor_name: String,
    reconciler: Reconciler<String>,
}

impl<S: ObjectStore, R: Resolver> ExternalServiceOutput<S, R> {
    pub fn new(store: S, config: &ExternalServiceConfig, resolver: R) -> Self {
        ExternalServiceOutput {
            store,
            resolver,
            object_labels: config.object_labels.clone(),
            service_monitor_name: config.service_monitor_name.clone(),
            reconciler: Reconciler::default(),
        }
    }

    fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.object_labels.clone();
        labels.insert(DISCRIMINATOR.to_string(), "true".to_string());
        labels
    }

    fn selector() -> String {
        format!("{DISCRIMINATOR}=true")
    }

    async fn resolve(&self, address: &str) -> io::Result<Ipv4Addr> {
        match address.parse::<Ipv4Addr>() {
            Ok(ip) => Ok(ip),
            Err(_) => self.resolver.resolve(address).await,
        }
    }

    async fn upsert_endpoints(
        &self,
        name: &str,
        ip: Ipv4Addr,
        port: u16,
    ) -> Result<(), kubernetes::Error> {
        let ip = ip.to_string();
        let desired = EndpointSubset {
            addresses: vec![EndpointAddress {
                ip: ip.clone(),
                ..Default::default()
            }],
            not_ready_addresses: vec![],
            ports: vec![EndpointPort {
                name: name.to_string(),
                port,
                protocol: "TCP".to_string(),
            }],
        };

        match self.store.get::<Endpoints>(name).await? {
            Some(mut existing) => {
                let unchanged = existing.first_address().is_some_and(|(current, current_port)| {
                    current == ip && current_port.port == port && current_port.name == name
                }) && existing.metadata.labels.get(DISCRIMINATOR).map(String::as_str)
                    == Some("true");
                if unchanged {
                    return Ok(());
                }

                existing.subsets = vec![desired];
                existing.metadata.labels.extend(self.labels());
                self.store.replace(name, &existing).await?;
                info!(message = "endpoints updated", name, %ip, port);
            }
            None => {
                let endpoints = Endpoints {
                    metadata: ObjectMeta::named(name).with_labels(self.labels()),
                    subsets: vec![desired],
                };

                self.store.create(&endpoints).await?;
                info!(message = "endpoints created", name, %ip, port);
            }
        }

        Ok(())
    }

    async fn upsert_service(
        &self,
        name: &str,
        address: &str,
        port: u16,
    ) -> Result<(), kubernetes::Error> {
        let ports = vec![ServicePort {
            name: name.to_string(),
            protocol: "TCP".to_string(),
            port,
        }];

        match self.store.get::<Service>(name).await? {
            Some(mut existing) => {
                let unchanged = existing.spec.external_name.as_deref() == Some(address)
                    && existing
                        .spec
                        .ports
                        .first()
                        .is_some_and(|current| current.port == port && current.name == name)
                    && existing.metadata.labels.get(DISCRIMINATOR).map(String::as_str)
                        == Some("true");
                if unchanged {
                    return Ok(());
                }

                // fields set by the API server stay as they are
                existing.spec.typ = Some("ExternalName".to_string());
                existing.spec.external_name = Some(address.to_string());
                existing.spec.ports = ports;
                existing.metadata.labels.extend(self.labels());
                self.store.replace(name, &existing).await?;
                info!(message = "service updated", name, address, port);
            }
            None => {
                let service = Service {
                    metadata: ObjectMeta::named(name).with_labels(self.labels()),
                    spec: ServiceSpec {
                        typ: Some("ExternalName".to_string()),
                        external_name: Some(address.to_string()),
                        ports,
                        ..Default::default()
                    },
                };

                self.store.create(&service).await?;
                info!(message = "service created", name, address, port);
            }
        }

        Ok(())
    }

    /// Delete every labeled object of the kind which is not desired anymore.
    async fn cleanup<K: Resource>(&self, desired: &BTreeSet<String>) {
        let objects = match self.store.list::<K>(&Self::selector()).await {
            Ok(objects) => objects,
            Err(err) => {
                error!(
                    message = "list objects failed, skip cleanup",
                    kind = K::KIND,
                    %err,
                );
                return;
            }
        };

        for obj in objects {
            let name = &obj.metadata().name;
            if desired.contains(name) {
                continue;
            }

            match self.store.delete::<K>(name).await {
                Ok(()) => info!(message = "object deleted", kind = K::KIND, name),
                Err(err) if err.is_not_found() => {}
                Err(err) => error!(
                    message = "delete object failed",
                    kind = K::KIND,
                    name,
                    %err,
                ),
            }
        }
    }

    async fn upsert_service_monitor(
        &self,
        endpoints: Vec<Endpoint>,
    ) -> Result<(), kubernetes::Error> {
        let selector = LabelSelector {
            match_labels: BTreeMap::from([(DISCRIMINATOR.to_string(), "true".to_string())]),
        };

        match self
            .store
            .get::<ServiceMonitor>(&self.service_monitor_name)
            .await?
        {
            Some(mut existing) => {
                if existing.spec.selector == selector && existing.spec.endpoints == endpoints {
                    return Ok(());
                }

                // other spec fields may be managed by someone else
                existing.spec.selector = selector;
                existing.spec.endpoints = endpoints;
                existing.metadata.labels.extend(
                    self.object_labels
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone())),
                );
                self.store
                    .replace(&self.service_monitor_name, &existing)
                    .await?;
                info!(
                    message = "service monitor updated",
                    name = self.service_monitor_name,
                    endpoints = existing.spec.endpoints.len(),
                );
            }
            None => {
                let sm = ServiceMonitor {
                    metadata: ObjectMeta::named(&self.service_monitor_name)
                        .with_labels(self.object_labels.clone()),
                    spec: ServiceMonitorSpec {
                        selector,
                        endpoints,
                        ..Default::default()
                    },
                };

                self.store.create(&sm).await?;
                info!(
                    message = "service monitor created",
                    name = self.service_monitor_name,
                    endpoints = sm.spec.endpoints.len(),
                );
            }
        }

        Ok(())
    }
}

#[async_trait]
impl<S: ObjectStore, R: Resolver> Output for ExternalServiceOutput<S, R> {
    async fn write_output(&mut self, snapshot: &Snapshot) -> Result<(), OutputError> {
        let mut names = BTreeSet::new();
        let mut endpoints = vec![];

        for sc in snapshot.iter().flat_map(|sc| &sc.static_configs) {
            let scheme = sc.labels.get("scheme").map(String::as_str);
            let relabelings = sc
                .labels
                .iter()
                .map(|(key, value)| RelabelConfig {
                    target_label: Some(key.clone()),
                    replacement: Some(value.clone()),
                })
                .collect::<Vec<_>>();

            for target in &sc.targets {
                let (address, port) = match split_target(target, scheme) {
                    Ok(split) => split,
                    Err(err) => {
                        warn!(message = "skip invalid target", target, %err);
                        continue;
                    }
                };

                let Some(name) = object_name(address, port) else {
                    warn!(
                        message = "skip target, its object name is longer than a DNS label",
                        target,
                        max = MAX_NAME_LEN,
                    );
                    continue;
                };
                if !names.insert(name.clone()) {
                    continue;
                }

                let ip = match self.resolve(address).await {
                    Ok(ip) => ip,
                    Err(err) => {
                        warn!(message = "resolve target failed", target, %err);
                        continue;
                    }
                };

                if let Err(err) = self.upsert_endpoints(&name, ip, port).await {
                    error!(message = "upsert endpoints failed", name, %err);
                    continue;
                }

                if let Err(err) = self.upsert_service(&name, address, port).await {
                    error!(message = "upsert service failed", name, %err);
                    continue;
                }

                endpoints.push(Endpoint {
                    port: Some(name),
                    scheme: scheme.map(ToString::to_string),
                    path: sc.labels.get("metrics_path").cloned(),
                    honor_labels: true,
                    metric_relabelings: relabelings.clone(),
                });
            }
        }

        self.cleanup::<Endpoints>(&names).await;
        self.cleanup::<Service>(&names).await;

        if let Err(err) = self.upsert_service_monitor(endpoints).await {
            error!(
                message = "upsert service monitor failed",
                name = self.service_monitor_name,
                %err,
            );
        }

        for name in self.reconciler.stale(&names) {
            info!(message = "target removed", name);
        }
        self.reconciler.commit(names, []);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use kubernetes::MemoryStore;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::outputs::tests::static_config;
    use crate::resource::{ScrapeConfig, StaticConfig};

    struct StaticResolver(BTreeMap<&'static str, Ipv4Addr>);

    #[async_trait]
    impl Resolver for StaticResolver {
        async fn resolve(&self, host: &str) -> io::Result<Ipv4Addr> {
            self.0
                .get(host)
                .copied()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, host.to_string()))
        }
    }

    fn output() -> ExternalServiceOutput<MemoryStore, StaticResolver> {
        let resolver = StaticResolver(BTreeMap::from([(
            "db.example.com",
            Ipv4Addr::new(10, 0, 0, 2),
        )]));

        ExternalServiceOutput::new(
            MemoryStore::new("monitoring"),
            &ExternalServiceConfig::default(),
            resolver,
        )
    }

    fn snapshot(static_configs: Vec<StaticConfig>) -> Snapshot {
        vec![ScrapeConfig {
            job_name: "mysql".into(),
            proxy_url: None,
            static_configs,
        }]
    }

    fn service_monitor(store: &MemoryStore) -> ServiceMonitor {
        store.object::<ServiceMonitor>("prometheus-puppetdb").unwrap()
    }

    #[test]
    fn split() {
        assert_eq!(split_target("10.0.0.1:9103", None), Ok(("10.0.0.1", 9103)));
        assert_eq!(split_target("db.example.com", None), Ok(("db.example.com", 80)));
        assert_eq!(
            split_target("db.example.com", Some("https")),
            Ok(("db.example.com", 443))
        );
        assert!(split_target("db.example.com:http", None).is_err());
        assert!(split_target("db.example.com:70000", None).is_err());
    }

    #[test]
    fn names() {
        let tests = [
            ("10.0.0.1", 9103, Some("puppetdb-10-0-0-1-9103")),
            ("db.example.com", 80, Some("puppetdb-db-example-com-80")),
            ("DB01.Example.COM", 9100, Some("puppetdb-db01-example-com-9100")),
            ("db_01.example.com.", 9100, Some("puppetdb-db-01-example-com-9100")),
            (
                "a-very-long-host-name-of-the-storage-cluster.dc1.example.com",
                9100,
                None,
            ),
        ];

        for (address, port, want) in tests {
            assert_eq!(object_name(address, port).as_deref(), want, "{address}");
        }
    }

    #[tokio::test]
    async fn unrepresentable_names_skipped() {
        let mut output = ExternalServiceOutput::new(
            MemoryStore::new("monitoring"),
            &ExternalServiceConfig::default(),
            StaticResolver(BTreeMap::from([(
                "DB.example.com",
                Ipv4Addr::new(10, 0, 0, 2),
            )])),
        );
        let long = "a-very-long-host-name-of-the-storage-cluster.dc1.example.com:9100";

        output
            .write_output(&snapshot(vec![
                static_config("10.0.0.1:9103", &[]),
                static_config(long, &[]),
                static_config("DB.example.com:9100", &[]),
            ]))
            .await
            .unwrap();

        assert_eq!(
            output.store.names::<Service>(),
            ["puppetdb-10-0-0-1-9103", "puppetdb-db-example-com-9100"]
        );
        assert_eq!(service_monitor(&output.store).spec.endpoints.len(), 2);
    }

    #[tokio::test]
    async fn foreign_fields_survive_updates() {
        let mut output = output();
        let mut sm = ServiceMonitor {
            metadata: ObjectMeta::named("prometheus-puppetdb"),
            ..Default::default()
        };
        sm.metadata
            .extra
            .insert("finalizers".into(), serde_json::json!(["example.com/keep"]));
        sm.spec
            .extra
            .insert("jobLabel".into(), serde_json::json!("app"));
        output.store.insert(sm);

        let name = "puppetdb-10-0-0-1-9103";
        let mut service = Service {
            metadata: ObjectMeta::named(name),
            ..Default::default()
        };
        service
            .spec
            .extra
            .insert("sessionAffinity".into(), serde_json::json!("None"));
        output.store.insert(service);

        output
            .write_output(&snapshot(vec![static_config("10.0.0.1:9103", &[])]))
            .await
            .unwrap();

        let sm = service_monitor(&output.store);
        assert_eq!(sm.spec.endpoints.len(), 1);
        assert_eq!(sm.spec.extra["jobLabel"], "app");
        assert_eq!(sm.metadata.extra["finalizers"][0], "example.com/keep");

        let service = output.store.object::<Service>(name).unwrap();
        assert_eq!(service.spec.external_name.as_deref(), Some("10.0.0.1"));
        assert_eq!(service.spec.extra["sessionAffinity"], "None");
    }

    #[tokio::test]
    async fn created_then_removed() {
        let mut output = output();
        let labels: &[(&str, &str)] = &[
            ("certname", "db1"),
            ("metrics_path", "/metrics"),
            ("scheme", "http"),
        ];

        output
            .write_output(&snapshot(vec![static_config("10.0.0.1:9103", labels)]))
            .await
            .unwrap();

        let name = "puppetdb-10-0-0-1-9103";
        assert_eq!(output.store.names::<Endpoints>(), [name]);
        assert_eq!(output.store.names::<Service>(), [name]);

        let endpoints = output.store.object::<Endpoints>(name).unwrap();
        let (ip, port) = endpoints.first_address().unwrap();
        assert_eq!(ip, "10.0.0.1");
        assert_eq!(port.port, 9103);
        assert_eq!(port.name, name);
        assert_eq!(endpoints.metadata.labels[DISCRIMINATOR], "true");

        let service = output.store.object::<Service>(name).unwrap();
        assert_eq!(service.spec.typ.as_deref(), Some("ExternalName"));
        assert_eq!(service.spec.external_name.as_deref(), Some("10.0.0.1"));
        assert_eq!(service.spec.ports[0].port, 9103);

        let sm = service_monitor(&output.store);
        assert_eq!(sm.metadata.labels, default_object_labels());
        assert_eq!(sm.spec.selector.match_labels[DISCRIMINATOR], "true");
        assert_eq!(
            sm.spec.endpoints,
            vec![Endpoint {
                port: Some(name.to_string()),
                scheme: Some("http".into()),
                path: Some("/metrics".into()),
                honor_labels: true,
                metric_relabelings: labels
                    .iter()
                    .map(|(k, v)| RelabelConfig {
                        target_label: Some(k.to_string()),
                        replacement: Some(v.to_string()),
                    })
                    .collect(),
            }]
        );

        output.write_output(&vec![]).await.unwrap();
        assert!(output.store.names::<Endpoints>().is_empty());
        assert!(output.store.names::<Service>().is_empty());
        assert!(service_monitor(&output.store).spec.endpoints.is_empty());
        assert!(output.reconciler.previous().is_empty());
    }

    #[tokio::test]
    async fn unchanged_means_no_writes() {
        let mut output = output();
        let snapshot = snapshot(vec![
            static_config("10.0.0.1:9103", &[("certname", "db1")]),
            static_config("db.example.com", &[("certname", "db2")]),
        ]);

        output.write_output(&snapshot).await.unwrap();
        // endpoints and services of two targets, and the service monitor
        assert_eq!(output.store.writes(), 5);

        output.write_output(&snapshot).await.unwrap();
        assert_eq!(output.store.writes(), 5);
    }

    #[tokio::test]
    async fn changed_address_updated() {
        let mut output = output();
        output
            .write_output(&snapshot(vec![static_config("db.example.com:9104", &[])]))
            .await
            .unwrap();

        output.resolver.0.insert("db.example.com", Ipv4Addr::new(10, 0, 0, 3));
        output
            .write_output(&snapshot(vec![static_config("db.example.com:9104", &[])]))
            .await
            .unwrap();

        let endpoints = output
            .store
            .object::<Endpoints>("puppetdb-db-example-com-9104")
            .unwrap();
        assert_eq!(endpoints.first_address().unwrap().0, "10.0.0.3");
    }

    #[tokio::test]
    async fn duplicates_handled_once() {
        let mut output = output();
        output
            .write_output(&snapshot(vec![
                static_config("10.0.0.1:9103", &[("certname", "db1")]),
                static_config("10.0.0.1:9103", &[("certname", "db1-alias")]),
            ]))
            .await
            .unwrap();

        assert_eq!(service_monitor(&output.store).spec.endpoints.len(), 1);
    }

    #[tokio::test]
    async fn failures_isolated() {
        let mut output = output();
        let snapshot = snapshot(vec![
            static_config("10.0.0.1:9103", &[]),
            static_config("10.0.0.2:9103", &[]),
            static_config("10.0.0.3:bad", &[]),
            static_config("unknown.example.com:9103", &[]),
        ]);

        output.store.fail_on("puppetdb-10-0-0-1-9103");
        output.write_output(&snapshot).await.unwrap();

        assert_eq!(
            output.store.names::<Endpoints>(),
            ["puppetdb-10-0-0-2-9103"]
        );
        let sm = service_monitor(&output.store);
        assert_eq!(sm.spec.endpoints.len(), 1);
        assert_eq!(
            sm.spec.endpoints[0].port.as_deref(),
            Some("puppetdb-10-0-0-2-9103")
        );

        // unresolvable targets are still desired
        assert!(
            output
                .reconciler
                .previous()
                .contains("puppetdb-unknown-example-com-9103")
        );

        output.store.recover("puppetdb-10-0-0-1-9103");
        output.write_output(&snapshot).await.unwrap();
        assert_eq!(
            output.store.names::<Endpoints>(),
            ["puppetdb-10-0-0-1-9103", "puppetdb-10-0-0-2-9103"]
        );
        assert_eq!(service_monitor(&output.store).spec.endpoints.len(), 2);
    }

    #[tokio::test]
    async fn leftovers_of_previous_process_removed() {
        let store = MemoryStore::new("monitoring");
        let labels = BTreeMap::from([(DISCRIMINATOR.to_string(), "true".to_string())]);
        store.insert(Service {
            metadata: ObjectMeta::named("puppetdb-old-9100").with_labels(labels),
            spec: ServiceSpec::default(),
        });
        store.insert(Service {
            metadata: ObjectMeta::named("unrelated"),
            spec: ServiceSpec::default(),
        });

        let mut output = ExternalServiceOutput::new(
            store,
            &ExternalServiceConfig::default(),
            StaticResolver(BTreeMap::new()),
        );
        output.write_output(&vec![]).await.unwrap();

        assert_eq!(output.store.names::<Service>(), ["unrelated"]);
    }
}
