use serde::{Deserialize, Serialize};

use super::{ObjectMeta, Resource};

fn default_protocol() -> String {
    String::from("TCP")
}

/// ServicePort is k8s service port.
///
/// See https://kubernetes.io/docs/reference/generated/kubernetes-api/v1.31/#serviceport-v1-core
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ServicePort {
    /// The name of this port within the service. This must be a DNS_LABEL. When
    /// considering the endpoints for a Service, this must match the 'name' field
    /// in the EndpointPort.
    #[serde(default)]
    pub name: String,

    /// The IP protocol for this port. Supports "TCP", "UDP", and "SCTP". Default is TCP.
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// The port that will be exposed by this service.
    pub port: u16,
}

/// ServiceSpec is k8s service spec.
///
/// See https://kubernetes.io/docs/reference/generated/kubernetes-api/v1.31/#servicespec-v1-core
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// type determines how the Service is exposed. Defaults to ClusterIP. Valid options
    /// are ExternalName, ClusterIP, NodePort, and LoadBalancer. "ExternalName" aliases
    /// this service to the specified externalName.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,

    /// externalName is the external reference that discovery mechanisms will return
    /// as an alias for this service (e.g. a DNS CNAME record). No proxying will be
    /// involved. Requires `type` to be "ExternalName".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_name: Option<String>,

    /// The list of ports that are exposed by this service.
    #[serde(default)]
    pub ports: Vec<ServicePort>,

    /// Fields set by the API server or other controllers, e.g. `sessionAffinity`.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Service is k8s service.
///
/// See https://kubernetes.io/docs/reference/generated/kubernetes-api/v1.31/#service-v1-core
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Service {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ServiceSpec,
}

impl Resource for Service {
    const GROUP: &'static str = "";
    const VERSION: &'static str = "v1";
    const KIND: &'static str = "Service";
    const PLURAL: &'static str = "services";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_external_name() {
        let input = r#"
{
  "apiVersion": "v1",
  "kind": "Service",
  "metadata": {
    "name": "puppetdb-db-example-com-9100",
    "namespace": "monitoring",
    "resourceVersion": "42",
    "labels": { "prometheus-puppetdb": "true" }
  },
  "spec": {
    "type": "ExternalName",
    "externalName": "db.example.com",
    "sessionAffinity": "None",
    "ports": [
      { "name": "puppetdb-db-example-com-9100", "port": 9100, "protocol": "TCP", "targetPort": 9100 }
    ]
  }
}"#;

        let service = serde_json::from_str::<Service>(input).unwrap();
        assert_eq!(service.spec.typ.as_deref(), Some("ExternalName"));
        assert_eq!(service.spec.external_name.as_deref(), Some("db.example.com"));
        assert_eq!(service.spec.ports[0].port, 9100);
        assert_eq!(service.spec.extra["sessionAffinity"], "None");
        assert_eq!(
            service.metadata.labels.get("prometheus-puppetdb").map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn url() {
        assert_eq!(
            Service::url_path(Some("monitoring")),
            "/api/v1/namespaces/monitoring/services"
        );
    }
}
