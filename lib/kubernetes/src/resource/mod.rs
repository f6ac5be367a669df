pub mod endpoints;
pub mod metadata;
pub mod secret;
pub mod service;
pub mod service_monitor;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use metadata::{ListMeta, ObjectMeta};

/// An accessor trait for a kubernetes Resource.
pub trait Resource: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The group of the resource, or the empty string if the resource doesn't have a
    /// group.
    const GROUP: &'static str;

    /// The version of the resource.
    const VERSION: &'static str;

    /// The kind of the resource, it is sent as `kind` on create and update.
    const KIND: &'static str;

    /// The plural of this resource, which is used to construct URLS
    const PLURAL: &'static str;

    fn metadata(&self) -> &ObjectMeta;

    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// The `apiVersion` field of this resource, e.g. `v1` or `monitoring.coreos.com/v1`
    fn api_version() -> String {
        if Self::GROUP.is_empty() {
            Self::VERSION.to_string()
        } else {
            format!("{}/{}", Self::GROUP, Self::VERSION)
        }
    }

    /// Creates a url path for http requests for this resource
    fn url_path(namespace: Option<&str>) -> String {
        let group = if Self::GROUP.is_empty() {
            "api"
        } else {
            "apis"
        };
        let api_version = Self::api_version();
        let namespace = match namespace {
            Some(namespace) => format!("namespaces/{}/", namespace),
            None => String::new(),
        };
        let plural = Self::PLURAL;

        format!("/{group}/{api_version}/{namespace}{plural}")
    }

    /// Creates a url path for http requests which address a single object
    fn object_path(namespace: Option<&str>, name: &str) -> String {
        format!("{}/{}", Self::url_path(namespace), name)
    }
}

/// A generic Kubernetes object list
///
/// This is used instead of a full struct for `EndpointsList`, `ServiceList`, etc.
#[derive(Deserialize)]
pub struct ObjectList<T> {
    /// ListMeta - only really used for its `continue` token
    #[serde(default)]
    pub metadata: ListMeta,

    /// These items we are actually interested in.
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}
