mod client;
mod config;
mod resource;
mod store;
mod version;

pub use client::{Client, Error, ErrorResponse, ListParams};
pub use config::{Auth, Config};
pub use resource::endpoints::{EndpointAddress, EndpointPort, EndpointSubset, Endpoints};
pub use resource::secret::{ByteString, Secret};
pub use resource::service::{Service, ServicePort, ServiceSpec};
pub use resource::service_monitor::{
    Endpoint, LabelSelector, RelabelConfig, ServiceMonitor, ServiceMonitorSpec,
};
pub use resource::{ListMeta, ObjectList, ObjectMeta, Resource};
#[cfg(any(test, feature = "test-util"))]
pub use store::MemoryStore;
pub use store::ObjectStore;
pub use version::Version;
