#[macro_use]
extern crate tracing;

pub mod config;
pub mod http;
pub mod outputs;
pub mod poll;
pub mod puppetdb;
pub mod reconcile;
pub mod resource;
pub mod tls;
pub mod transform;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, Error>;

pub fn get_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
