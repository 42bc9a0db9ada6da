//! paas-engine: the workload control plane of a PaaS
//!
//! Turns application releases into Kubernetes workloads, keeps ingress
//! routes and image pull credentials in step, and exposes process control,
//! deployments and progress streams over HTTP.

pub mod cli;
pub mod cluster;
pub mod context;
pub mod credentials;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod events;
pub mod ingress;
pub mod models;
pub mod pipeline;
pub mod provision;
pub mod quota;
pub mod scheduler;
pub mod server;
pub mod settings;
pub mod store;
pub mod stream;
pub mod tasks;

#[cfg(test)]
mod test_support;

pub use engine::Engine;
pub use error::{EngineError, EngineResult};
