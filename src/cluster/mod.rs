//! # Cluster Directory & Client Pool
//!
//! Selects the downstream cluster of a WlApp and hands out typed clients.
//!
//! ```text
//!   ClusterDirectory ── resolve_cluster(wl_app) ──▶ Cluster
//!          │
//!          ▼
//!     KubeClient ──▶ Transport ──┬─▶ HaTransport ──▶ HaEndpointPool ──▶ api servers
//!                                └─▶ MemoryApiServer (memory://)
//! ```

pub mod client;
pub mod directory;
pub mod loader;
pub mod memory;
pub mod namespace;
pub mod pool;
pub mod resources;
pub mod retry;
pub mod transport;

pub use client::{KubeClient, KubeError};
pub use directory::ClusterDirectory;
pub use loader::{load_clusters, parse_clusters};
pub use memory::{MemoryApiServer, PodScript};
pub use namespace::ensure_namespace;
pub use pool::{HaEndpointPool, PoolError, DEFAULT_COOLDOWN};
pub use resources::*;
pub use retry::{apply_with_retry, RetryPolicy};
pub use transport::{ApiRequest, ApiResponse, HaTransport, Method, Transport};
