//! # Release Pipeline
//!
//! Drives a deployment through its phases:
//!
//! ```text
//!   preparation ──▶ build ──▶ pre_release ──▶ release
//!                     │           │              │
//!               builder pod   hook pod    apply + wait ready
//! ```
//!
//! Every phase records its state on the [`Deployment`](crate::models::Deployment).
//! Interruption is checked between phases and while waiting on pods or
//! readiness; whatever was applied before stays in place.

pub mod build;
pub mod deploy;
pub mod hook;
pub mod pods;
pub mod release;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use build::{builder_pod_name, output_image, BuildRequest, BUILDER_CATEGORY};
pub use deploy::DeployRequest;
pub use hook::{COMMAND_CATEGORY, HOOK_CATEGORY};

use crate::cluster::ClusterDirectory;
use crate::credentials::ImageCredentialManager;
use crate::error::{EngineError, EngineResult};
use crate::ingress::IngressSynchronizer;
use crate::scheduler::ProcessScheduler;
use crate::settings::Settings;
use crate::store::Store;
use crate::stream::StreamHub;

pub struct Pipeline {
    store: Arc<Store>,
    directory: Arc<ClusterDirectory>,
    settings: Arc<Settings>,
    streams: StreamHub,
    scheduler: Arc<ProcessScheduler>,
    ingress: Arc<IngressSynchronizer>,
    credentials: Arc<ImageCredentialManager>,
    /// Build slots per cluster name
    build_slots: DashMap<String, Arc<Semaphore>>,
    /// Cancellation of in-flight deployments
    cancellations: DashMap<Uuid, CancellationToken>,
}

impl Pipeline {
    pub fn new(
        store: Arc<Store>,
        directory: Arc<ClusterDirectory>,
        settings: Arc<Settings>,
        streams: StreamHub,
        scheduler: Arc<ProcessScheduler>,
        ingress: Arc<IngressSynchronizer>,
        credentials: Arc<ImageCredentialManager>,
    ) -> Self {
        Self {
            store,
            directory,
            settings,
            streams,
            scheduler,
            ingress,
            credentials,
            build_slots: DashMap::new(),
            cancellations: DashMap::new(),
        }
    }

    pub fn streams(&self) -> &StreamHub {
        &self.streams
    }

    fn build_slot(&self, cluster: &str) -> Arc<Semaphore> {
        let permits = self.settings.build.max_builds_per_cluster.max(1);
        self.build_slots
            .entry(cluster.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(permits)))
            .clone()
    }

    /// Token a running deployment observes
    fn cancel_token(&self, deployment_id: Uuid) -> CancellationToken {
        self.cancellations
            .entry(deployment_id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    fn release_token(&self, deployment_id: Uuid) {
        self.cancellations.remove(&deployment_id);
    }

    /// Fail with `Interrupted` once an interrupt was requested
    fn check_interrupt(&self, deployment_id: Uuid) -> EngineResult<()> {
        let deployment = self.store.deployments.get(&deployment_id)?;
        if deployment.interrupt_requested {
            return Err(EngineError::Interrupted(
                deployment
                    .interrupted_reason
                    .unwrap_or_else(|| "interrupted by user".to_string()),
            ));
        }
        Ok(())
    }
}
