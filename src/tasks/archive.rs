//! Archive of a module environment
//!
//! Scales every process to zero, deletes the env's Ingresses and marks the
//! module env offlined. A later deployment brings it back.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::ingress::IngressSynchronizer;
use crate::models::{ArchiveOperation, JobStatus};
use crate::scheduler::ProcessScheduler;
use crate::store::Store;

pub struct Archiver {
    store: Arc<Store>,
    scheduler: Arc<ProcessScheduler>,
    ingress: Arc<IngressSynchronizer>,
}

impl Archiver {
    pub fn new(
        store: Arc<Store>,
        scheduler: Arc<ProcessScheduler>,
        ingress: Arc<IngressSynchronizer>,
    ) -> Self {
        Self {
            store,
            scheduler,
            ingress,
        }
    }

    /// Record a pending archive of the env behind `wl_app_id`
    pub async fn create_operation(&self, wl_app_id: Uuid, operator: &str) -> EngineResult<ArchiveOperation> {
        let wl_app = self.store.wl_apps.get(&wl_app_id)?;
        let _guard = self.store.lock_app(wl_app_id).await;
        if let Some(running) = self.store.running_deployment(wl_app_id) {
            return Err(EngineError::conflict(
                "DEPLOYMENT_IN_PROGRESS",
                format!("deployment {} is in progress", running.id),
            ));
        }
        let now = Utc::now();
        let operation = self.store.archive_operations.insert(ArchiveOperation {
            id: Uuid::new_v4(),
            wl_app_id,
            status: JobStatus::Pending,
            error: None,
            operator: operator.to_string(),
            tenant_id: wl_app.tenant_id,
            created: now,
            updated: now,
        })?;
        Ok(operation)
    }

    /// Take the env offline; finished operations are returned unchanged
    #[tracing::instrument(skip(self))]
    pub async fn run(&self, wl_app_id: Uuid, operation_id: Uuid) -> EngineResult<ArchiveOperation> {
        let operation = self.store.archive_operations.get(&operation_id)?;
        if operation.wl_app_id != wl_app_id {
            return Err(EngineError::field("operation_id", "operation belongs to another app"));
        }
        if operation.status.is_terminal() {
            return Ok(operation);
        }

        match self.offline(wl_app_id).await {
            Ok(()) => Ok(self
                .store
                .archive_operations
                .update(&operation_id, |o| o.status = JobStatus::Successful)?),
            Err(e) => {
                tracing::warn!(wl_app = %wl_app_id, "archive failed: {}", e);
                self.store.archive_operations.update(&operation_id, |o| {
                    o.status = JobStatus::Failed;
                    o.error = Some(e.to_string());
                })?;
                Err(e)
            }
        }
    }

    async fn offline(&self, wl_app_id: Uuid) -> EngineResult<()> {
        let scaled = self.scheduler.scale_all_to_zero(wl_app_id).await?;
        let removed = self.ingress.delete_all(wl_app_id).await?;
        let module_env = self.store.module_env_of_wl_app(wl_app_id)?;
        self.store
            .module_envs
            .update(&module_env.id, |e| e.is_offlined = true)?;
        tracing::info!(wl_app = %wl_app_id, scaled, ingresses = removed, "env archived");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::ingress::PluginChain;
    use crate::test_support::TestEnv;

    fn archiver(env: &TestEnv) -> (Archiver, Arc<IngressSynchronizer>) {
        let ingress = Arc::new(IngressSynchronizer::new(
            env.store.clone(),
            env.directory.clone(),
            env.cipher.clone(),
            PluginChain::default(),
        ));
        (
            Archiver::new(env.store.clone(), Arc::new(env.scheduler()), ingress.clone()),
            ingress,
        )
    }

    #[tokio::test]
    async fn test_archive_scales_down_and_removes_routes() {
        let env = TestEnv::new();
        let release = env.release(&[("web", "gunicorn")], "registry/foo:1");
        env.scheduler()
            .apply_release(&release, &BTreeMap::new())
            .await
            .unwrap();
        let (archiver, ingress) = archiver(&env);
        ingress.sync_all(env.wl_app.id).await.unwrap();
        let namespace = env.wl_app.namespace();
        assert!(!env.server.objects("ingresses", &namespace).is_empty());

        let operation = archiver
            .create_operation(env.wl_app.id, "tester")
            .await
            .unwrap();
        let done = archiver.run(env.wl_app.id, operation.id).await.unwrap();

        assert_eq!(done.status, JobStatus::Successful);
        assert!(env.server.objects("ingresses", &namespace).is_empty());
        for deployment in env.server.objects("deployments", &namespace) {
            assert_eq!(deployment["spec"]["replicas"], 0);
        }
        assert!(env.store.module_envs.get(&env.module_env.id).unwrap().is_offlined);

        // A second run is a no-op
        let again = archiver.run(env.wl_app.id, operation.id).await.unwrap();
        assert_eq!(again.updated, done.updated);
    }

    #[tokio::test]
    async fn test_archive_refused_while_deploying() {
        let env = TestEnv::new();
        env.start_deployment();
        let (archiver, _) = archiver(&env);
        let err = archiver
            .create_operation(env.wl_app.id, "tester")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DEPLOYMENT_IN_PROGRESS");
    }
}
