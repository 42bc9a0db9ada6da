//! Release manager and readiness waiter

use std::collections::BTreeMap;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::Pipeline;
use crate::credentials::discover_refs;
use crate::error::{EngineError, EngineResult};
use crate::models::{Build, Release};
use crate::scheduler::{validate_procfile, ApplyReport};

impl Pipeline {
    /// Persist the next release of `build`
    ///
    /// Versions are allocated under the app lock, starting at 1.
    pub async fn create_release(
        &self,
        wl_app_id: Uuid,
        build: &Build,
        operator: &str,
        summary: &str,
    ) -> EngineResult<Release> {
        if build.wl_app_id != wl_app_id {
            return Err(EngineError::field("build_id", "build belongs to another app"));
        }
        let procfile = validate_procfile(
            &build
                .procfile
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Vec<_>>(),
        )?;

        let _guard = self.store.lock_app(wl_app_id).await;
        let config = self.store.latest_config(wl_app_id)?;
        let now = Utc::now();
        let release = self.store.releases.insert(Release {
            id: Uuid::new_v4(),
            wl_app_id,
            version: self.store.next_release_version(wl_app_id),
            build_id: build.id,
            config_id: config.id,
            procfile,
            summary: summary.to_string(),
            failed: false,
            failure_reason: None,
            operator: operator.to_string(),
            tenant_id: build.tenant_id.clone(),
            created: now,
            updated: now,
        })?;
        tracing::info!(wl_app = %wl_app_id, version = release.version, "release created");
        Ok(release)
    }

    /// Release `build`: flush credentials, apply workloads, wait until ready
    ///
    /// A release that fails to apply or become ready is marked failed.
    #[tracing::instrument(skip(self, build, extras, cancel), fields(build = %build.id))]
    pub async fn release_build(
        &self,
        wl_app_id: Uuid,
        build: &Build,
        extras: &BTreeMap<String, String>,
        operator: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<(Release, ApplyReport)> {
        let release = self
            .create_release(wl_app_id, build, operator, "")
            .await?;
        match self.rollout(&release, build, extras, cancel).await {
            Ok(report) => Ok((release, report)),
            Err(e) => {
                self.store.releases.update(&release.id, |r| {
                    r.failed = true;
                    r.failure_reason = Some(e.to_string());
                })?;
                Err(e)
            }
        }
    }

    async fn rollout(
        &self,
        release: &Release,
        build: &Build,
        extras: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> EngineResult<ApplyReport> {
        self.flush_image_credentials(release.wl_app_id, &build.image)
            .await?;
        let report = self.scheduler.apply_release(release, extras).await?;
        self.wait_ready(release, cancel).await?;
        Ok(report)
    }

    /// Rebuild the pull secret from the credentials `image` references
    pub async fn flush_image_credentials(&self, wl_app_id: Uuid, image: &str) -> EngineResult<()> {
        let records = self.store.env_records(wl_app_id)?;
        let (_, client) = self.directory.client_for(&records.wl_app)?;
        let mapper = self.store.latest_config(wl_app_id)?.mapper_version();
        let refs = discover_refs(records.wl_app.app_type, &records.module, image);
        self.credentials
            .flush_from_refs(&client, &records.application, &records.wl_app, mapper, &refs)
            .await?;
        Ok(())
    }

    /// Re-flush pull secrets of every released env of an application
    ///
    /// Returns the number of envs flushed.
    pub async fn refresh_image_credentials(&self, application_id: Uuid) -> EngineResult<usize> {
        let mut flushed = 0;
        for module in self.store.modules_of(application_id) {
            for env in self.store.module_envs.find(|e| e.module_id == module.id) {
                let Some(release) = self.store.latest_successful_release(env.wl_app_id) else {
                    continue;
                };
                let build = self.store.builds.get(&release.build_id)?;
                self.flush_image_credentials(env.wl_app_id, &build.image)
                    .await?;
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Poll until every declared process of `release` is ready
    pub async fn wait_ready(&self, release: &Release, cancel: &CancellationToken) -> EngineResult<()> {
        let timeout = self.settings.release.wait_timeout();
        let poll = self.settings.release.poll_interval();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match self.scheduler.release_readiness(release).await {
                Ok(readiness) if readiness.is_ready() => {
                    tracing::info!(wl_app = %release.wl_app_id, version = release.version, "release ready");
                    return Ok(());
                }
                Ok(readiness) => {
                    tracing::debug!(not_ready = ?readiness.not_ready, "waiting for release");
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(wl_app = %release.wl_app_id, "readiness check failed: {}", e);
                }
                Err(e) => return Err(e),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::ReleaseNotReady(format!(
                    "release not ready within {}s",
                    timeout.as_secs()
                )));
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = cancel.cancelled() => {
                    return Err(EngineError::Interrupted(
                        "interrupted while waiting for release".to_string(),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::pipeline;
    use crate::test_support::TestEnv;

    fn build(env: &TestEnv, procfile: &[(&str, &str)]) -> Build {
        env.store
            .builds
            .insert(Build::synthetic(
                env.wl_app.id,
                "registry.example.com/foo:1",
                procfile
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                "tester",
                "default",
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn test_release_versions_start_at_one() {
        let env = TestEnv::new();
        let pipeline = pipeline(&env);
        let build = build(&env, &[("web", "gunicorn")]);
        let first = pipeline
            .create_release(env.wl_app.id, &build, "tester", "")
            .await
            .unwrap();
        let second = pipeline
            .create_release(env.wl_app.id, &build, "tester", "")
            .await
            .unwrap();
        assert_eq!((first.version, second.version), (1, 2));
    }

    #[tokio::test]
    async fn test_release_build_applies_and_waits() {
        let env = TestEnv::new();
        let pipeline = pipeline(&env);
        let build = build(&env, &[("web", "gunicorn")]);
        let (release, report) = pipeline
            .release_build(env.wl_app.id, &build, &BTreeMap::new(), "tester", &CancellationToken::new())
            .await
            .unwrap();
        assert!(release.is_successful());
        assert_eq!(report.processes, vec!["web"]);
        assert!(env
            .server
            .object("secrets", &env.wl_app.namespace(), crate::credentials::PULL_SECRET_NAME)
            .is_some());
    }

    #[tokio::test]
    async fn test_release_not_ready_is_marked_failed() {
        let env = TestEnv::new();
        env.server.set_auto_ready(false);
        let pipeline = pipeline(&env);
        let build = build(&env, &[("web", "gunicorn")]);
        let err = pipeline
            .release_build(env.wl_app.id, &build, &BTreeMap::new(), "tester", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "RELEASE_NOT_READY");
        assert_eq!(err.to_string(), "release not ready within 2s");
        let release = env.store.latest_release(env.wl_app.id).unwrap();
        assert!(release.failed);
    }

    #[tokio::test]
    async fn test_wait_ready_observes_cancellation() {
        let env = TestEnv::new();
        env.server.set_auto_ready(false);
        let pipeline = pipeline(&env);
        let build = build(&env, &[("web", "gunicorn")]);
        let release = pipeline
            .create_release(env.wl_app.id, &build, "tester", "")
            .await
            .unwrap();
        env.scheduler()
            .apply_release(&release, &BTreeMap::new())
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = pipeline.wait_ready(&release, &cancel).await.unwrap_err();
        assert_eq!(err.code(), "INTERRUPTED");
    }

    #[tokio::test]
    async fn test_foreign_build_is_rejected() {
        let env = TestEnv::new();
        let pipeline = pipeline(&env);
        let mut foreign = build(&env, &[("web", "gunicorn")]);
        foreign.wl_app_id = Uuid::new_v4();
        let err = pipeline
            .create_release(env.wl_app.id, &foreign, "tester", "")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
