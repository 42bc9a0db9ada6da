//! Deployment runner
//!
//! `create_deployment` records the run; `run_deployment` executes it phase
//! by phase and persists the terminal transition. Running a finished
//! deployment again returns it unchanged.

use std::collections::BTreeMap;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::build::BuildRequest;
use super::Pipeline;
use crate::cluster::ensure_namespace;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    AppType, Build, DeclaredProcfile, DeployFailure, Deployment, JobStatus, PhaseKind, PhaseStatus,
};
use crate::scheduler::{sync_from_procfile, validate_procfile};
use crate::store::EnvRecords;
use crate::stream::StreamChannel;

const LOGS_TAIL: usize = 20;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeployRequest {
    /// Source package for modules that build from source
    #[serde(default)]
    pub source_package: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub procfile: DeclaredProcfile,
    /// Image for modules that skip the build
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub extra_envs: BTreeMap<String, String>,
    #[serde(default)]
    pub operator: String,
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

fn hint_for(err: &EngineError) -> Option<String> {
    let hint = match err {
        EngineError::BuildFailed(_) => "check the build log for the failing step",
        EngineError::HookFailed(_) => "check the pre-release hook output",
        EngineError::ReleaseNotReady(_) => "check process instances and their events",
        EngineError::MissingImageCredential(_) => "declare the image credential on the application",
        EngineError::ClusterUnavailable(_) => "retry once the cluster is reachable",
        _ => return None,
    };
    Some(hint.to_string())
}

fn failure_of(phase: PhaseKind, err: &EngineError, logs_tail: Vec<String>) -> DeployFailure {
    DeployFailure {
        phase,
        kind: err.code().to_string(),
        reason: err.to_string(),
        hint: hint_for(err),
        logs_tail,
    }
}

/// Phase that was running when the deployment stopped
fn current_phase(deployment: &Deployment) -> PhaseKind {
    deployment
        .phases
        .iter()
        .find(|p| p.status == PhaseStatus::Running)
        .or_else(|| {
            deployment
                .phases
                .iter()
                .find(|p| p.status == PhaseStatus::Pending)
        })
        .map(|p| p.kind)
        .unwrap_or(PhaseKind::Release)
}

// ============================================================================
// SBIO: I/O boundary
// ============================================================================

impl Pipeline {
    /// Record a pending deployment for a module env
    ///
    /// Fails with `DEPLOYMENT_IN_PROGRESS` while another one runs.
    pub async fn create_deployment(
        &self,
        module_env_id: Uuid,
        req: DeployRequest,
    ) -> EngineResult<Deployment> {
        let module_env = self.store.module_envs.get(&module_env_id)?;
        let procfile = if req.procfile.is_empty() {
            BTreeMap::new()
        } else {
            validate_procfile(req.procfile.entries())?
        };

        let _guard = self.store.lock_app(module_env.wl_app_id).await;
        if let Some(running) = self.store.running_deployment(module_env.wl_app_id) {
            return Err(EngineError::conflict(
                "DEPLOYMENT_IN_PROGRESS",
                format!("deployment {} is in progress", running.id),
            ));
        }
        let mut deployment = Deployment::new(
            module_env_id,
            module_env.wl_app_id,
            &req.operator,
            &module_env.tenant_id,
        );
        deployment.source_package = req.source_package;
        deployment.branch = req.branch;
        deployment.revision = req.revision;
        deployment.procfile = procfile;
        deployment.image = req.image;
        deployment.extra_envs = req.extra_envs;
        let deployment = self.store.deployments.insert(deployment)?;
        tracing::info!(deployment_id = %deployment.id, "deployment created");
        Ok(deployment)
    }

    /// Request interruption of a running deployment
    pub fn interrupt_deployment(&self, deployment_id: Uuid, reason: &str) -> EngineResult<Deployment> {
        let deployment = self.store.deployments.get(&deployment_id)?;
        if !deployment.is_in_progress() {
            return Err(EngineError::conflict(
                "DEPLOYMENT_FINISHED",
                format!("deployment {} already {}", deployment_id, deployment.status),
            ));
        }
        let updated = self.store.deployments.update(&deployment_id, |d| {
            d.interrupt_requested = true;
            d.interrupted_reason = Some(reason.to_string());
        })?;
        if let Some(token) = self.cancellations.get(&deployment_id) {
            token.cancel();
        }
        tracing::info!(deployment_id = %deployment_id, reason, "deployment interrupt requested");
        Ok(updated)
    }

    /// Execute a deployment to its terminal state
    #[tracing::instrument(skip(self, extra_envs))]
    pub async fn run_deployment(
        &self,
        deployment_id: Uuid,
        extra_envs: &BTreeMap<String, String>,
    ) -> EngineResult<Deployment> {
        let deployment = self.store.deployments.get(&deployment_id)?;
        if !deployment.is_in_progress() {
            return Ok(deployment);
        }
        let cancel = self.cancel_token(deployment_id);
        if deployment.interrupt_requested {
            cancel.cancel();
        }
        let channel = self
            .streams
            .channel(deployment.stream_channel_id, &deployment.tenant_id);
        let mut extras = deployment.extra_envs.clone();
        extras.extend(extra_envs.iter().map(|(k, v)| (k.clone(), v.clone())));

        let result = self.drive(&deployment, &extras, &channel, &cancel).await;
        let finished = self.finish_deployment(deployment_id, result)?;
        self.release_token(deployment_id);

        if let Err(e) = channel.close(finished.status.as_str()).await {
            tracing::warn!(deployment_id = %deployment_id, "closing stream failed: {}", e);
        }
        tracing::info!(deployment_id = %deployment_id, status = %finished.status, "deployment finished");
        Ok(finished)
    }

    fn mark(&self, deployment_id: Uuid, phase: PhaseKind, status: PhaseStatus) -> EngineResult<()> {
        self.store
            .deployments
            .update(&deployment_id, |d| d.mark_phase(phase, status))?;
        Ok(())
    }

    async fn drive(
        &self,
        deployment: &Deployment,
        extras: &BTreeMap<String, String>,
        channel: &StreamChannel,
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<String>> {
        let id = deployment.id;

        self.mark(id, PhaseKind::Preparation, PhaseStatus::Running)?;
        let _ = channel.write_title("Preparing").await;
        let records = self.store.env_records(deployment.wl_app_id)?;
        let (_, client) = self.directory.client_for(&records.wl_app)?;
        ensure_namespace(&client, &records.wl_app).await?;
        self.mark(id, PhaseKind::Preparation, PhaseStatus::Successful)?;
        self.check_interrupt(id)?;

        let build = self
            .build_phase(deployment, &records, channel, cancel)
            .await?;
        if records.wl_app.app_type != AppType::CloudNative && !build.procfile.is_empty() {
            sync_from_procfile(&self.store, records.module.id, &records.wl_app.tenant_id, &build.procfile)?;
        }
        self.store
            .deployments
            .update(&id, |d| d.build_id = Some(build.id))?;
        self.check_interrupt(id)?;

        match records.module.pre_release_hook.as_ref().filter(|h| h.enabled) {
            Some(hook) => {
                self.mark(id, PhaseKind::PreRelease, PhaseStatus::Running)?;
                let command = self
                    .run_pre_release_hook(records.wl_app.id, &build, hook, extras, channel, cancel)
                    .await?;
                self.store
                    .deployments
                    .update(&id, |d| d.hook_command_id = Some(command.id))?;
                self.mark(id, PhaseKind::PreRelease, PhaseStatus::Successful)?;
            }
            None => self.mark(id, PhaseKind::PreRelease, PhaseStatus::Skipped)?,
        }
        self.check_interrupt(id)?;

        self.mark(id, PhaseKind::Release, PhaseStatus::Running)?;
        let _ = channel.write_title("Releasing").await;
        let (release, report) = self
            .release_build(records.wl_app.id, &build, extras, &deployment.operator, cancel)
            .await?;
        self.store.deployments.update(&id, |d| {
            d.release_id = Some(release.id);
            d.release_version = Some(release.version);
        })?;
        for warning in &report.warnings {
            channel.write_lossy(warning).await;
        }

        self.ingress.sync_all(records.wl_app.id).await?;
        if records.module_env.is_offlined {
            self.store
                .module_envs
                .update(&records.module_env.id, |e| e.is_offlined = false)?;
        }
        self.mark(id, PhaseKind::Release, PhaseStatus::Successful)?;
        Ok(self.ingress.accessible_urls(records.wl_app.id))
    }

    async fn build_phase(
        &self,
        deployment: &Deployment,
        records: &EnvRecords,
        channel: &StreamChannel,
        cancel: &CancellationToken,
    ) -> EngineResult<Build> {
        let id = deployment.id;
        let module = &records.module;

        if module.skips_build() {
            let image = deployment
                .image
                .clone()
                .or_else(|| module.build_config.custom_image.clone())
                .filter(|i| !i.trim().is_empty())
                .ok_or_else(|| EngineError::field("image", "image is required for this module"))?;
            let build = self.store.builds.insert(Build::synthetic(
                records.wl_app.id,
                &image,
                deployment.procfile.clone(),
                &deployment.operator,
                &deployment.tenant_id,
            ))?;
            self.mark(id, PhaseKind::Build, PhaseStatus::Skipped)?;
            return Ok(build);
        }

        self.mark(id, PhaseKind::Build, PhaseStatus::Running)?;
        let source_package = deployment
            .source_package
            .clone()
            .ok_or_else(|| EngineError::field("source_package", "source package is required"))?;
        let process = self
            .start_build(
                records.wl_app.id,
                BuildRequest {
                    source_package,
                    branch: deployment.branch.clone(),
                    revision: deployment.revision.clone(),
                    procfile: deployment.procfile.clone().into(),
                    stream_channel_id: Some(channel.id()),
                    operator: deployment.operator.clone(),
                },
            )
            .await?;
        self.store
            .deployments
            .update(&id, |d| d.build_process_id = Some(process.id))?;

        let finished = self.run_build(process.id, cancel).await?;
        match finished.status {
            JobStatus::Successful => {
                let build_id = finished
                    .build_id
                    .ok_or_else(|| EngineError::Internal("successful build without artifact".into()))?;
                self.mark(id, PhaseKind::Build, PhaseStatus::Successful)?;
                Ok(self.store.builds.get(&build_id)?)
            }
            JobStatus::Interrupted => Err(EngineError::Interrupted(
                finished
                    .failure_reason
                    .unwrap_or_else(|| "build interrupted".to_string()),
            )),
            _ => Err(EngineError::BuildFailed(
                finished
                    .failure_reason
                    .unwrap_or_else(|| "builder failed".to_string()),
            )),
        }
    }

    fn finish_deployment(
        &self,
        deployment_id: Uuid,
        result: EngineResult<Vec<String>>,
    ) -> EngineResult<Deployment> {
        let current = self.store.deployments.get(&deployment_id)?;
        let phase = current_phase(&current);
        let logs_tail = self
            .store
            .output_streams
            .get(&current.stream_channel_id)
            .map(|s| s.tail(LOGS_TAIL))
            .unwrap_or_default();

        let updated = match result {
            Ok(urls) => self.store.deployments.update(&deployment_id, |d| {
                d.status = JobStatus::Successful;
                d.accessible_urls = urls;
            })?,
            Err(EngineError::Interrupted(reason)) => {
                self.store.deployments.update(&deployment_id, |d| {
                    d.mark_phase(phase, PhaseStatus::Interrupted);
                    d.status = JobStatus::Interrupted;
                    d.interrupted_reason.get_or_insert(reason);
                })?
            }
            Err(e) => {
                tracing::warn!(deployment_id = %deployment_id, phase = %phase, "deployment failed: {}", e);
                let failure = failure_of(phase, &e, logs_tail);
                self.store.deployments.update(&deployment_id, |d| {
                    d.mark_phase(phase, PhaseStatus::Failed);
                    d.status = JobStatus::Failed;
                    d.failure = Some(failure);
                })?
            }
        };
        Ok(updated)
    }
}
