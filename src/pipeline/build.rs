//! Build worker
//!
//! Runs the builder image as a run-once pod in the app namespace. Logs go to
//! the build's stream channel and output store; on success an image build is
//! recorded and handed to the deployment waiting for it.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::pods::{self, PodTemplate};
use super::Pipeline;
use crate::cluster::resources::{KubeResource, LABEL_CATEGORY};
use crate::cluster::{ensure_namespace, LabelSelector, ListParams};
use crate::error::{EngineError, EngineResult};
use crate::models::{ArtifactType, Build, BuildProcess, DeclaredProcfile, JobStatus, Module, WlApp};
use crate::scheduler::validate_procfile;

pub const BUILDER_CATEGORY: &str = "slug-builder";
const LOGS_TAIL: usize = 20;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildRequest {
    pub source_package: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    /// Processes the source declares
    #[serde(default)]
    pub procfile: DeclaredProcfile,
    #[serde(default)]
    pub stream_channel_id: Option<Uuid>,
    #[serde(default)]
    pub operator: String,
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

pub fn builder_pod_name(wl_app: &WlApp, generation: u32) -> String {
    format!("{}-{}-{}", BUILDER_CATEGORY, wl_app.scheduler_safe_name(), generation)
}

/// Image reference a build of `generation` pushes
pub fn output_image(registry: &str, module: &Module, wl_app: &WlApp, generation: u32) -> String {
    let repository = module
        .build_config
        .image_repository
        .clone()
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| {
            format!(
                "{}/{}/{}",
                registry.trim_end_matches('/'),
                wl_app.app_code,
                module.name
            )
        });
    format!("{}:{}-g{}", repository, wl_app.environment, generation)
}

fn builder_env(process: &BuildProcess, image: &str, wl_app: &WlApp) -> BTreeMap<String, String> {
    let mut env = BTreeMap::from([
        ("SOURCE_GET_URL".to_string(), process.source_package.clone()),
        ("OUTPUT_IMAGE".to_string(), image.to_string()),
        ("CACHE_KEY".to_string(), wl_app.scheduler_safe_name()),
        ("BUILD_GENERATION".to_string(), process.generation.to_string()),
    ]);
    if let Some(branch) = &process.branch {
        env.insert("SOURCE_BRANCH".to_string(), branch.clone());
    }
    if let Some(revision) = &process.revision {
        env.insert("SOURCE_REVISION".to_string(), revision.clone());
    }
    env
}

// ============================================================================
// SBIO: I/O boundary
// ============================================================================

impl Pipeline {
    /// Record a pending build process for `wl_app_id`
    pub async fn start_build(&self, wl_app_id: Uuid, req: BuildRequest) -> EngineResult<BuildProcess> {
        if req.source_package.trim().is_empty() {
            return Err(EngineError::field("source_package", "source package is required"));
        }
        let procfile = if req.procfile.is_empty() {
            BTreeMap::new()
        } else {
            validate_procfile(req.procfile.entries())?
        };
        let wl_app = self.store.wl_apps.get(&wl_app_id)?;

        let _guard = self.store.lock_app(wl_app_id).await;
        let now = Utc::now();
        let process = self.store.build_processes.insert(BuildProcess {
            id: Uuid::new_v4(),
            wl_app_id,
            generation: self.store.next_build_generation(wl_app_id),
            status: JobStatus::Pending,
            builder_image: self.settings.build.builder_image.clone(),
            source_package: req.source_package,
            branch: req.branch,
            revision: req.revision,
            procfile,
            stream_channel_id: req.stream_channel_id.unwrap_or_else(Uuid::new_v4),
            build_id: None,
            exit_code: None,
            failure_reason: None,
            logs_tail: Vec::new(),
            owner: req.operator,
            tenant_id: wl_app.tenant_id.clone(),
            created: now,
            updated: now,
        })?;
        tracing::info!(wl_app = %wl_app.name, generation = process.generation, "build process created");
        Ok(process)
    }

    /// Run the builder for a pending build process
    ///
    /// Returns the terminal build process; finished processes are returned
    /// untouched.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn run_build(
        &self,
        build_process_id: Uuid,
        cancel: &CancellationToken,
    ) -> EngineResult<BuildProcess> {
        let process = self.store.build_processes.get(&build_process_id)?;
        if process.status.is_terminal() {
            return Ok(process);
        }
        let channel = self
            .streams
            .channel(process.stream_channel_id, &process.tenant_id);

        let outcome = self.execute_build(&process, &channel, cancel).await;
        let finished = self.finish_build(&process, outcome)?;
        tracing::info!(
            build_process = %finished.id,
            status = %finished.status,
            "build finished"
        );
        Ok(finished)
    }

    async fn execute_build(
        &self,
        process: &BuildProcess,
        channel: &crate::stream::StreamChannel,
        cancel: &CancellationToken,
    ) -> EngineResult<(pods::PodOutcome, String)> {
        let records = self.store.env_records(process.wl_app_id)?;
        let wl_app = &records.wl_app;
        let (cluster, client) = self.directory.client_for(wl_app)?;

        let slots = self.build_slot(&cluster.name);
        let _permit = tokio::select! {
            permit = slots.acquire_owned() => permit
                .map_err(|e| EngineError::Internal(format!("build slots closed: {}", e)))?,
            _ = cancel.cancelled() => {
                return Err(EngineError::Interrupted("build cancelled while queued".to_string()));
            }
        };

        ensure_namespace(&client, wl_app).await?;
        let image = output_image(
            &self.settings.build.image_registry,
            &records.module,
            wl_app,
            process.generation,
        );
        let name = builder_pod_name(wl_app, process.generation);
        let namespace = wl_app.namespace();
        let mut labels = self
            .store
            .latest_config(wl_app.id)?
            .mapper_version()
            .owner_labels(wl_app);
        labels.insert(LABEL_CATEGORY.to_string(), BUILDER_CATEGORY.to_string());
        let env = builder_env(process, &image, wl_app);
        let pod = pods::run_once_pod(&PodTemplate {
            name: &name,
            namespace: &namespace,
            labels,
            image: &process.builder_image,
            command: Vec::new(),
            env: &env,
            pull_secret: None,
        });

        let _ = channel.write_title("Building").await;
        pods::launch(&client, &namespace, &pod).await?;
        let outcome = pods::follow(
            &client,
            &namespace,
            &name,
            channel,
            self.settings.release.poll_interval(),
            Duration::from_secs(self.settings.build.builder_pod_timeout_secs),
            cancel,
        )
        .await?;
        Ok((outcome, image))
    }

    fn finish_build(
        &self,
        process: &BuildProcess,
        outcome: EngineResult<(pods::PodOutcome, String)>,
    ) -> EngineResult<BuildProcess> {
        match outcome {
            Ok((outcome, image)) if outcome.succeeded => {
                let now = Utc::now();
                let build = self.store.builds.insert(Build {
                    id: Uuid::new_v4(),
                    wl_app_id: process.wl_app_id,
                    build_process_id: Some(process.id),
                    artifact_type: ArtifactType::Image,
                    image,
                    env_variables: BTreeMap::new(),
                    procfile: process.procfile.clone(),
                    owner: process.owner.clone(),
                    tenant_id: process.tenant_id.clone(),
                    created: now,
                    updated: now,
                })?;
                let finished = self.store.build_processes.update(&process.id, |p| {
                    p.status = JobStatus::Successful;
                    p.build_id = Some(build.id);
                    p.exit_code = outcome.exit_code.or(Some(0));
                    p.logs_tail = outcome.tail(LOGS_TAIL);
                })?;
                if let Some(deployment) = self.store.pending_deployment_for_build(process.id) {
                    self.store
                        .deployments
                        .update(&deployment.id, |d| d.build_id = Some(build.id))?;
                }
                Ok(finished)
            }
            Ok((outcome, _)) => Ok(self.store.build_processes.update(&process.id, |p| {
                p.status = JobStatus::Failed;
                p.exit_code = outcome.exit_code;
                p.failure_reason = Some(format!(
                    "builder exited with code {}",
                    outcome.exit_code.unwrap_or(-1)
                ));
                p.logs_tail = outcome.tail(LOGS_TAIL);
            })?),
            Err(EngineError::Interrupted(reason)) => {
                Ok(self.store.build_processes.update(&process.id, |p| {
                    p.status = JobStatus::Interrupted;
                    p.failure_reason = Some(reason);
                })?)
            }
            Err(e) => {
                tracing::warn!(build_process = %process.id, "build failed: {}", e);
                Ok(self.store.build_processes.update(&process.id, |p| {
                    p.status = JobStatus::Failed;
                    p.failure_reason = Some(e.to_string());
                })?)
            }
        }
    }

    /// Delete builder pods older than the builder timeout
    ///
    /// Returns the number of pods removed.
    pub async fn sweep_builder_pods(&self) -> EngineResult<usize> {
        let max_age = chrono::Duration::seconds(self.settings.build.builder_pod_timeout_secs as i64);
        let params = ListParams::labels(LabelSelector::matching(LABEL_CATEGORY, BUILDER_CATEGORY));
        let mut removed = 0;
        for wl_app in self.store.wl_apps.all() {
            let (_, client) = match self.directory.client_for(&wl_app) {
                Ok(found) => found,
                Err(e) => {
                    tracing::debug!(wl_app = %wl_app.name, "skip sweep: {}", e);
                    continue;
                }
            };
            let namespace = wl_app.namespace();
            for pod in client.list::<Pod>(&namespace, &params).await? {
                let created = pod.metadata.creation_timestamp.as_ref().map(|t| t.0);
                let expired = created.is_some_and(|at| Utc::now() - at >= max_age);
                if expired && client.delete::<Pod>(&namespace, pod.name()).await? {
                    tracing::info!(wl_app = %wl_app.name, pod = %pod.name(), "swept builder pod");
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}
