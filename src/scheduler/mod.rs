//! Process scheduler
//!
//! Turns process specs, resolved for one environment, into cluster workloads
//! and reports what the cluster actually runs.
//!
//! ```text
//! ProcessSpec + overlays ──► ResolvedProcess ──► WorkloadInput ──► Deployment
//!                                                              ├─► Service
//!                                                              └─► GeneralPodAutoscaler
//! ```
//!
//! Naming and pod selection belong to the [`MapperVersion`] of the WlApp's
//! config, so two generations never adopt each other's pods.

pub mod autoscaling;
pub mod envs;
pub mod mapper;
pub mod probes;
pub mod process;
pub mod state;
pub mod workload;
pub mod zombie;

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Event, Pod, Service};
use serde_json::json;
use uuid::Uuid;

pub use process::{
    plan_usages, resolve_for_env, sync_from_procfile, validate_procfile, PlanUsage, ResolvedProcess,
};
pub use state::{InstanceEvent, InstanceInfo, ProcessInfo, Readiness};
pub use zombie::ReapReport;

use crate::cluster::resources::{
    GeneralPodAutoscaler, KubeResource, ListParams, LABEL_MAPPER_VERSION, LABEL_PROCESS_TYPE,
    LABEL_WL_APP,
};
use crate::cluster::{apply_with_retry, ensure_namespace, ClusterDirectory, KubeClient, RetryPolicy};
use crate::crypto::CipherManager;
use crate::error::{EngineError, EngineResult};
use crate::ingress::naming;
use crate::models::{
    AutoscalingConfig, Build, Cluster, ClusterFeatureFlag, Config, ExposedUrlType, MapperVersion,
    OverlayEnv, Release, ResourcePlan, ZombieSet,
};
use crate::settings::Settings;
use crate::store::{EnvRecords, Store};
use envs::{merge_envs, BuiltinContext};
use mapper::any_generation_selector;
use workload::WorkloadInput;

/// Outcome of applying a release
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub processes: Vec<String>,
    pub warnings: Vec<String>,
    pub reaped: ReapReport,
}

/// Everything one release apply needs, fetched once
struct ReleaseContext {
    records: EnvRecords,
    cluster: Cluster,
    client: KubeClient,
    config: Config,
    build: Build,
    release: Release,
}

impl ReleaseContext {
    fn mapper(&self) -> MapperVersion {
        self.config.mapper_version()
    }

    fn image(&self) -> &str {
        if self.build.image.is_empty() {
            self.config.image.as_deref().unwrap_or_default()
        } else {
            &self.build.image
        }
    }
}

pub struct ProcessScheduler {
    store: Arc<Store>,
    directory: Arc<ClusterDirectory>,
    cipher: Arc<CipherManager>,
    settings: Arc<Settings>,
}

impl ProcessScheduler {
    pub fn new(
        store: Arc<Store>,
        directory: Arc<ClusterDirectory>,
        cipher: Arc<CipherManager>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            directory,
            cipher,
            settings,
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_retries(self.settings.release.apply_retries)
    }

    fn context(&self, release: &Release) -> EngineResult<ReleaseContext> {
        let records = self.store.env_records(release.wl_app_id)?;
        let (cluster, client) = self.directory.client_for(&records.wl_app)?;
        Ok(ReleaseContext {
            config: self.store.configs.get(&release.config_id)?,
            build: self.store.builds.get(&release.build_id)?,
            release: release.clone(),
            records,
            cluster,
            client,
        })
    }

    fn ensure_not_deploying(&self, wl_app_id: Uuid) -> EngineResult<()> {
        match self.store.running_deployment(wl_app_id) {
            Some(deployment) => Err(EngineError::conflict(
                "DEPLOYMENT_IN_PROGRESS",
                format!("deployment {} is in progress", deployment.id),
            )),
            None => Ok(()),
        }
    }

    fn builtin(&self, ctx: &ReleaseContext) -> EngineResult<BuiltinContext> {
        self.builtin_for(&ctx.records, &ctx.cluster)
    }

    fn builtin_for(&self, records: &EnvRecords, cluster: &Cluster) -> EngineResult<BuiltinContext> {
        let prefix = naming::env_prefix(
            &records.application,
            &records.module,
            records.wl_app.environment,
        );
        let sub_path = match cluster.exposed_url_type {
            ExposedUrlType::Subpath => naming::sub_path(&prefix),
            ExposedUrlType::Subdomain => "/".to_string(),
        };
        Ok(BuiltinContext {
            prefix: self.settings.env_var_prefix.clone(),
            app_code: records.application.code.clone(),
            app_secret: records.application.secret.reveal(&self.cipher)?,
            module_name: records.module.name.clone(),
            environment: records.wl_app.environment.to_string(),
            region: records.wl_app.region.clone(),
            sub_path,
        })
    }

    fn container_env(
        &self,
        ctx: &ReleaseContext,
        builtin: &BuiltinContext,
        process: &ResolvedProcess,
        extras: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut base = builtin.vars(&process.name, process.target_port);
        base.extend(ctx.build.env_variables.clone());
        let config_vars = self
            .store
            .config_vars_for(ctx.records.module.id, ctx.records.wl_app.environment);
        merge_envs(base, &config_vars, &process.env, extras, &process.name)
    }

    /// Environment of a one-off command such as the pre-release hook
    pub fn command_env(
        &self,
        wl_app_id: Uuid,
        build: &Build,
        process_type: &str,
        extras: &BTreeMap<String, String>,
    ) -> EngineResult<BTreeMap<String, String>> {
        let records = self.store.env_records(wl_app_id)?;
        let cluster = self.directory.resolve_cluster(&records.wl_app)?;
        let builtin = self.builtin_for(&records, &cluster)?;
        let mut base = builtin.vars(process_type, crate::models::process::DEFAULT_PORT);
        base.extend(build.env_variables.clone());
        let config_vars = self
            .store
            .config_vars_for(records.module.id, records.wl_app.environment);
        Ok(merge_envs(base, &config_vars, &BTreeMap::new(), extras, process_type))
    }

    /// Write the Deployment, Service and autoscaler of one process
    async fn apply_process(
        &self,
        ctx: &ReleaseContext,
        builtin: &BuiltinContext,
        process: &ResolvedProcess,
        extras: &BTreeMap<String, String>,
    ) -> EngineResult<Option<String>> {
        let wl_app = &ctx.records.wl_app;
        let input = WorkloadInput {
            wl_app,
            cluster: &ctx.cluster,
            config: &ctx.config,
            mapper: ctx.mapper(),
            release_version: ctx.release.version,
            image: ctx.image(),
            process,
            env: self.container_env(ctx, builtin, process, extras),
        };
        let client = &ctx.client;
        let namespace = input.namespace();
        let policy = self.retry_policy();

        let deployment = input.build_deployment();
        apply_with_retry(client, wl_app, &policy, "deployment", || {
            client.create_or_replace(&namespace, &deployment)
        })
        .await?;

        let service = input.build_service();
        apply_with_retry(client, wl_app, &policy, "service", || {
            client.create_or_replace(&namespace, &service)
        })
        .await?;

        let mut warning = None;
        match input.build_autoscaler() {
            Some(autoscaler) => {
                apply_with_retry(client, wl_app, &policy, "autoscaler", || {
                    client.create_or_replace(&namespace, &autoscaler)
                })
                .await?;
            }
            None => {
                if process.autoscaling.is_some() {
                    let message = format!(
                        "cluster {} does not support autoscaling, process {} pinned to {} replicas",
                        ctx.cluster.name,
                        process.name,
                        process.declared_replicas()
                    );
                    tracing::warn!(wl_app = %wl_app.name, "{}", message);
                    warning = Some(message);
                }
                let name = input.deployment_name();
                if client
                    .get_opt::<GeneralPodAutoscaler>(&namespace, &name)
                    .await?
                    .is_some()
                {
                    client
                        .delete::<GeneralPodAutoscaler>(&namespace, &name)
                        .await?;
                }
            }
        }
        Ok(warning)
    }

    /// Apply every process of `release` and reap types the previous
    /// successful release declared but this one does not
    #[tracing::instrument(skip_all, fields(wl_app = %release.wl_app_id, version = release.version))]
    pub async fn apply_release(
        &self,
        release: &Release,
        extras: &BTreeMap<String, String>,
    ) -> EngineResult<ApplyReport> {
        validate_procfile(
            &release
                .procfile
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Vec<_>>(),
        )?;
        let ctx = self.context(release)?;
        let wl_app = &ctx.records.wl_app;
        ensure_namespace(&ctx.client, wl_app).await?;

        let processes = process::resolve_procfile(
            &self.store,
            ctx.records.module.id,
            &wl_app.tenant_id,
            wl_app.environment,
            &release.procfile,
        )?;
        let builtin = self.builtin(&ctx)?;

        let mut report = ApplyReport::default();
        for process in &processes {
            if let Some(warning) = self.apply_process(&ctx, &builtin, process, extras).await? {
                report.warnings.push(warning);
            }
            report.processes.push(process.name.clone());
        }

        let previous = self
            .store
            .releases_of(wl_app.id)
            .into_iter()
            .find(|r| r.version < release.version && r.is_successful());
        if let Some(previous) = previous {
            let zombies = ZombieSet::between(&previous.procfile, &release.procfile);
            if !zombies.is_empty() {
                report.reaped = zombie::reap(&ctx.client, wl_app, ctx.mapper(), &zombies).await?;
            }
        }

        tracing::info!(
            processes = report.processes.len(),
            reaped = report.reaped.deleted.len(),
            "applied release"
        );
        Ok(report)
    }

    /// Readiness of every process type `release` declares
    pub async fn release_readiness(&self, release: &Release) -> EngineResult<Readiness> {
        let ctx = self.context(release)?;
        let wl_app = &ctx.records.wl_app;
        let mapper = ctx.mapper();
        let namespace = wl_app.namespace();

        let mut expected = BTreeMap::new();
        for name in release.procfile.keys() {
            let replicas = match self.store.process_spec(ctx.records.module.id, name) {
                Ok(spec) => resolve_for_env(&self.store, &spec, wl_app.environment).declared_replicas(),
                Err(_) => 1,
            };
            expected.insert(name.clone(), replicas);
        }

        let params = ListParams::labels(mapper.app_selector(wl_app));
        let deployments: BTreeMap<String, Deployment> = ctx
            .client
            .list::<Deployment>(&namespace, &params)
            .await?
            .into_iter()
            .filter_map(|d| d.labels().get(LABEL_PROCESS_TYPE).cloned().map(|p| (p, d)))
            .collect();
        let pods = ctx.client.list::<Pod>(&namespace, &params).await?;
        Ok(state::judge_readiness(
            &expected,
            &deployments,
            &pods,
            mapper,
            release.version,
        ))
    }

    /// Context of the release currently serving `wl_app_id`, if any
    fn serving_context(&self, wl_app_id: Uuid) -> EngineResult<Option<ReleaseContext>> {
        match self.store.latest_successful_release(wl_app_id) {
            Some(release) => self.context(&release).map(Some),
            None => Ok(None),
        }
    }

    /// Re-apply one process of the serving release with `process` settings
    async fn reapply(&self, ctx: &ReleaseContext, process: &ResolvedProcess) -> EngineResult<()> {
        let builtin = self.builtin(ctx)?;
        self.apply_process(ctx, &builtin, process, &BTreeMap::new())
            .await?;
        Ok(())
    }

    /// Set the replica count of one process
    ///
    /// Scaling to zero keeps the workload. Repeating a scale makes no writes.
    #[tracing::instrument(skip(self))]
    pub async fn scale(&self, wl_app_id: Uuid, process_type: &str, replicas: i32) -> EngineResult<()> {
        if replicas < 0 {
            return Err(EngineError::field("replicas", "must not be negative"));
        }
        let _guard = self.store.lock_app(wl_app_id).await;
        self.ensure_not_deploying(wl_app_id)?;

        let records = self.store.env_records(wl_app_id)?;
        let spec = self.store.process_spec(records.module.id, process_type)?;
        let mut process = resolve_for_env(&self.store, &spec, records.wl_app.environment);
        if replicas > process.plan.max_replicas {
            return Err(EngineError::field(
                "replicas",
                format!(
                    "plan '{}' allows at most {} replicas",
                    process.plan.name, process.plan.max_replicas
                ),
            ));
        }
        if let Some(config) = &process.autoscaling {
            if replicas < config.min_replicas || replicas > config.max_replicas {
                return Err(EngineError::field(
                    "replicas",
                    format!(
                        "autoscaling keeps replicas within [{}, {}]",
                        config.min_replicas, config.max_replicas
                    ),
                ));
            }
        }
        process.replicas = replicas;

        if let Some(ctx) = self.serving_context(wl_app_id)? {
            self.scale_live(&ctx, &process, replicas).await?;
        } else {
            tracing::info!(process = %process_type, "env not running, target saved for next release");
        }

        self.store
            .upsert_overlay(&spec, OverlayEnv::from(records.wl_app.environment), |o| {
                o.target_replicas = Some(replicas)
            })?;
        Ok(())
    }

    async fn scale_live(
        &self,
        ctx: &ReleaseContext,
        process: &ResolvedProcess,
        replicas: i32,
    ) -> EngineResult<()> {
        let wl_app = &ctx.records.wl_app;
        let mapper = ctx.mapper();
        let namespace = wl_app.namespace();
        let client = &ctx.client;
        let name = mapper.deployment_name(wl_app, &process.name);

        let live = client.get_opt::<Deployment>(&namespace, &name).await?;
        let Some(live) = live else {
            tracing::info!(deployment = %name, "workload missing, re-applying from serving release");
            return self.reapply(ctx, process).await;
        };

        let current = live.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        if current != replicas {
            let patch = json!({"spec": {"replicas": replicas}});
            apply_with_retry(client, wl_app, &self.retry_policy(), "scale", || {
                client.patch_merge::<Deployment>(&namespace, &name, &patch)
            })
            .await?;
            tracing::info!(deployment = %name, from = current, to = replicas, "scaled");
        }

        let service_name = mapper.service_name(wl_app, &process.name);
        if client
            .get_opt::<Service>(&namespace, &service_name)
            .await?
            .is_none()
        {
            let builtin = self.builtin(ctx)?;
            let input = WorkloadInput {
                wl_app,
                cluster: &ctx.cluster,
                config: &ctx.config,
                mapper,
                release_version: ctx.release.version,
                image: ctx.image(),
                process,
                env: self.container_env(ctx, &builtin, process, &BTreeMap::new()),
            };
            let service = input.build_service();
            apply_with_retry(client, wl_app, &self.retry_policy(), "service", || {
                client.create(&namespace, &service)
            })
            .await?;
        }
        Ok(())
    }

    /// Move a process to another resource plan
    #[tracing::instrument(skip(self))]
    pub async fn switch_plan(
        &self,
        wl_app_id: Uuid,
        process_type: &str,
        plan_name: &str,
    ) -> EngineResult<()> {
        let plan: ResourcePlan = self
            .store
            .plans
            .get(&plan_name.to_string())
            .ok()
            .filter(|p| p.is_active)
            .ok_or_else(|| EngineError::field("plan_name", format!("plan '{}' is not available", plan_name)))?;

        let _guard = self.store.lock_app(wl_app_id).await;
        self.ensure_not_deploying(wl_app_id)?;
        let records = self.store.env_records(wl_app_id)?;
        let spec = self.store.process_spec(records.module.id, process_type)?;
        let mut process = resolve_for_env(&self.store, &spec, records.wl_app.environment);
        if process.declared_replicas() > plan.max_replicas {
            return Err(EngineError::field(
                "plan_name",
                format!(
                    "plan '{}' allows at most {} replicas, process runs {}",
                    plan.name,
                    plan.max_replicas,
                    process.declared_replicas()
                ),
            ));
        }
        process.plan = plan;

        if let Some(ctx) = self.serving_context(wl_app_id)? {
            self.reapply(&ctx, &process).await?;
        }
        self.store
            .upsert_overlay(&spec, OverlayEnv::from(records.wl_app.environment), |o| {
                o.plan_name = Some(plan_name.to_string())
            })?;
        Ok(())
    }

    /// Enable autoscaling with `config`, or disable it with `None`
    #[tracing::instrument(skip(self, config))]
    pub async fn set_autoscaling(
        &self,
        wl_app_id: Uuid,
        process_type: &str,
        config: Option<AutoscalingConfig>,
    ) -> EngineResult<()> {
        let _guard = self.store.lock_app(wl_app_id).await;
        self.ensure_not_deploying(wl_app_id)?;
        let records = self.store.env_records(wl_app_id)?;
        let spec = self.store.process_spec(records.module.id, process_type)?;
        let mut process = resolve_for_env(&self.store, &spec, records.wl_app.environment);
        if let Some(config) = &config {
            autoscaling::validate_config(config, &process.plan)?;
        }
        process.autoscaling = config.clone();

        if let Some(ctx) = self.serving_context(wl_app_id)? {
            self.reapply(&ctx, &process).await?;
        }
        let enabled = config.is_some();
        self.store
            .upsert_overlay(&spec, OverlayEnv::from(records.wl_app.environment), |o| {
                o.autoscaling = Some(enabled);
                if config.is_some() {
                    o.scaling_config = config;
                }
            })?;
        Ok(())
    }

    /// Declared and observed state per process type
    pub async fn get_processes_info(&self, wl_app_id: Uuid) -> EngineResult<Vec<ProcessInfo>> {
        let records = self.store.env_records(wl_app_id)?;
        let wl_app = &records.wl_app;
        let config = self.store.latest_config(wl_app_id)?;
        let mapper = config.mapper_version();
        let (_, client) = self.directory.client_for(wl_app)?;

        let pods = client
            .list::<Pod>(&wl_app.namespace(), &ListParams::labels(any_generation_selector(wl_app)))
            .await?;
        let instances: Vec<InstanceInfo> = pods
            .iter()
            .map(|pod| state::instance_info(pod, mapper))
            .collect();

        let infos = self
            .store
            .process_specs_of(records.module.id)
            .into_iter()
            .map(|spec| {
                let process = resolve_for_env(&self.store, &spec, wl_app.environment);
                let mine: Vec<InstanceInfo> = instances
                    .iter()
                    .filter(|i| i.process_type == process.name)
                    .cloned()
                    .collect();
                ProcessInfo {
                    target_replicas: process.declared_replicas(),
                    ready_replicas: mine.iter().filter(|i| i.ready && !i.is_legacy).count() as i32,
                    autoscaling: process.autoscaling.is_some(),
                    plan: process.plan.name.clone(),
                    process_type: process.name,
                    instances: mine,
                }
            })
            .collect();
        Ok(infos)
    }

    async fn owned_pod(&self, wl_app_id: Uuid, instance: &str) -> EngineResult<(Pod, MapperVersion)> {
        let wl_app = self.store.wl_apps.get(&wl_app_id)?;
        let mapper = self.store.latest_config(wl_app_id)?.mapper_version();
        let (_, client) = self.directory.client_for(&wl_app)?;
        let pod: Pod = client.get(&wl_app.namespace(), instance).await?;
        if pod.labels().get(LABEL_WL_APP) != Some(&wl_app.scheduler_safe_name()) {
            return Err(EngineError::not_found(format!("instance {}", instance)));
        }
        Ok((pod, mapper))
    }

    pub async fn get_instance(&self, wl_app_id: Uuid, instance: &str) -> EngineResult<InstanceInfo> {
        let (pod, mapper) = self.owned_pod(wl_app_id, instance).await?;
        Ok(state::instance_info(&pod, mapper))
    }

    /// Cluster events recorded against one instance
    pub async fn instance_events(
        &self,
        wl_app_id: Uuid,
        instance: &str,
    ) -> EngineResult<Vec<InstanceEvent>> {
        let (pod, _) = self.owned_pod(wl_app_id, instance).await?;
        let wl_app = self.store.wl_apps.get(&wl_app_id)?;
        let (_, client) = self.directory.client_for(&wl_app)?;
        let params = ListParams::fields(format!("involvedObject.name={}", pod.name()));
        let events = client.list::<Event>(&wl_app.namespace(), &params).await?;
        Ok(events.iter().map(state::instance_event).collect())
    }

    /// Scale every workload of the app, any generation, to zero
    pub async fn scale_all_to_zero(&self, wl_app_id: Uuid) -> EngineResult<usize> {
        let wl_app = self.store.wl_apps.get(&wl_app_id)?;
        let (_, client) = self.directory.client_for(&wl_app)?;
        let namespace = wl_app.namespace();
        let deployments = client
            .list::<Deployment>(&namespace, &ListParams::labels(any_generation_selector(&wl_app)))
            .await?;

        let mut scaled = 0;
        let patch = json!({"spec": {"replicas": 0}});
        for deployment in deployments {
            if deployment.spec.as_ref().and_then(|s| s.replicas) == Some(0) {
                continue;
            }
            let name = deployment.name().to_string();
            apply_with_retry(&client, &wl_app, &self.retry_policy(), "scale", || {
                client.patch_merge::<Deployment>(&namespace, &name, &patch)
            })
            .await?;
            scaled += 1;
        }
        tracing::info!(wl_app = %wl_app.name, scaled, "scaled workloads to zero");
        Ok(scaled)
    }

    /// Delete workloads written by other mapper generations
    pub async fn cleanup_legacy(&self, wl_app_id: Uuid) -> EngineResult<usize> {
        let wl_app = self.store.wl_apps.get(&wl_app_id)?;
        let current = self.store.latest_config(wl_app_id)?.mapper_version();
        let (_, client) = self.directory.client_for(&wl_app)?;
        let namespace = wl_app.namespace();
        let params = ListParams::labels(any_generation_selector(&wl_app));
        let is_legacy = |labels: &BTreeMap<String, String>| {
            labels.get(LABEL_MAPPER_VERSION).map(String::as_str) != Some(current.as_str())
        };

        let mut removed = 0;
        for deployment in client.list::<Deployment>(&namespace, &params).await? {
            if is_legacy(&deployment.labels()) {
                client.delete::<Deployment>(&namespace, deployment.name()).await?;
                removed += 1;
            }
        }
        for service in client.list::<Service>(&namespace, &params).await? {
            if is_legacy(&service.labels()) {
                client.delete::<Service>(&namespace, service.name()).await?;
            }
        }
        Ok(removed)
    }

    /// Whether `cluster` autoscales natively
    pub fn supports_autoscaling(cluster: &Cluster) -> bool {
        cluster.has_feature(ClusterFeatureFlag::EnableAutoscaling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MetricName, MetricTargetType, ScalingMetric};
    use crate::test_support::TestEnv;

    fn deployment_replicas(env: &TestEnv, name: &str) -> Option<i64> {
        env.server
            .object("deployments", &env.wl_app.namespace(), name)
            .and_then(|d| d.pointer("/spec/replicas").and_then(|v| v.as_i64()))
    }

    #[tokio::test]
    async fn test_apply_release_materializes_processes() {
        let env = TestEnv::new();
        let release = env.release(&[("web", "./start"), ("worker", "celery")], "registry/example/foo:1");
        let report = env
            .scheduler()
            .apply_release(&release, &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(report.processes, vec!["web".to_string(), "worker".to_string()]);

        let ns = env.wl_app.namespace();
        assert_eq!(env.server.objects("deployments", &ns).len(), 2);
        assert_eq!(env.server.objects("services", &ns).len(), 2);
        let deployment = env
            .server
            .object("deployments", &ns, "bkapp-foo-stag-web")
            .unwrap();
        let container = &deployment["spec"]["template"]["spec"]["containers"][0];
        let envs = container["env"].as_array().unwrap();
        assert!(envs
            .iter()
            .any(|e| e["name"] == "BKPAAS_PROCESS_TYPE" && e["value"] == "web"));
        assert!(envs.iter().any(|e| e["name"] == "BKPAAS_APP_SECRET"));

        let readiness = env.scheduler().release_readiness(&release).await.unwrap();
        assert!(readiness.is_ready());
    }

    #[tokio::test]
    async fn test_rename_reaps_old_type() {
        let env = TestEnv::new();
        let first = env.release(&[("web", "./a")], "img:1");
        env.scheduler().apply_release(&first, &BTreeMap::new()).await.unwrap();
        let second = env.release(&[("api", "./a")], "img:1");
        let report = env
            .scheduler()
            .apply_release(&second, &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(report.reaped.deleted, vec!["web".to_string()]);

        let ns = env.wl_app.namespace();
        assert!(env.server.object("deployments", &ns, "bkapp-foo-stag-web").is_none());
        assert!(env.server.object("services", &ns, "bkapp-foo-stag-web").is_none());
        assert!(env.server.object("deployments", &ns, "bkapp-foo-stag-api").is_some());
    }

    #[tokio::test]
    async fn test_scale_is_idempotent_and_keeps_zero() {
        let env = TestEnv::new();
        let release = env.release(&[("web", "./start")], "img:1");
        env.scheduler().apply_release(&release, &BTreeMap::new()).await.unwrap();
        let scheduler = env.scheduler();

        scheduler.scale(env.wl_app.id, "web", 3).await.unwrap();
        assert_eq!(deployment_replicas(&env, "bkapp-foo-stag-web"), Some(3));
        env.server.reset_writes();
        scheduler.scale(env.wl_app.id, "web", 3).await.unwrap();
        assert_eq!(env.server.writes(), 0);

        scheduler.scale(env.wl_app.id, "web", 0).await.unwrap();
        assert_eq!(deployment_replicas(&env, "bkapp-foo-stag-web"), Some(0));

        let infos = scheduler.get_processes_info(env.wl_app.id).await.unwrap();
        assert_eq!(infos[0].target_replicas, 0);
        assert!(infos[0].instances.is_empty());
    }

    #[tokio::test]
    async fn test_scale_respects_plan_cap_and_deployments() {
        let env = TestEnv::new();
        let release = env.release(&[("web", "./start")], "img:1");
        env.scheduler().apply_release(&release, &BTreeMap::new()).await.unwrap();

        let err = env.scheduler().scale(env.wl_app.id, "web", 6).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        env.start_deployment();
        let err = env.scheduler().scale(env.wl_app.id, "web", 3).await.unwrap_err();
        assert_eq!(err.code(), "DEPLOYMENT_IN_PROGRESS");
        assert_eq!(deployment_replicas(&env, "bkapp-foo-stag-web"), Some(1));
    }

    #[tokio::test]
    async fn test_autoscaling_without_flag_warns_and_pins() {
        let env = TestEnv::new();
        let release = env.release(&[("web", "./start")], "img:1");
        env.scheduler().apply_release(&release, &BTreeMap::new()).await.unwrap();

        let config = AutoscalingConfig {
            min_replicas: 2,
            max_replicas: 4,
            metrics: vec![ScalingMetric {
                metric: MetricName::Cpu,
                target_type: MetricTargetType::Utilization,
                value: "70".into(),
            }],
            compute_by_limits: false,
        };
        env.scheduler()
            .set_autoscaling(env.wl_app.id, "web", Some(config))
            .await
            .unwrap();
        assert_eq!(deployment_replicas(&env, "bkapp-foo-stag-web"), Some(2));
        assert!(env
            .server
            .objects("generalpodautoscalers", &env.wl_app.namespace())
            .is_empty());

        let err = env.scheduler().scale(env.wl_app.id, "web", 5).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_switch_plan_rejects_unknown() {
        let env = TestEnv::new();
        let release = env.release(&[("web", "./start")], "img:1");
        env.scheduler().apply_release(&release, &BTreeMap::new()).await.unwrap();
        let err = env
            .scheduler()
            .switch_plan(env.wl_app.id, "web", "huge")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        env.scheduler()
            .switch_plan(env.wl_app.id, "web", "default")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_instances_and_scale_to_zero() {
        let env = TestEnv::new();
        let release = env.release(&[("web", "./start")], "img:1");
        env.scheduler().apply_release(&release, &BTreeMap::new()).await.unwrap();

        let infos = env.scheduler().get_processes_info(env.wl_app.id).await.unwrap();
        let instance = infos[0].instances[0].clone();
        assert_eq!(instance.release_version, Some(release.version));
        assert!(!instance.is_legacy);
        let fetched = env
            .scheduler()
            .get_instance(env.wl_app.id, &instance.name)
            .await
            .unwrap();
        assert_eq!(fetched.name, instance.name);
        assert!(env
            .scheduler()
            .instance_events(env.wl_app.id, &instance.name)
            .await
            .unwrap()
            .is_empty());

        assert_eq!(env.scheduler().scale_all_to_zero(env.wl_app.id).await.unwrap(), 1);
        assert_eq!(deployment_replicas(&env, "bkapp-foo-stag-web"), Some(0));
    }
}
