//! In-memory persistence for engine entities
//!
//! Each entity lives in a [`Table`]; uniqueness rules of the data model are
//! enforced by the tables' unique indexes. Per-WlApp mutations that allocate
//! versions or check for running deployments go through [`Store::lock_app`].

pub mod table;

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

pub use table::{Record, Table};

use crate::models::*;
use crate::record;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    Duplicate(String),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

record!(Application, "application", id: Uuid);
record!(Module, "module", id: Uuid);
record!(ModuleEnv, "module env", id: Uuid);
record!(ConfigVar, "config var", id: Uuid);
record!(WlApp, "wl app", id: Uuid);
record!(Config, "config", id: Uuid);
record!(Build, "build", id: Uuid);
record!(BuildProcess, "build process", id: Uuid);
record!(Release, "release", id: Uuid);
record!(Command, "command", id: Uuid);
record!(ProcessSpec, "process spec", id: Uuid);
record!(ProcessSpecEnvOverlay, "process spec overlay", id: Uuid);
record!(AppDomain, "app domain", id: Uuid);
record!(AppSubpath, "app subpath", id: Uuid);
record!(Domain, "domain", id: Uuid);
record!(AppDomainSharedCert, "shared cert", name: String);
record!(Cluster, "cluster", name: String);
record!(AppUserCredential, "user credential", id: Uuid);
record!(AppImageCredential, "image credential", id: Uuid);
record!(ResourcePlan, "plan", name: String);
record!(Deployment, "deployment", id: Uuid);
record!(ArchiveOperation, "archive operation", id: Uuid);
record!(OutputStream, "output stream", id: Uuid);

/// The product-side records behind one WlApp
#[derive(Debug, Clone)]
pub struct EnvRecords {
    pub application: Application,
    pub module: Module,
    pub module_env: ModuleEnv,
    pub wl_app: WlApp,
}

/// Per-WlApp counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Counter {
    ConfigVersion,
    ReleaseVersion,
    BuildGeneration,
}

pub struct Store {
    pub applications: Table<Application>,
    pub modules: Table<Module>,
    pub module_envs: Table<ModuleEnv>,
    pub config_vars: Table<ConfigVar>,
    pub wl_apps: Table<WlApp>,
    pub configs: Table<Config>,
    pub builds: Table<Build>,
    pub build_processes: Table<BuildProcess>,
    pub releases: Table<Release>,
    pub commands: Table<Command>,
    pub process_specs: Table<ProcessSpec>,
    pub overlays: Table<ProcessSpecEnvOverlay>,
    pub app_domains: Table<AppDomain>,
    pub app_subpaths: Table<AppSubpath>,
    pub domains: Table<Domain>,
    pub shared_certs: Table<AppDomainSharedCert>,
    pub clusters: Table<Cluster>,
    pub user_credentials: Table<AppUserCredential>,
    pub image_credentials: Table<AppImageCredential>,
    pub plans: Table<ResourcePlan>,
    pub deployments: Table<Deployment>,
    pub archive_operations: Table<ArchiveOperation>,
    pub output_streams: Table<OutputStream>,
    counters: DashMap<(Uuid, Counter), u32>,
    app_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        let store = Self {
            applications: Table::with_unique(|a| a.code.clone()),
            modules: Table::with_unique(|m| format!("{}/{}", m.application_id, m.name)),
            module_envs: Table::with_unique(|e| format!("{}/{}", e.module_id, e.environment)),
            config_vars: Table::new(),
            wl_apps: Table::with_unique(|a| a.name.clone()),
            configs: Table::with_unique(|c| format!("{}/{}", c.wl_app_id, c.version)),
            builds: Table::new(),
            build_processes: Table::with_unique(|b| format!("{}/{}", b.wl_app_id, b.generation)),
            releases: Table::with_unique(|r| format!("{}/{}", r.wl_app_id, r.version)),
            commands: Table::new(),
            process_specs: Table::with_unique(|s| format!("{}/{}", s.module_id, s.name)),
            overlays: Table::with_unique(|o| format!("{}/{:?}", o.spec_id, o.environment)),
            app_domains: Table::with_unique(|d| format!("{}{}", d.host, d.path_prefix)),
            app_subpaths: Table::with_unique(|s| format!("{}/{}", s.cluster_name, s.subpath)),
            domains: Table::with_unique(|d| format!("{}{}", d.name, d.path_prefix)),
            shared_certs: Table::new(),
            clusters: Table::new(),
            user_credentials: Table::with_unique(|c| {
                format!("{}/{}", c.application_id, c.name)
            }),
            image_credentials: Table::with_unique(|c| format!("{}/{}", c.wl_app_id, c.registry)),
            plans: Table::new(),
            deployments: Table::new(),
            archive_operations: Table::new(),
            output_streams: Table::new(),
            counters: DashMap::new(),
            app_locks: DashMap::new(),
        };
        // The default plan is always resolvable
        let _ = store.plans.insert(ResourcePlan::default_plan());
        store
    }

    // =========================================================================
    // Per-WlApp serialization
    // =========================================================================

    /// Acquire the critical section of one WlApp
    pub async fn lock_app(&self, wl_app_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self
            .app_locks
            .entry(wl_app_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    fn next(&self, wl_app_id: Uuid, counter: Counter) -> u32 {
        let mut entry = self.counters.entry((wl_app_id, counter)).or_insert(0);
        *entry += 1;
        *entry
    }

    // =========================================================================
    // Applications and environments
    // =========================================================================

    pub fn application_by_code(&self, code: &str) -> Result<Application, StoreError> {
        self.applications
            .find_one(|a| a.code == code)
            .ok_or_else(|| StoreError::NotFound(format!("application {}", code)))
    }

    pub fn module_by_name(&self, application_id: Uuid, name: &str) -> Result<Module, StoreError> {
        self.modules
            .find_one(|m| m.application_id == application_id && m.name == name)
            .ok_or_else(|| StoreError::NotFound(format!("module {}", name)))
    }

    pub fn modules_of(&self, application_id: Uuid) -> Vec<Module> {
        let mut modules = self.modules.find(|m| m.application_id == application_id);
        modules.sort_by(|a, b| a.name.cmp(&b.name));
        modules
    }

    pub fn default_module(&self, application_id: Uuid) -> Result<Module, StoreError> {
        self.modules
            .find_one(|m| m.application_id == application_id && m.is_default)
            .ok_or_else(|| StoreError::NotFound("default module".into()))
    }

    pub fn module_env(&self, module_id: Uuid, env: Environment) -> Result<ModuleEnv, StoreError> {
        self.module_envs
            .find_one(|e| e.module_id == module_id && e.environment == env)
            .ok_or_else(|| StoreError::NotFound(format!("module env {}", env)))
    }

    pub fn module_env_of_wl_app(&self, wl_app_id: Uuid) -> Result<ModuleEnv, StoreError> {
        self.module_envs
            .find_one(|e| e.wl_app_id == wl_app_id)
            .ok_or_else(|| StoreError::NotFound(format!("module env of wl app {}", wl_app_id)))
    }

    pub fn config_vars_for(&self, module_id: Uuid, env: Environment) -> Vec<ConfigVar> {
        let mut vars = self
            .config_vars
            .find(|v| v.module_id == module_id && v.scope.applies_to(env));
        // Global first so environment-scoped values override
        vars.sort_by_key(|v| (v.scope != ConfigVarScope::Global, v.key.clone()));
        vars
    }

    pub fn env_records(&self, wl_app_id: Uuid) -> Result<EnvRecords, StoreError> {
        let wl_app = self.wl_apps.get(&wl_app_id)?;
        let module_env = self.module_env_of_wl_app(wl_app_id)?;
        let module = self.modules.get(&module_env.module_id)?;
        let application = self.applications.get(&module.application_id)?;
        Ok(EnvRecords {
            application,
            module,
            module_env,
            wl_app,
        })
    }

    /// An env runs when it has a successful release and is not offlined
    pub fn env_is_running(&self, module_env: &ModuleEnv) -> bool {
        !module_env.is_offlined && self.latest_successful_release(module_env.wl_app_id).is_some()
    }

    // =========================================================================
    // Configs
    // =========================================================================

    pub fn latest_config(&self, wl_app_id: Uuid) -> Result<Config, StoreError> {
        self.configs
            .find(|c| c.wl_app_id == wl_app_id)
            .into_iter()
            .max_by_key(|c| c.version)
            .ok_or_else(|| StoreError::NotFound(format!("config of wl app {}", wl_app_id)))
    }

    /// Persist `draft` under the next config version
    pub fn append_config(&self, mut draft: Config) -> Result<Config, StoreError> {
        draft.version = self.next(draft.wl_app_id, Counter::ConfigVersion);
        draft.id = Uuid::new_v4();
        let now = Utc::now();
        draft.created = now;
        draft.updated = now;
        self.configs.insert(draft)
    }

    // =========================================================================
    // Builds and releases
    // =========================================================================

    pub fn next_build_generation(&self, wl_app_id: Uuid) -> u32 {
        self.next(wl_app_id, Counter::BuildGeneration)
    }

    pub fn next_release_version(&self, wl_app_id: Uuid) -> u32 {
        self.next(wl_app_id, Counter::ReleaseVersion)
    }

    /// Build processes newest generation first
    pub fn build_processes_of(&self, wl_app_id: Uuid) -> Vec<BuildProcess> {
        let mut items = self.build_processes.find(|b| b.wl_app_id == wl_app_id);
        items.sort_by(|a, b| b.generation.cmp(&a.generation));
        items
    }

    /// Releases newest version first
    pub fn releases_of(&self, wl_app_id: Uuid) -> Vec<Release> {
        let mut items = self.releases.find(|r| r.wl_app_id == wl_app_id);
        items.sort_by(|a, b| b.version.cmp(&a.version));
        items
    }

    pub fn latest_release(&self, wl_app_id: Uuid) -> Option<Release> {
        self.releases_of(wl_app_id).into_iter().next()
    }

    pub fn latest_successful_release(&self, wl_app_id: Uuid) -> Option<Release> {
        self.releases_of(wl_app_id)
            .into_iter()
            .find(|r| r.is_successful())
    }

    pub fn release_by_version(&self, wl_app_id: Uuid, version: u32) -> Result<Release, StoreError> {
        self.releases
            .find_one(|r| r.wl_app_id == wl_app_id && r.version == version)
            .ok_or_else(|| StoreError::NotFound(format!("release v{}", version)))
    }

    // =========================================================================
    // Deployments
    // =========================================================================

    pub fn running_deployment(&self, wl_app_id: Uuid) -> Option<Deployment> {
        self.deployments
            .find_one(|d| d.wl_app_id == wl_app_id && d.is_in_progress())
    }

    pub fn deployments_of(&self, module_env_id: Uuid) -> Vec<Deployment> {
        let mut items = self.deployments.find(|d| d.module_env_id == module_env_id);
        items.sort_by(|a, b| b.created.cmp(&a.created));
        items
    }

    pub fn pending_deployment_for_build(&self, build_process_id: Uuid) -> Option<Deployment> {
        self.deployments.find_one(|d| {
            d.build_process_id == Some(build_process_id) && d.is_in_progress()
        })
    }

    // =========================================================================
    // Process specs
    // =========================================================================

    pub fn process_specs_of(&self, module_id: Uuid) -> Vec<ProcessSpec> {
        let mut specs = self.process_specs.find(|s| s.module_id == module_id);
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn process_spec(&self, module_id: Uuid, name: &str) -> Result<ProcessSpec, StoreError> {
        self.process_specs
            .find_one(|s| s.module_id == module_id && s.name == name)
            .ok_or_else(|| StoreError::NotFound(format!("process {}", name)))
    }

    pub fn overlay(&self, spec_id: Uuid, env: OverlayEnv) -> Option<ProcessSpecEnvOverlay> {
        self.overlays
            .find_one(|o| o.spec_id == spec_id && o.environment == env)
    }

    /// Update the overlay of `(spec, env)`, creating it on first use
    pub fn upsert_overlay(
        &self,
        spec: &ProcessSpec,
        env: OverlayEnv,
        f: impl FnOnce(&mut ProcessSpecEnvOverlay),
    ) -> Result<ProcessSpecEnvOverlay, StoreError> {
        match self.overlay(spec.id, env) {
            Some(existing) => self.overlays.update(&existing.id, f),
            None => {
                let mut overlay = ProcessSpecEnvOverlay::new(spec.id, env, &spec.tenant_id);
                f(&mut overlay);
                self.overlays.insert(overlay)
            }
        }
    }

    // =========================================================================
    // Clusters and plans
    // =========================================================================

    /// Save a cluster, keeping a single default per region
    pub fn upsert_cluster(&self, cluster: Cluster) -> Result<Cluster, StoreError> {
        if cluster.is_default {
            for other in self
                .clusters
                .find(|c| c.region == cluster.region && c.is_default && c.name != cluster.name)
            {
                self.clusters.update(&other.name, |c| c.is_default = false)?;
            }
        }
        self.clusters.upsert(cluster)
    }

    pub fn default_cluster(&self, region: &str) -> Option<Cluster> {
        self.clusters
            .find_one(|c| c.region == region && c.is_default)
    }

    /// Resolve a plan, falling back to `default`
    pub fn plan_or_default(&self, name: &str) -> ResourcePlan {
        self.plans
            .get(&name.to_string())
            .ok()
            .filter(|p| p.is_active)
            .or_else(|| self.plans.get(&process::DEFAULT_PLAN.to_string()).ok())
            .unwrap_or_else(ResourcePlan::default_plan)
    }

    // =========================================================================
    // Credentials
    // =========================================================================

    pub fn user_credential(
        &self,
        application_id: Uuid,
        name: &str,
    ) -> Option<AppUserCredential> {
        self.user_credentials
            .find_one(|c| c.application_id == application_id && c.name == name)
    }

    pub fn image_credentials_of(&self, wl_app_id: Uuid) -> Vec<AppImageCredential> {
        let mut items = self.image_credentials.find(|c| c.wl_app_id == wl_app_id);
        items.sort_by(|a, b| a.registry.cmp(&b.registry));
        items
    }

    // =========================================================================
    // Output streams
    // =========================================================================

    pub fn append_output(&self, stream_id: Uuid, tenant_id: &str, stream: &str, line: &str) {
        let entry = OutputLine {
            stream: stream.to_string(),
            line: line.to_string(),
            created: Utc::now(),
        };
        let appended = self
            .output_streams
            .update(&stream_id, |s| s.lines.push(entry.clone()));
        if appended.is_err() {
            let now = Utc::now();
            let _ = self.output_streams.insert(OutputStream {
                id: stream_id,
                lines: vec![entry],
                tenant_id: tenant_id.to_string(),
                created: now,
                updated: now,
            });
        }
    }
}
