//! Application provisioning
//!
//! Creates the records every other operation starts from: the application,
//! its modules, one module env per environment and the WlApp plus initial
//! config behind each of them.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{CipherManager, EncryptedString};
use crate::error::{EngineError, EngineResult};
use crate::models::{
    AppType, Application, BuildConfig, Config, Environment, HookSpec, Module, ModuleEnv,
    SourceOrigin, WlApp,
};
use crate::store::Store;

#[derive(Debug, Clone, Deserialize)]
pub struct ModuleRequest {
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub source_origin: SourceOrigin,
    #[serde(default)]
    pub build_config: BuildConfig,
    #[serde(default)]
    pub pre_release_hook: Option<HookSpec>,
    #[serde(default)]
    pub model_annotations: BTreeMap<String, String>,
    /// Cluster pinned in the initial configs; empty means the region default
    #[serde(default)]
    pub cluster: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionRequest {
    pub code: String,
    pub name: String,
    pub region: String,
    #[serde(rename = "type", default = "default_app_type")]
    pub app_type: AppType,
    pub secret: String,
    pub modules: Vec<ModuleRequest>,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
}

fn default_app_type() -> AppType {
    AppType::Default
}

fn default_tenant() -> String {
    "default".to_string()
}

/// One provisioned module environment
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionedEnv {
    pub module: String,
    pub environment: Environment,
    pub module_env_id: Uuid,
    pub wl_app_id: Uuid,
    pub wl_app_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Provisioned {
    pub application_id: Uuid,
    pub code: String,
    pub envs: Vec<ProvisionedEnv>,
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

fn validate(req: &ProvisionRequest) -> EngineResult<()> {
    if req.code.trim().is_empty() {
        return Err(EngineError::field("code", "must not be empty"));
    }
    if req.code.len() > 20 || !req.code.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_') {
        return Err(EngineError::field(
            "code",
            "use at most 20 lower-case letters, digits, '-' or '_'",
        ));
    }
    if req.secret.is_empty() {
        return Err(EngineError::field("secret", "must not be empty"));
    }
    let defaults = req.modules.iter().filter(|m| m.is_default).count();
    if defaults != 1 {
        return Err(EngineError::field(
            "modules",
            format!("exactly one default module is required, got {}", defaults),
        ));
    }
    let mut names: Vec<&str> = req.modules.iter().map(|m| m.name.as_str()).collect();
    names.sort_unstable();
    if names.windows(2).any(|w| w[0] == w[1]) {
        return Err(EngineError::field("modules", "module names must be unique"));
    }
    Ok(())
}

// ============================================================================
// SBIO: Store boundary
// ============================================================================

/// Create an application with all its module environments
pub fn provision(
    store: &Store,
    cipher: &CipherManager,
    req: ProvisionRequest,
) -> EngineResult<Provisioned> {
    validate(&req)?;
    if store.application_by_code(&req.code).is_ok() {
        return Err(EngineError::conflict(
            "APP_ALREADY_EXISTS",
            format!("application '{}' already exists", req.code),
        ));
    }

    let now = Utc::now();
    let application = store.applications.insert(Application {
        id: Uuid::new_v4(),
        code: req.code.clone(),
        name: req.name.clone(),
        region: req.region.clone(),
        app_type: req.app_type,
        secret: EncryptedString::seal(cipher, &req.secret)?,
        tenant_id: req.tenant_id.clone(),
        created: now,
        updated: now,
    })?;

    let mut envs = Vec::new();
    for spec in req.modules {
        let module = store.modules.insert(Module {
            id: Uuid::new_v4(),
            application_id: application.id,
            name: spec.name.clone(),
            is_default: spec.is_default,
            source_origin: spec.source_origin,
            build_config: spec.build_config,
            pre_release_hook: spec.pre_release_hook,
            model_annotations: spec.model_annotations,
            tenant_id: req.tenant_id.clone(),
            created: now,
            updated: now,
        })?;

        for environment in Environment::all() {
            let wl_app = store.wl_apps.insert(WlApp {
                id: Uuid::new_v4(),
                region: req.region.clone(),
                name: WlApp::name_for(&req.code, &module.name, module.is_default, environment),
                app_type: req.app_type,
                app_code: req.code.clone(),
                module_name: module.name.clone(),
                environment,
                tenant_id: req.tenant_id.clone(),
                created: now,
                updated: now,
            })?;
            let mut config = Config::initial(wl_app.id, &req.tenant_id);
            config.cluster = spec.cluster.clone();
            store.append_config(config)?;

            let module_env = store.module_envs.insert(ModuleEnv {
                id: Uuid::new_v4(),
                module_id: module.id,
                environment,
                wl_app_id: wl_app.id,
                is_offlined: false,
                tenant_id: req.tenant_id.clone(),
                created: now,
                updated: now,
            })?;
            envs.push(ProvisionedEnv {
                module: module.name.clone(),
                environment,
                module_env_id: module_env.id,
                wl_app_id: wl_app.id,
                wl_app_name: wl_app.name,
            });
        }
    }

    tracing::info!(app_code = %application.code, envs = envs.len(), "provisioned application");
    Ok(Provisioned {
        application_id: application.id,
        code: application.code,
        envs,
    })
}
