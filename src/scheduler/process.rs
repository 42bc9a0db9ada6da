//! Process specs resolved for one environment

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::process::{DEFAULT_PORT, DEFAULT_PORT_NAME};
use crate::models::{
    AutoscalingConfig, Command, Environment, ImagePullPolicy, OverlayEnv, ProbeSet, ProcessSpec,
    ProcessSpecEnvOverlay, ResourcePlan,
};
use crate::store::Store;

/// A process with overlays and plan applied
#[derive(Debug, Clone)]
pub struct ResolvedProcess {
    pub name: String,
    pub command: Option<Vec<String>>,
    pub args: Option<Vec<String>>,
    pub port_name: String,
    pub port: i32,
    pub target_port: i32,
    pub image_pull_policy: ImagePullPolicy,
    pub replicas: i32,
    pub plan: ResourcePlan,
    pub autoscaling: Option<AutoscalingConfig>,
    pub probes: ProbeSet,
    pub env: BTreeMap<String, String>,
}

impl ResolvedProcess {
    /// Replicas written on the workload; autoscaled processes start at `min_replicas`
    pub fn declared_replicas(&self) -> i32 {
        match &self.autoscaling {
            Some(config) => config.min_replicas,
            None => self.replicas,
        }
    }
}

fn process_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([-a-z0-9]{0,30}[a-z0-9])?$").expect("valid process name pattern")
    })
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Validate declared `(type, command)` pairs into a procfile
pub fn validate_procfile(entries: &[(String, String)]) -> EngineResult<BTreeMap<String, String>> {
    if entries.is_empty() {
        return Err(EngineError::field(
            "procfile",
            "a release must declare at least one process",
        ));
    }
    let mut procfile = BTreeMap::new();
    for (name, command) in entries {
        if !process_name_pattern().is_match(name) {
            return Err(EngineError::field(
                "procfile",
                format!("'{}' is not a valid process type", name),
            ));
        }
        if command.trim().is_empty() {
            return Err(EngineError::field(
                "procfile",
                format!("process '{}' has an empty command", name),
            ));
        }
        if procfile.insert(name.clone(), command.clone()).is_some() {
            return Err(EngineError::field(
                "procfile",
                format!("process type '{}' is declared twice", name),
            ));
        }
    }
    Ok(procfile)
}

/// Overlay precedence: base spec, then `_global_`, then the environment
pub fn resolve(
    spec: &ProcessSpec,
    global: Option<&ProcessSpecEnvOverlay>,
    env: Option<&ProcessSpecEnvOverlay>,
    plan_of: impl Fn(&str) -> ResourcePlan,
) -> ResolvedProcess {
    let mut replicas = spec.target_replicas;
    let mut plan_name = spec.plan_name.clone();
    let mut autoscaling = spec.autoscaling;
    let mut scaling_config = spec.scaling_config.clone();

    for overlay in [global, env].into_iter().flatten() {
        if let Some(r) = overlay.target_replicas {
            replicas = r;
        }
        if let Some(p) = &overlay.plan_name {
            plan_name = p.clone();
        }
        if let Some(a) = overlay.autoscaling {
            autoscaling = a;
        }
        if let Some(c) = &overlay.scaling_config {
            scaling_config = Some(c.clone());
        }
    }

    let (command, args) = match (&spec.command, &spec.args, &spec.proc_command) {
        (None, None, Some(line)) => (Some(Command::split_command(line)), None),
        (command, args, _) => (command.clone(), args.clone()),
    };
    let target_port = spec.target_port.unwrap_or(DEFAULT_PORT);

    ResolvedProcess {
        name: spec.name.clone(),
        command,
        args,
        port_name: spec
            .port_name
            .clone()
            .unwrap_or_else(|| DEFAULT_PORT_NAME.to_string()),
        port: spec.port.unwrap_or(target_port),
        target_port,
        image_pull_policy: spec.image_pull_policy.unwrap_or_default(),
        replicas,
        plan: plan_of(&plan_name),
        autoscaling: if autoscaling { scaling_config } else { None },
        probes: spec.probes.clone(),
        env: spec.env.clone(),
    }
}

// ============================================================================
// SBIO: Store boundary
// ============================================================================

pub fn resolve_for_env(store: &Store, spec: &ProcessSpec, env: Environment) -> ResolvedProcess {
    let global = store.overlay(spec.id, OverlayEnv::Global);
    let scoped = store.overlay(spec.id, OverlayEnv::from(env));
    resolve(spec, global.as_ref(), scoped.as_ref(), |name| {
        store.plan_or_default(name)
    })
}

/// Resolve the processes a procfile declares, creating missing specs
pub fn resolve_procfile(
    store: &Store,
    module_id: Uuid,
    tenant_id: &str,
    env: Environment,
    procfile: &BTreeMap<String, String>,
) -> EngineResult<Vec<ResolvedProcess>> {
    let mut resolved = Vec::with_capacity(procfile.len());
    for (name, command) in procfile {
        let spec = match store.process_spec(module_id, name) {
            Ok(spec) => spec,
            Err(_) => store.process_specs.insert(ProcessSpec::new(
                module_id,
                name,
                Some(command.clone()),
                tenant_id,
            ))?,
        };
        let mut process = resolve_for_env(store, &spec, env);
        if spec.command.is_none() && spec.args.is_none() {
            process.command = Some(Command::split_command(command));
        }
        resolved.push(process);
    }
    Ok(resolved)
}

/// Make the module's process specs mirror a build's procfile
///
/// Existing specs keep their scaling and plan settings; only the command
/// changes. Specs for types no longer declared are removed with their
/// overlays.
pub fn sync_from_procfile(
    store: &Store,
    module_id: Uuid,
    tenant_id: &str,
    procfile: &BTreeMap<String, String>,
) -> EngineResult<()> {
    for (name, command) in procfile {
        match store.process_spec(module_id, name) {
            Ok(spec) if spec.proc_command.as_deref() != Some(command.as_str()) => {
                store.process_specs.update(&spec.id, |s| {
                    s.proc_command = Some(command.clone());
                    s.updated = Utc::now();
                })?;
            }
            Ok(_) => {}
            Err(_) => {
                store.process_specs.insert(ProcessSpec::new(
                    module_id,
                    name,
                    Some(command.clone()),
                    tenant_id,
                ))?;
            }
        }
    }

    let removed = store
        .process_specs
        .remove_where(|s| s.module_id == module_id && !procfile.contains_key(&s.name));
    for spec in removed {
        store.overlays.remove_where(|o| o.spec_id == spec.id);
        tracing::info!(module_id = %module_id, process = %spec.name, "removed process spec");
    }
    Ok(())
}

/// A process of some env running on a plan
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PlanUsage {
    pub app_code: String,
    pub module_name: String,
    pub environment: Environment,
    pub process_type: String,
}

/// Every env process whose effective plan is `plan_name`
pub fn plan_usages(store: &Store, plan_name: &str) -> Vec<PlanUsage> {
    let mut usages = Vec::new();
    for application in store.applications.all() {
        for module in store.modules_of(application.id) {
            let specs = store.process_specs_of(module.id);
            for env in store.module_envs.find(|e| e.module_id == module.id) {
                for spec in &specs {
                    let process = resolve_for_env(store, spec, env.environment);
                    if process.plan.name == plan_name {
                        usages.push(PlanUsage {
                            app_code: application.code.clone(),
                            module_name: module.name.clone(),
                            environment: env.environment,
                            process_type: process.name,
                        });
                    }
                }
            }
        }
    }
    usages.sort_by(|a, b| {
        (&a.app_code, &a.module_name, a.environment, &a.process_type)
            .cmp(&(&b.app_code, &b.module_name, b.environment, &b.process_type))
    });
    usages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MetricName, MetricTargetType, ScalingMetric};

    fn entries(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    #[test]
    fn test_validate_procfile() {
        let procfile = validate_procfile(&entries(&[("web", "./start"), ("worker", "celery")])).unwrap();
        assert_eq!(procfile.len(), 2);

        let err = validate_procfile(&[]).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let err = validate_procfile(&entries(&[("web", "a"), ("web", "b")])).unwrap_err();
        assert!(err.to_string().contains("declared twice"));

        assert!(validate_procfile(&entries(&[("Web_1", "a")])).is_err());
    }

    #[test]
    fn test_resolve_defaults() {
        let spec = ProcessSpec::new(Uuid::new_v4(), "web", Some("./start --fast".into()), "t");
        let p = resolve(&spec, None, None, |_| ResourcePlan::default_plan());
        assert_eq!(p.port, 5000);
        assert_eq!(p.target_port, 5000);
        assert_eq!(p.port_name, "http");
        assert_eq!(p.replicas, 1);
        assert_eq!(p.image_pull_policy, ImagePullPolicy::IfNotPresent);
        assert_eq!(
            p.command,
            Some(vec!["./start".to_string(), "--fast".to_string()])
        );
        assert!(p.autoscaling.is_none());
    }

    #[test]
    fn test_env_overlay_wins_over_global() {
        let spec = ProcessSpec::new(Uuid::new_v4(), "web", None, "t");
        let mut global = ProcessSpecEnvOverlay::new(spec.id, OverlayEnv::Global, "t");
        global.target_replicas = Some(2);
        global.plan_name = Some("large".into());
        let mut stag = ProcessSpecEnvOverlay::new(spec.id, OverlayEnv::Stag, "t");
        stag.target_replicas = Some(3);
        stag.autoscaling = Some(true);
        stag.scaling_config = Some(AutoscalingConfig {
            min_replicas: 1,
            max_replicas: 4,
            metrics: vec![ScalingMetric {
                metric: MetricName::Cpu,
                target_type: MetricTargetType::Utilization,
                value: "80".into(),
            }],
            compute_by_limits: false,
        });

        let p = resolve(&spec, Some(&global), Some(&stag), |name| {
            let mut plan = ResourcePlan::default_plan();
            plan.name = name.to_string();
            plan
        });
        assert_eq!(p.replicas, 3);
        assert_eq!(p.plan.name, "large");
        assert_eq!(p.autoscaling.unwrap().max_replicas, 4);
    }

    #[test]
    fn test_sync_from_procfile() {
        let store = Store::new();
        let module_id = Uuid::new_v4();
        let mut procfile = BTreeMap::new();
        procfile.insert("web".to_string(), "./a".to_string());
        sync_from_procfile(&store, module_id, "t", &procfile).unwrap();

        let web = store.process_spec(module_id, "web").unwrap();
        store
            .process_specs
            .update(&web.id, |s| s.target_replicas = 4)
            .unwrap();

        let mut renamed = BTreeMap::new();
        renamed.insert("api".to_string(), "./a".to_string());
        sync_from_procfile(&store, module_id, "t", &renamed).unwrap();
        assert!(store.process_spec(module_id, "web").is_err());
        assert_eq!(store.process_spec(module_id, "api").unwrap().target_replicas, 1);
    }

    #[test]
    fn test_plan_fallback() {
        let store = Store::new();
        let spec = ProcessSpec::new(Uuid::new_v4(), "web", None, "t");
        let mut spec = spec;
        spec.plan_name = "missing".into();
        let p = resolve_for_env(&store, &spec, Environment::Stag);
        assert_eq!(p.plan.name, "default");
    }
}
