//! Declarative per-process intent and its per-environment overlays

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Probe;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::app::Environment;

pub const DEFAULT_PORT: i32 = 5000;
pub const DEFAULT_PORT_NAME: &str = "http";
pub const DEFAULT_PLAN: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ImagePullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

impl ImagePullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImagePullPolicy::Always => "Always",
            ImagePullPolicy::IfNotPresent => "IfNotPresent",
            ImagePullPolicy::Never => "Never",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricName {
    Cpu,
    Memory,
}

/// Only utilization and average-value targets are supported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricTargetType {
    Utilization,
    AverageValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingMetric {
    pub metric: MetricName,
    pub target_type: MetricTargetType,
    /// Percentage for utilization, a quantity such as `500m` or `1Gi` otherwise
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalingConfig {
    pub min_replicas: i32,
    pub max_replicas: i32,
    #[serde(default)]
    pub metrics: Vec<ScalingMetric>,
    /// Compute utilization against limits instead of requests
    #[serde(default)]
    pub compute_by_limits: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup: Option<Probe>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub id: Uuid,
    pub module_id: Uuid,
    /// Process type, a DNS label
    pub name: String,
    /// Command string from the procfile
    #[serde(default)]
    pub proc_command: Option<String>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub port_name: Option<String>,
    #[serde(default)]
    pub port: Option<i32>,
    #[serde(default)]
    pub target_port: Option<i32>,
    #[serde(default)]
    pub image_pull_policy: Option<ImagePullPolicy>,
    pub target_replicas: i32,
    pub plan_name: String,
    #[serde(default)]
    pub autoscaling: bool,
    #[serde(default)]
    pub scaling_config: Option<AutoscalingConfig>,
    #[serde(default)]
    pub probes: ProbeSet,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub tenant_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl ProcessSpec {
    pub fn new(module_id: Uuid, name: &str, proc_command: Option<String>, tenant_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            module_id,
            name: name.to_string(),
            proc_command,
            command: None,
            args: None,
            port_name: None,
            port: None,
            target_port: None,
            image_pull_policy: None,
            target_replicas: 1,
            plan_name: DEFAULT_PLAN.to_string(),
            autoscaling: false,
            scaling_config: None,
            probes: ProbeSet::default(),
            env: BTreeMap::new(),
            tenant_id: tenant_id.to_string(),
            created: now,
            updated: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OverlayEnv {
    #[serde(rename = "stag")]
    Stag,
    #[serde(rename = "prod")]
    Prod,
    #[serde(rename = "_global_")]
    Global,
}

impl From<Environment> for OverlayEnv {
    fn from(env: Environment) -> Self {
        match env {
            Environment::Stag => OverlayEnv::Stag,
            Environment::Prod => OverlayEnv::Prod,
        }
    }
}

/// Field overrides of a base spec for one environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpecEnvOverlay {
    pub id: Uuid,
    pub spec_id: Uuid,
    pub environment: OverlayEnv,
    #[serde(default)]
    pub target_replicas: Option<i32>,
    #[serde(default)]
    pub plan_name: Option<String>,
    #[serde(default)]
    pub autoscaling: Option<bool>,
    #[serde(default)]
    pub scaling_config: Option<AutoscalingConfig>,
    pub tenant_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl ProcessSpecEnvOverlay {
    pub fn new(spec_id: Uuid, environment: OverlayEnv, tenant_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            spec_id,
            environment,
            target_replicas: None,
            plan_name: None,
            autoscaling: None,
            scaling_config: None,
            tenant_id: tenant_id.to_string(),
            created: now,
            updated: now,
        }
    }
}

/// Procfile entries as a client declared them
///
/// A JSON object with a repeated process type keeps both entries, so
/// validation can reject the duplicate instead of the last one winning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeclaredProcfile(Vec<(String, String)>);

impl DeclaredProcfile {
    pub fn entries(&self) -> &[(String, String)] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, String>> for DeclaredProcfile {
    fn from(procfile: BTreeMap<String, String>) -> Self {
        Self(procfile.into_iter().collect())
    }
}

impl From<Vec<(String, String)>> for DeclaredProcfile {
    fn from(entries: Vec<(String, String)>) -> Self {
        Self(entries)
    }
}

impl Serialize for DeclaredProcfile {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, command) in &self.0 {
            map.serialize_entry(name, command)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for DeclaredProcfile {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> serde::de::Visitor<'de> for EntriesVisitor {
            type Value = DeclaredProcfile;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a map of process type to command")
            }

            fn visit_map<A: serde::de::MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, command)) = access.next_entry::<String, String>()? {
                    entries.push((name, command));
                }
                Ok(DeclaredProcfile(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_procfile_keeps_repeated_types() {
        let procfile: DeclaredProcfile =
            serde_json::from_str(r#"{"web": "./a", "worker": "celery", "web": "./b"}"#).unwrap();
        assert_eq!(
            procfile.entries(),
            &[
                ("web".to_string(), "./a".to_string()),
                ("worker".to_string(), "celery".to_string()),
                ("web".to_string(), "./b".to_string()),
            ]
        );
        assert_eq!(
            serde_json::to_value(&procfile).unwrap(),
            serde_json::json!({"web": "./b", "worker": "celery"})
        );
    }
}
