//! Observed process state
//!
//! Pods carry their generation in the `mapper_version` label; anything not
//! from the current generation is reported as legacy and never counts
//! towards readiness.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Event, Pod};
use serde::{Deserialize, Serialize};

use crate::cluster::resources::{
    KubeResource, LABEL_MAPPER_VERSION, LABEL_PROCESS_TYPE, LABEL_RELEASE_VERSION,
};
use crate::models::MapperVersion;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub name: String,
    pub process_type: String,
    pub phase: String,
    pub ready: bool,
    pub mapper_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub restart_count: i32,
    pub is_legacy: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub process_type: String,
    pub target_replicas: i32,
    pub ready_replicas: i32,
    pub autoscaling: bool,
    pub plan: String,
    pub instances: Vec<InstanceInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceEvent {
    pub reason: String,
    pub message: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
}

/// Readiness verdict for one release
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Readiness {
    pub not_ready: Vec<String>,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        self.not_ready.is_empty()
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

pub fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

pub fn pod_phase(pod: &Pod) -> String {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_else(|| "Unknown".to_string())
}

pub fn instance_info(pod: &Pod, current: MapperVersion) -> InstanceInfo {
    let labels = pod.labels();
    let mapper_version = labels
        .get(LABEL_MAPPER_VERSION)
        .cloned()
        .unwrap_or_else(|| MapperVersion::V1.to_string());
    let status = pod.status.as_ref();
    let first_container = status
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|c| c.first());

    InstanceInfo {
        name: pod.name().to_string(),
        process_type: labels.get(LABEL_PROCESS_TYPE).cloned().unwrap_or_default(),
        phase: pod_phase(pod),
        ready: pod_is_ready(pod),
        is_legacy: mapper_version != current.as_str(),
        mapper_version,
        release_version: labels
            .get(LABEL_RELEASE_VERSION)
            .and_then(|v| v.parse().ok()),
        start_time: status
            .and_then(|s| s.start_time.as_ref())
            .map(|t| t.0.to_rfc3339()),
        image: first_container.map(|c| c.image.clone()).or_else(|| {
            pod.spec
                .as_ref()
                .and_then(|s| s.containers.first())
                .and_then(|c| c.image.clone())
        }),
        restart_count: first_container.map(|c| c.restart_count).unwrap_or(0),
    }
}

/// Rolled out: status observed, all replicas updated, `Available=True`
pub fn deployment_rolled_out(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let Some(status) = deployment.status.as_ref() else {
        return desired == 0;
    };
    let generation = deployment.metadata.generation.unwrap_or(0);
    if status.observed_generation.unwrap_or(0) < generation {
        return false;
    }
    if desired == 0 {
        return true;
    }
    let available = status
        .conditions
        .as_ref()
        .map(|c| c.iter().any(|c| c.type_ == "Available" && c.status == "True"))
        .unwrap_or(false);
    status.updated_replicas.unwrap_or(0) == desired && available
}

/// Judge readiness of `expected` process types at `release_version`
pub fn judge_readiness(
    expected: &BTreeMap<String, i32>,
    deployments: &BTreeMap<String, Deployment>,
    pods: &[Pod],
    mapper: MapperVersion,
    release_version: u32,
) -> Readiness {
    let mut not_ready = Vec::new();
    for (process_type, replicas) in expected {
        if *replicas == 0 {
            continue;
        }
        let rolled_out = deployments
            .get(process_type)
            .map(deployment_rolled_out)
            .unwrap_or(false);
        let has_ready_pod = pods.iter().any(|pod| {
            let labels = pod.labels();
            labels.get(LABEL_PROCESS_TYPE) == Some(process_type)
                && labels.get(LABEL_MAPPER_VERSION).map(String::as_str) == Some(mapper.as_str())
                && labels.get(LABEL_RELEASE_VERSION) == Some(&release_version.to_string())
                && pod_is_ready(pod)
        });
        if !(rolled_out && has_ready_pod) {
            not_ready.push(process_type.clone());
        }
    }
    Readiness { not_ready }
}

pub fn instance_event(event: &Event) -> InstanceEvent {
    InstanceEvent {
        reason: event.reason.clone().unwrap_or_default(),
        message: event.message.clone().unwrap_or_default(),
        type_: event.type_.clone().unwrap_or_else(|| "Normal".to_string()),
        count: event.count.unwrap_or(1),
        last_seen: event
            .last_timestamp
            .as_ref()
            .map(|t| t.0.to_rfc3339()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(process_type: &str, mapper: &str, version: u32, ready: bool) -> Pod {
        serde_json::from_value(json!({
            "metadata": {
                "name": format!("{}-{}-{}", process_type, mapper, version),
                "labels": {
                    "process_type": process_type,
                    "mapper_version": mapper,
                    "release_version": version.to_string(),
                }
            },
            "status": {
                "phase": "Running",
                "conditions": [{"type": "Ready", "status": if ready { "True" } else { "False" }}],
                "containerStatuses": [{
                    "name": process_type, "image": "img:1", "imageID": "",
                    "ready": ready, "restartCount": 2
                }]
            }
        }))
        .unwrap()
    }

    fn deployment(replicas: i32, updated: i32, available: bool) -> Deployment {
        serde_json::from_value(json!({
            "metadata": {"name": "d", "generation": 2},
            "spec": {
                "replicas": replicas,
                "selector": {},
                "template": {}
            },
            "status": {
                "observedGeneration": 2,
                "updatedReplicas": updated,
                "conditions": [{"type": "Available", "status": if available { "True" } else { "False" }}]
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_rolled_out() {
        assert!(deployment_rolled_out(&deployment(2, 2, true)));
        assert!(!deployment_rolled_out(&deployment(2, 1, true)));
        assert!(!deployment_rolled_out(&deployment(2, 2, false)));
        assert!(deployment_rolled_out(&deployment(0, 0, false)));
    }

    #[test]
    fn test_readiness_ignores_other_generations_and_versions() {
        let expected: BTreeMap<String, i32> =
            [("web".to_string(), 1), ("worker".to_string(), 0)].into();
        let deployments: BTreeMap<String, Deployment> =
            [("web".to_string(), deployment(1, 1, true))].into();

        let stale = vec![pod("web", "v1", 3, true), pod("web", "v2", 2, true)];
        let verdict = judge_readiness(&expected, &deployments, &stale, MapperVersion::V2, 3);
        assert_eq!(verdict.not_ready, vec!["web".to_string()]);

        let fresh = vec![pod("web", "v2", 3, true)];
        assert!(judge_readiness(&expected, &deployments, &fresh, MapperVersion::V2, 3).is_ready());
    }

    #[test]
    fn test_instance_info_flags_legacy() {
        let info = instance_info(&pod("web", "v1", 1, true), MapperVersion::V2);
        assert!(info.is_legacy);
        assert_eq!(info.restart_count, 2);
        assert_eq!(info.image.as_deref(), Some("img:1"));
        assert_eq!(info.release_version, Some(1));
        assert!(!instance_info(&pod("web", "v2", 1, true), MapperVersion::V2).is_legacy);
    }
}
