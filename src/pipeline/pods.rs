//! Run-once pods: builders and hooks
//!
//! A run-once pod is created with `restartPolicy: Never`, followed until it
//! ends and reported through its phase and first container exit code.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    Container, EnvVar, LocalObjectReference, Pod, PodSpec,
};
use tokio_util::sync::CancellationToken;

use crate::cluster::resources::object_meta;
use crate::cluster::{KubeClient, KubeError};
use crate::error::{EngineError, EngineResult};
use crate::stream::StreamChannel;

pub const PHASE_PENDING: &str = "Pending";
pub const PHASE_RUNNING: &str = "Running";
pub const PHASE_SUCCEEDED: &str = "Succeeded";
pub const PHASE_FAILED: &str = "Failed";

/// How a run-once pod ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodOutcome {
    pub succeeded: bool,
    pub exit_code: Option<i32>,
    pub logs: Vec<String>,
}

impl PodOutcome {
    pub fn tail(&self, n: usize) -> Vec<String> {
        self.logs[self.logs.len().saturating_sub(n)..].to_vec()
    }
}

/// Desired run-once pod
pub struct PodTemplate<'a> {
    pub name: &'a str,
    pub namespace: &'a str,
    pub labels: BTreeMap<String, String>,
    pub image: &'a str,
    pub command: Vec<String>,
    pub env: &'a BTreeMap<String, String>,
    pub pull_secret: Option<&'a str>,
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

pub fn run_once_pod(template: &PodTemplate<'_>) -> Pod {
    let env = template
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            value_from: None,
        })
        .collect();
    Pod {
        metadata: object_meta(template.name, Some(template.namespace), template.labels.clone()),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "main".to_string(),
                image: Some(template.image.to_string()),
                command: (!template.command.is_empty()).then(|| template.command.clone()),
                env: Some(env),
                image_pull_policy: Some("IfNotPresent".to_string()),
                ..Default::default()
            }],
            restart_policy: Some("Never".to_string()),
            image_pull_secrets: template.pull_secret.map(|name| {
                vec![LocalObjectReference {
                    name: name.to_string(),
                }]
            }),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or(PHASE_PENDING)
}

pub fn is_terminal(pod: &Pod) -> bool {
    matches!(phase(pod), PHASE_SUCCEEDED | PHASE_FAILED)
}

/// Logs can be read once the container started or already ended
pub fn logs_ready(pod: &Pod) -> bool {
    phase(pod) == PHASE_RUNNING || is_terminal(pod)
}

pub fn exit_code(pod: &Pod) -> Option<i32> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .first()?
        .state
        .as_ref()?
        .terminated
        .as_ref()
        .map(|t| t.exit_code)
}

// ============================================================================
// SBIO: I/O boundary
// ============================================================================

/// Create `pod`, replacing a leftover with the same name
pub async fn launch(client: &KubeClient, namespace: &str, pod: &Pod) -> Result<Pod, KubeError> {
    let name = pod.metadata.name.clone().unwrap_or_default();
    if client.delete::<Pod>(namespace, &name).await? {
        tracing::debug!(namespace, pod = %name, "removed leftover pod");
    }
    client.create(namespace, pod).await
}

/// Follow a run-once pod until it ends, forwarding new log lines
///
/// Returns `Interrupted` when `cancel` fires and `Internal` once `deadline`
/// passes; the pod is deleted in both cases.
pub async fn follow(
    client: &KubeClient,
    namespace: &str,
    name: &str,
    channel: &StreamChannel,
    poll: Duration,
    deadline: Duration,
    cancel: &CancellationToken,
) -> EngineResult<PodOutcome> {
    let started = tokio::time::Instant::now();
    let mut seen = 0usize;
    let mut logs: Vec<String> = Vec::new();

    loop {
        let pod: Pod = client.get(namespace, name).await?;
        if logs_ready(&pod) {
            let raw = client.read_pod_log(namespace, name, None).await?;
            for line in raw.lines().skip(seen) {
                channel.write_lossy(line).await;
                logs.push(line.to_string());
            }
            seen = logs.len();
        }
        if is_terminal(&pod) {
            return Ok(PodOutcome {
                succeeded: phase(&pod) == PHASE_SUCCEEDED,
                exit_code: exit_code(&pod),
                logs,
            });
        }

        if started.elapsed() >= deadline {
            client.delete::<Pod>(namespace, name).await?;
            return Err(EngineError::Internal(format!(
                "pod {} did not finish within {}s",
                name,
                deadline.as_secs()
            )));
        }
        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            _ = cancel.cancelled() => {
                client.delete::<Pod>(namespace, name).await?;
                return Err(EngineError::Interrupted(format!("pod {} stopped", name)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{MemoryApiServer, PodScript};
    use crate::store::Store;
    use crate::stream::StreamHub;
    use k8s_openapi::api::core::v1::Namespace;
    use std::sync::Arc;
    use uuid::Uuid;

    async fn client_with_ns(server: Arc<MemoryApiServer>) -> KubeClient {
        let client = KubeClient::new("c1", server);
        let ns = Namespace {
            metadata: object_meta("ns1", None, BTreeMap::new()),
            ..Default::default()
        };
        client.create("", &ns).await.unwrap();
        client
    }

    fn template<'a>(env: &'a BTreeMap<String, String>) -> PodTemplate<'a> {
        PodTemplate {
            name: "hook-1",
            namespace: "ns1",
            labels: BTreeMap::new(),
            image: "busybox",
            command: vec!["./migrate".into()],
            env,
            pull_secret: Some("bkapp-image-credentials"),
        }
    }

    #[test]
    fn test_run_once_pod_shape() {
        let env = BTreeMap::from([("A".to_string(), "1".to_string())]);
        let pod = run_once_pod(&template(&env));
        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.containers[0].command.as_ref().unwrap()[0], "./migrate");
        assert_eq!(
            spec.image_pull_secrets.unwrap()[0].name,
            "bkapp-image-credentials"
        );
    }

    #[tokio::test]
    async fn test_follow_collects_logs_and_exit_code() {
        let server = Arc::new(MemoryApiServer::new("c1"));
        server.set_pod_script("hook-", PodScript::failure(2, &["one", "two"]));
        let client = client_with_ns(server).await;
        let env = BTreeMap::new();
        launch(&client, "ns1", &run_once_pod(&template(&env)))
            .await
            .unwrap();

        let hub = StreamHub::in_memory(Arc::new(Store::new()));
        let channel = hub.channel(Uuid::new_v4(), "default");
        let outcome = follow(
            &client,
            "ns1",
            "hook-1",
            &channel,
            Duration::from_millis(5),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(!outcome.succeeded);
        assert_eq!(outcome.exit_code, Some(2));
        assert_eq!(outcome.logs, vec!["one", "two"]);
        assert_eq!(hub.history(channel.id()).await.unwrap().len(), 2);
    }
}
