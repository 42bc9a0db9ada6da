//! # Background Workers
//!
//! Long-running work (builds, deployments, commands, archives) is submitted
//! as typed [`Job`]s carrying ids only. Workers re-fetch state on entry, so
//! re-running a finished job returns the persisted result unchanged.
//!
//! ```text
//!   API ──submit──▶ mpsc queue ──▶ worker 1..N ──▶ JobExecutor ──▶ JobOutcome
//! ```

pub mod archive;
pub mod sweeper;

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use archive::Archiver;
pub use sweeper::spawn_sweeper;

use crate::error::EngineResult;
use crate::pipeline::Pipeline;

/// Payload layout version workers understand
pub const JOB_VERSION: u32 = 1;

const QUEUE_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("task queue is closed")]
    QueueClosed,
}

// ============================================================================
// Data structures (pure, no I/O)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Job {
    Build {
        build_process_id: Uuid,
    },
    Deploy {
        deployment_id: Uuid,
        #[serde(default)]
        extra_envs: BTreeMap<String, String>,
    },
    Command {
        command_id: Uuid,
        #[serde(default)]
        stream_channel_id: Option<Uuid>,
        #[serde(default)]
        extra_envs: Option<BTreeMap<String, String>>,
    },
    Archive {
        wl_app_id: Uuid,
        operation_id: Uuid,
    },
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::Build { .. } => "build",
            Job::Deploy { .. } => "deploy",
            Job::Command { .. } => "command",
            Job::Archive { .. } => "archive",
        }
    }
}

/// A job as it travels through the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: Uuid,
    pub version: u32,
    pub job: Job,
}

impl JobEnvelope {
    pub fn new(job: Job) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: JOB_VERSION,
            job,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutcomeStatus {
    Normal,
    Exception,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub status: OutcomeStatus,
    pub data: Value,
}

impl JobOutcome {
    fn from_result<T: Serialize>(result: EngineResult<T>) -> Self {
        match result {
            Ok(record) => JobOutcome {
                status: OutcomeStatus::Normal,
                data: serde_json::to_value(record).unwrap_or(Value::Null),
            },
            Err(e) => JobOutcome {
                status: OutcomeStatus::Exception,
                data: json!({ "code": e.code(), "detail": e.to_string() }),
            },
        }
    }
}

// ============================================================================
// SBIO: I/O boundary
// ============================================================================

/// Runs one job to completion
pub struct JobExecutor {
    pipeline: Arc<Pipeline>,
    archiver: Arc<Archiver>,
    outcomes: DashMap<Uuid, JobOutcome>,
}

impl JobExecutor {
    pub fn new(pipeline: Arc<Pipeline>, archiver: Arc<Archiver>) -> Self {
        Self {
            pipeline,
            archiver,
            outcomes: DashMap::new(),
        }
    }

    /// Outcome of a finished envelope
    pub fn outcome(&self, envelope_id: Uuid) -> Option<JobOutcome> {
        self.outcomes.get(&envelope_id).map(|o| o.clone())
    }

    #[tracing::instrument(skip(self, envelope), fields(job = envelope.job.name(), id = %envelope.id))]
    pub async fn execute(&self, envelope: &JobEnvelope) -> JobOutcome {
        let outcome = if envelope.version > JOB_VERSION {
            JobOutcome {
                status: OutcomeStatus::Exception,
                data: json!({
                    "code": "UNSUPPORTED_JOB_VERSION",
                    "detail": format!("job version {} is newer than {}", envelope.version, JOB_VERSION),
                }),
            }
        } else {
            self.dispatch(&envelope.job).await
        };

        match outcome.status {
            OutcomeStatus::Normal => tracing::info!("job finished"),
            OutcomeStatus::Exception => tracing::warn!(data = %outcome.data, "job raised"),
        }
        self.outcomes.insert(envelope.id, outcome.clone());
        outcome
    }

    async fn dispatch(&self, job: &Job) -> JobOutcome {
        match job {
            Job::Build { build_process_id } => {
                let cancel = CancellationToken::new();
                JobOutcome::from_result(self.pipeline.run_build(*build_process_id, &cancel).await)
            }
            Job::Deploy {
                deployment_id,
                extra_envs,
            } => JobOutcome::from_result(
                self.pipeline
                    .run_deployment(*deployment_id, extra_envs)
                    .await,
            ),
            Job::Command {
                command_id,
                stream_channel_id,
                extra_envs,
            } => {
                let cancel = CancellationToken::new();
                let extras = extra_envs.clone().unwrap_or_default();
                JobOutcome::from_result(
                    self.pipeline
                        .run_command(*command_id, *stream_channel_id, &extras, &cancel)
                        .await,
                )
            }
            Job::Archive {
                wl_app_id,
                operation_id,
            } => JobOutcome::from_result(self.archiver.run(*wl_app_id, *operation_id).await),
        }
    }
}

/// Handle for submitting jobs to the pool
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<JobEnvelope>,
}

impl TaskQueue {
    pub async fn submit(&self, job: Job) -> Result<Uuid, TaskError> {
        let envelope = JobEnvelope::new(job);
        let id = envelope.id;
        tracing::debug!(job = envelope.job.name(), id = %id, "job submitted");
        self.tx
            .send(envelope)
            .await
            .map_err(|_| TaskError::QueueClosed)?;
        Ok(id)
    }
}

/// Fixed set of workers draining one queue
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn start(executor: Arc<JobExecutor>, workers: usize) -> (TaskQueue, WorkerPool) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let rx = Arc::new(Mutex::new(rx));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let handles = (0..workers.max(1))
            .map(|index| {
                let rx = rx.clone();
                let executor = executor.clone();
                let mut shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    loop {
                        let next = tokio::select! {
                            envelope = async { rx.lock().await.recv().await } => envelope,
                            _ = shutdown_rx.changed() => None,
                        };
                        let Some(envelope) = next else {
                            tracing::debug!(worker = index, "worker stopping");
                            break;
                        };
                        executor.execute(&envelope).await;
                    }
                })
            })
            .collect();

        tracing::info!(workers = workers.max(1), "worker pool started");
        (TaskQueue { tx }, WorkerPool { handles, shutdown })
    }

    /// Stop taking jobs and wait for running ones
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ingress::{IngressSynchronizer, PluginChain};
    use crate::models::JobStatus;
    use crate::pipeline::testing::pipeline;
    use crate::pipeline::DeployRequest;
    use crate::test_support::TestEnv;

    fn executor(env: &TestEnv) -> (Arc<JobExecutor>, Arc<Pipeline>) {
        let pipeline = Arc::new(pipeline(env));
        let archiver = Arc::new(Archiver::new(
            env.store.clone(),
            Arc::new(env.scheduler()),
            Arc::new(IngressSynchronizer::new(
                env.store.clone(),
                env.directory.clone(),
                env.cipher.clone(),
                PluginChain::default(),
            )),
        ));
        (Arc::new(JobExecutor::new(pipeline.clone(), archiver)), pipeline)
    }

    #[test]
    fn test_job_payload_layout() {
        let id = Uuid::new_v4();
        let job: Job = serde_json::from_value(json!({
            "type": "command",
            "command_id": id,
        }))
        .unwrap();
        assert_eq!(
            job,
            Job::Command {
                command_id: id,
                stream_channel_id: None,
                extra_envs: None
            }
        );

        let outcome = JobOutcome {
            status: OutcomeStatus::Exception,
            data: Value::Null,
        };
        assert_eq!(serde_json::to_value(&outcome).unwrap()["status"], "EXCEPTION");
    }

    #[tokio::test]
    async fn test_newer_job_version_is_rejected() {
        let env = TestEnv::new();
        let (executor, _) = executor(&env);
        let mut envelope = JobEnvelope::new(Job::Build {
            build_process_id: Uuid::new_v4(),
        });
        envelope.version = JOB_VERSION + 1;
        let outcome = executor.execute(&envelope).await;
        assert_eq!(outcome.status, OutcomeStatus::Exception);
        assert_eq!(outcome.data["code"], "UNSUPPORTED_JOB_VERSION");
    }

    #[tokio::test]
    async fn test_missing_records_raise() {
        let env = TestEnv::new();
        let (executor, _) = executor(&env);
        let outcome = executor
            .execute(&JobEnvelope::new(Job::Deploy {
                deployment_id: Uuid::new_v4(),
                extra_envs: BTreeMap::new(),
            }))
            .await;
        assert_eq!(outcome.status, OutcomeStatus::Exception);
        assert_eq!(outcome.data["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_pool_runs_submitted_deploy() {
        let env = TestEnv::new();
        let (executor, pipeline) = executor(&env);
        let deployment = pipeline
            .create_deployment(
                env.module_env.id,
                DeployRequest {
                    source_package: Some("https://pkgs.example.com/foo.tgz".into()),
                    procfile: BTreeMap::from([("web".to_string(), "gunicorn".to_string())]).into(),
                    operator: "tester".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let (queue, pool) = WorkerPool::start(executor.clone(), 2);
        let id = queue
            .submit(Job::Deploy {
                deployment_id: deployment.id,
                extra_envs: BTreeMap::new(),
            })
            .await
            .unwrap();

        let mut outcome = None;
        for _ in 0..500 {
            outcome = executor.outcome(id);
            if outcome.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown().await;

        let outcome = outcome.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Normal);
        assert_eq!(outcome.data["status"], "successful");
        assert_eq!(
            env.store.deployments.get(&deployment.id).unwrap().status,
            JobStatus::Successful
        );
    }
}
