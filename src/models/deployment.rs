use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::build::JobStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Preparation,
    Build,
    PreRelease,
    Release,
}

impl PhaseKind {
    pub const ORDER: [PhaseKind; 4] = [
        PhaseKind::Preparation,
        PhaseKind::Build,
        PhaseKind::PreRelease,
        PhaseKind::Release,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::Preparation => "preparation",
            PhaseKind::Build => "build",
            PhaseKind::PreRelease => "pre_release",
            PhaseKind::Release => "release",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Pending,
    Running,
    Successful,
    Failed,
    Skipped,
    Interrupted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployPhase {
    pub kind: PhaseKind,
    pub status: PhaseStatus,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished: Option<DateTime<Utc>>,
}

/// User-visible description of a failed deployment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployFailure {
    pub phase: PhaseKind,
    /// Symbolic error code
    pub kind: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs_tail: Vec<String>,
}

/// One run of the release pipeline for a module environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub module_env_id: Uuid,
    pub wl_app_id: Uuid,
    pub status: JobStatus,
    pub phases: Vec<DeployPhase>,
    pub stream_channel_id: Uuid,
    /// Source package to build from; ignored when the module skips builds
    #[serde(default)]
    pub source_package: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub procfile: BTreeMap<String, String>,
    /// Image for modules that skip the build phase
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub build_process_id: Option<Uuid>,
    #[serde(default)]
    pub build_id: Option<Uuid>,
    #[serde(default)]
    pub hook_command_id: Option<Uuid>,
    #[serde(default)]
    pub release_id: Option<Uuid>,
    #[serde(default)]
    pub release_version: Option<u32>,
    #[serde(default)]
    pub failure: Option<DeployFailure>,
    #[serde(default)]
    pub interrupt_requested: bool,
    #[serde(default)]
    pub interrupted_reason: Option<String>,
    #[serde(default)]
    pub extra_envs: BTreeMap<String, String>,
    /// Hosts the env is reachable on after a successful release
    #[serde(default)]
    pub accessible_urls: Vec<String>,
    pub operator: String,
    pub tenant_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Deployment {
    pub fn new(module_env_id: Uuid, wl_app_id: Uuid, operator: &str, tenant_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            module_env_id,
            wl_app_id,
            status: JobStatus::Pending,
            phases: PhaseKind::ORDER
                .iter()
                .map(|kind| DeployPhase {
                    kind: *kind,
                    status: PhaseStatus::Pending,
                    started: None,
                    finished: None,
                })
                .collect(),
            stream_channel_id: Uuid::new_v4(),
            source_package: None,
            branch: None,
            revision: None,
            procfile: BTreeMap::new(),
            image: None,
            build_process_id: None,
            build_id: None,
            hook_command_id: None,
            release_id: None,
            release_version: None,
            failure: None,
            interrupt_requested: false,
            interrupted_reason: None,
            extra_envs: BTreeMap::new(),
            accessible_urls: Vec::new(),
            operator: operator.to_string(),
            tenant_id: tenant_id.to_string(),
            created: now,
            updated: now,
        }
    }

    pub fn phase(&self, kind: PhaseKind) -> Option<&DeployPhase> {
        self.phases.iter().find(|p| p.kind == kind)
    }

    /// Record a phase transition, stamping start and finish times
    pub fn mark_phase(&mut self, kind: PhaseKind, status: PhaseStatus) {
        let now = Utc::now();
        if let Some(phase) = self.phases.iter_mut().find(|p| p.kind == kind) {
            match status {
                PhaseStatus::Running => phase.started = Some(now),
                PhaseStatus::Pending => {}
                _ => {
                    phase.started.get_or_insert(now);
                    phase.finished = Some(now);
                }
            }
            phase.status = status;
        }
    }

    pub fn is_in_progress(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Archive (offline) request for one WlApp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveOperation {
    pub id: Uuid,
    pub wl_app_id: Uuid,
    pub status: JobStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub operator: String,
    pub tenant_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Persisted log line of an output stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputLine {
    pub stream: String,
    pub line: String,
    pub created: DateTime<Utc>,
}

/// Log lines kept for a build or command after its channel expires
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputStream {
    /// Same id as the stream channel
    pub id: Uuid,
    pub lines: Vec<OutputLine>,
    pub tenant_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl OutputStream {
    pub fn tail(&self, n: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).map(|l| l.line.clone()).collect()
    }
}
