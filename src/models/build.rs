use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status shared by build processes, commands and deployments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Scheduled,
    Pending,
    Successful,
    Failed,
    Interrupted,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Successful | JobStatus::Failed | JobStatus::Interrupted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Pending => "pending",
            JobStatus::Successful => "successful",
            JobStatus::Failed => "failed",
            JobStatus::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactType {
    /// Synthetic build pointing at a user-supplied image
    None,
    Slug,
    Image,
}

/// Immutable record of a produced artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: Uuid,
    pub wl_app_id: Uuid,
    #[serde(default)]
    pub build_process_id: Option<Uuid>,
    pub artifact_type: ArtifactType,
    pub image: String,
    #[serde(default)]
    pub env_variables: BTreeMap<String, String>,
    /// Process type -> command string
    #[serde(default)]
    pub procfile: BTreeMap<String, String>,
    pub owner: String,
    pub tenant_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Build {
    /// A build that reuses an existing image without running the builder
    pub fn synthetic(
        wl_app_id: Uuid,
        image: &str,
        procfile: BTreeMap<String, String>,
        owner: &str,
        tenant_id: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            wl_app_id,
            build_process_id: None,
            artifact_type: ArtifactType::None,
            image: image.to_string(),
            env_variables: BTreeMap::new(),
            procfile,
            owner: owner.to_string(),
            tenant_id: tenant_id.to_string(),
            created: now,
            updated: now,
        }
    }
}

/// One build attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildProcess {
    pub id: Uuid,
    pub wl_app_id: Uuid,
    /// Monotonic per WlApp
    pub generation: u32,
    pub status: JobStatus,
    pub builder_image: String,
    /// Location of the source package the builder fetches
    pub source_package: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    /// Processes declared by the source
    #[serde(default)]
    pub procfile: BTreeMap<String, String>,
    pub stream_channel_id: Uuid,
    #[serde(default)]
    pub build_id: Option<Uuid>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub logs_tail: Vec<String>,
    pub owner: String,
    pub tenant_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    PreReleaseHook,
    Exec,
}

/// On-demand execution such as the pre-release hook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub wl_app_id: Uuid,
    pub kind: CommandKind,
    pub status: JobStatus,
    /// Split command line
    pub argv: Vec<String>,
    pub build_id: Uuid,
    #[serde(default)]
    pub config_id: Option<Uuid>,
    #[serde(default)]
    pub stream_channel_id: Option<Uuid>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub logs: String,
    pub operator: String,
    pub tenant_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Command {
    /// Split a command line with shell-like whitespace rules
    pub fn split_command(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Successful.is_terminal());
        assert!(JobStatus::Interrupted.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Scheduled.is_terminal());
    }

    #[test]
    fn test_synthetic_build_has_no_artifact() {
        let build = Build::synthetic(
            Uuid::new_v4(),
            "registry/example/foo:1",
            BTreeMap::new(),
            "admin",
            "default",
        );
        assert_eq!(build.artifact_type, ArtifactType::None);
        assert!(build.build_process_id.is_none());
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Successful).unwrap(),
            "\"successful\""
        );
    }
}
