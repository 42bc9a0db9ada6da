//! Engine-wide error type
//!
//! Every component has its own `thiserror` enum; they all funnel into
//! [`EngineError`], which knows the symbolic code, HTTP status and whether a
//! caller may retry.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::cluster::client::KubeError;
use crate::cluster::pool::PoolError;
use crate::crypto::CipherError;
use crate::quota::QuotaError;
use crate::store::StoreError;
use crate::stream::StreamError;
use crate::tasks::TaskError;

/// Errors surfaced by engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{message}")]
    Validation {
        message: String,
        fields: BTreeMap<String, Vec<String>>,
    },

    #[error("unauthorized")]
    Unauthorized,

    #[error("permission denied: {0}")]
    Forbidden(String),

    #[error("{message}")]
    Conflict { code: &'static str, message: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("cluster unavailable: {0}")]
    ClusterUnavailable(String),

    #[error("cluster rejected request: {0}")]
    DownstreamFatal(String),

    #[error("image credential '{0}' is not declared by the application")]
    MissingImageCredential(String),

    #[error("build failed: {0}")]
    BuildFailed(String),

    #[error("pre-release hook failed: {0}")]
    HookFailed(String),

    #[error("{0}")]
    ReleaseNotReady(String),

    #[error("interrupted: {0}")]
    Interrupted(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation {
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        let mut fields = BTreeMap::new();
        fields.insert(field.into(), vec![message.clone()]);
        EngineError::Validation { message, fields }
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        EngineError::Conflict {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        EngineError::NotFound(what.into())
    }

    /// Symbolic code used in the HTTP error envelope
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation { .. } => "VALIDATION_ERROR",
            EngineError::Unauthorized => "UNAUTHORIZED",
            EngineError::Forbidden(_) => "PERMISSION_DENIED",
            EngineError::Conflict { code, .. } => code,
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::ClusterNotFound(_) => "CLUSTER_NOT_FOUND",
            EngineError::ClusterUnavailable(_) => "CLUSTER_UNAVAILABLE",
            EngineError::DownstreamFatal(_) => "CLUSTER_REJECTED",
            EngineError::MissingImageCredential(_) => "MISSING_IMAGE_CREDENTIAL",
            EngineError::BuildFailed(_) => "BUILD_FAILED",
            EngineError::HookFailed(_) => "HOOK_FAILED",
            EngineError::ReleaseNotReady(_) => "RELEASE_NOT_READY",
            EngineError::Interrupted(_) => "INTERRUPTED",
            EngineError::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            EngineError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status for the error envelope
    pub fn status(&self) -> u16 {
        match self {
            EngineError::Validation { .. }
            | EngineError::MissingImageCredential(_)
            | EngineError::QuotaExceeded(_) => 400,
            EngineError::Unauthorized => 401,
            EngineError::Forbidden(_) => 403,
            EngineError::NotFound(_) | EngineError::ClusterNotFound(_) => 404,
            EngineError::Conflict { .. } | EngineError::Interrupted(_) => 409,
            EngineError::DownstreamFatal(_) => 502,
            EngineError::ClusterUnavailable(_) => 503,
            EngineError::BuildFailed(_)
            | EngineError::HookFailed(_)
            | EngineError::ReleaseNotReady(_)
            | EngineError::Internal(_) => 500,
        }
    }

    /// Conflicts may succeed after a re-read; transient cluster failures are
    /// already retried internally before they surface.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Conflict { .. } | EngineError::ClusterUnavailable(_)
        )
    }

    /// Per-field details for validation errors
    pub fn fields_detail(&self) -> Option<&BTreeMap<String, Vec<String>>> {
        match self {
            EngineError::Validation { fields, .. } if !fields.is_empty() => Some(fields),
            _ => None,
        }
    }
}

impl From<KubeError> for EngineError {
    fn from(err: KubeError) -> Self {
        match err {
            KubeError::NotFound(what) => EngineError::NotFound(what),
            KubeError::Conflict(msg) | KubeError::AlreadyExists(msg) => {
                EngineError::conflict("RESOURCE_CONFLICT", msg)
            }
            KubeError::Invalid(msg) => EngineError::validation(msg),
            KubeError::Transient(msg) => EngineError::ClusterUnavailable(msg),
            KubeError::Pool(PoolError::AllEndpointsDown(name)) => {
                EngineError::ClusterUnavailable(format!("all api servers of '{}' are down", name))
            }
            KubeError::Pool(e) => EngineError::ClusterUnavailable(e.to_string()),
            KubeError::NamespaceMissing(ns) => {
                EngineError::DownstreamFatal(format!("namespace '{}' missing", ns))
            }
            KubeError::Rejected { message, .. } => EngineError::DownstreamFatal(message),
            KubeError::Decode(msg) | KubeError::Unknown(msg) => EngineError::Internal(msg),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => EngineError::NotFound(what),
            StoreError::Duplicate(what) => {
                EngineError::conflict("DUPLICATE", format!("{} already exists", what))
            }
            StoreError::Invariant(msg) => EngineError::validation(msg),
        }
    }
}

impl From<CipherError> for EngineError {
    fn from(err: CipherError) -> Self {
        EngineError::Internal(err.to_string())
    }
}

impl From<StreamError> for EngineError {
    fn from(err: StreamError) -> Self {
        EngineError::Internal(err.to_string())
    }
}

impl From<TaskError> for EngineError {
    fn from(err: TaskError) -> Self {
        EngineError::Internal(err.to_string())
    }
}

impl From<QuotaError> for EngineError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::NoNeedToExtendQuota(_)
            | QuotaError::ExtendQuotaUsageTooLow { .. }
            | QuotaError::ExtendQuotaMaxSizeExceeded { .. } => {
                EngineError::QuotaExceeded(err.to_string())
            }
            QuotaError::RepositoryNotFound(repo) => EngineError::NotFound(repo),
            QuotaError::Backend(msg) => EngineError::ClusterUnavailable(msg),
        }
    }
}
