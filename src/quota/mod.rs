//! Repository storage quota extension
//!
//! Builds push into repositories with a storage quota. Operators grow a
//! quota through [`extend_quota`], which refuses when growth is pointless,
//! premature or beyond the allowed ceiling.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::settings::QuotaSettings;

#[derive(Error, Debug)]
pub enum QuotaError {
    #[error("quota of repository '{0}' is unbounded, no need to extend it")]
    NoNeedToExtendQuota(String),

    #[error("repository '{repo}' uses {usage_rate:.2} of its quota, extending requires at least {required:.2}")]
    ExtendQuotaUsageTooLow {
        repo: String,
        usage_rate: f64,
        required: f64,
    },

    #[error("repository '{repo}' would grow to {requested} bytes, above the allowed {max_allowed} bytes")]
    ExtendQuotaMaxSizeExceeded {
        repo: String,
        requested: u64,
        max_allowed: u64,
    },

    #[error("repository '{0}' not found")]
    RepositoryNotFound(String),

    #[error("quota backend error: {0}")]
    Backend(String),
}

// ============================================================================
// Data structures (pure, no I/O)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryQuota {
    pub repo: String,
    /// Bytes in use
    pub used: u64,
    /// Quota in bytes, `None` when unbounded
    pub max_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtendRequest {
    pub repo: String,
    pub extra_bytes: u64,
    pub max_allowed_bytes: u64,
    #[serde(default)]
    pub required_usage_rate: Option<f64>,
}

/// New quota for `current` grown by `extra`, or why it must not grow
pub fn plan_extension(
    current: &RepositoryQuota,
    extra: u64,
    max_allowed: u64,
    required_usage_rate: Option<f64>,
) -> Result<u64, QuotaError> {
    let Some(max_size) = current.max_size else {
        return Err(QuotaError::NoNeedToExtendQuota(current.repo.clone()));
    };
    if let Some(required) = required_usage_rate {
        let usage_rate = if max_size == 0 {
            1.0
        } else {
            current.used as f64 / max_size as f64
        };
        if usage_rate < required {
            return Err(QuotaError::ExtendQuotaUsageTooLow {
                repo: current.repo.clone(),
                usage_rate,
                required,
            });
        }
    }
    let requested = max_size.saturating_add(extra);
    if requested > max_allowed {
        return Err(QuotaError::ExtendQuotaMaxSizeExceeded {
            repo: current.repo.clone(),
            requested,
            max_allowed,
        });
    }
    Ok(requested)
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait QuotaBackend: Send + Sync {
    async fn get(&self, repo: &str) -> Result<RepositoryQuota, QuotaError>;

    async fn set_max_size(&self, repo: &str, max_size: u64) -> Result<RepositoryQuota, QuotaError>;
}

pub async fn extend_quota(
    backend: &dyn QuotaBackend,
    repo: &str,
    extra: u64,
    max_allowed: u64,
    required_usage_rate: Option<f64>,
) -> Result<RepositoryQuota, QuotaError> {
    let current = backend.get(repo).await?;
    let target = plan_extension(&current, extra, max_allowed, required_usage_rate)?;
    let updated = backend.set_max_size(repo, target).await?;
    tracing::info!(repo, from = ?current.max_size, to = target, "extended repository quota");
    Ok(updated)
}

pub fn backend_from_settings(settings: &QuotaSettings) -> Arc<dyn QuotaBackend> {
    match &settings.backend_url {
        Some(url) => Arc::new(HttpQuotaBackend::new(url.clone(), settings.token.clone())),
        None => Arc::new(MemoryQuotaBackend::default()),
    }
}

// ============================================================================
// SBIO: I/O implementation (repository service over HTTP)
// ============================================================================

#[derive(Clone)]
pub struct HttpQuotaBackend {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Serialize)]
struct QuotaUpdate {
    max_size: u64,
}

impl HttpQuotaBackend {
    pub fn new(base_url: String, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            token,
        }
    }

    fn url(&self, repo: &str) -> String {
        format!(
            "{}/repositories/{}/quota",
            self.base_url.trim_end_matches('/'),
            repo
        )
    }

    async fn decode(repo: &str, response: reqwest::Response) -> Result<RepositoryQuota, QuotaError> {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(QuotaError::RepositoryNotFound(repo.to_string()));
        }
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(QuotaError::Backend(format!("{} - {}", status.as_u16(), text)));
        }
        response
            .json()
            .await
            .map_err(|e| QuotaError::Backend(e.to_string()))
    }
}

#[async_trait]
impl QuotaBackend for HttpQuotaBackend {
    async fn get(&self, repo: &str) -> Result<RepositoryQuota, QuotaError> {
        let mut req = self.client.get(self.url(repo));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let response = req.send().await.map_err(|e| QuotaError::Backend(e.to_string()))?;
        Self::decode(repo, response).await
    }

    async fn set_max_size(&self, repo: &str, max_size: u64) -> Result<RepositoryQuota, QuotaError> {
        let mut req = self.client.put(self.url(repo)).json(&QuotaUpdate { max_size });
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let response = req.send().await.map_err(|e| QuotaError::Backend(e.to_string()))?;
        Self::decode(repo, response).await
    }
}

// ============================================================================
// SBIO: In-process implementation (local runs and tests)
// ============================================================================

#[derive(Default)]
pub struct MemoryQuotaBackend {
    repos: DashMap<String, RepositoryQuota>,
}

impl MemoryQuotaBackend {
    pub fn with_repo(self, repo: &str, used: u64, max_size: Option<u64>) -> Self {
        self.repos.insert(
            repo.to_string(),
            RepositoryQuota {
                repo: repo.to_string(),
                used,
                max_size,
            },
        );
        self
    }
}

#[async_trait]
impl QuotaBackend for MemoryQuotaBackend {
    async fn get(&self, repo: &str) -> Result<RepositoryQuota, QuotaError> {
        self.repos
            .get(repo)
            .map(|r| r.clone())
            .ok_or_else(|| QuotaError::RepositoryNotFound(repo.to_string()))
    }

    async fn set_max_size(&self, repo: &str, max_size: u64) -> Result<RepositoryQuota, QuotaError> {
        let mut entry = self
            .repos
            .get_mut(repo)
            .ok_or_else(|| QuotaError::RepositoryNotFound(repo.to_string()))?;
        entry.max_size = Some(max_size);
        Ok(entry.clone())
    }
}
