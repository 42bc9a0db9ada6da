//! Engine settings
//!
//! Settings are read from a YAML file. Paths may use `~`; the CLI layers
//! environment overrides on top (see `cli::ServeArgs`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{CipherAlgorithm, CipherError, CipherManager};

pub const DEFAULT_PORT: u16 = 8600;
pub const DEFAULT_ENV_PREFIX: &str = "BKPAAS_";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse settings: {0}")]
    ParseError(String),

    #[error("Invalid settings: {0}")]
    Invalid(String),

    #[error("Cipher setup failed: {0}")]
    Cipher(#[from] CipherError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bind_addr: String,
    pub port: u16,
    /// Prefix for platform-injected env vars
    pub env_var_prefix: String,
    /// Redis URL for stream channels; in-memory channels when absent
    pub redis_url: Option<String>,
    /// Path of the cluster directory file
    pub clusters_file: Option<String>,
    /// Number of background task workers
    pub workers: usize,
    pub auth: AuthSettings,
    pub release: ReleaseSettings,
    pub build: BuildSettings,
    pub crypto: CryptoSettings,
    pub ingress: IngressSettings,
    pub stream: StreamSettings,
    pub quota: QuotaSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            env_var_prefix: DEFAULT_ENV_PREFIX.to_string(),
            redis_url: None,
            clusters_file: None,
            workers: 4,
            auth: AuthSettings::default(),
            release: ReleaseSettings::default(),
            build: BuildSettings::default(),
            crypto: CryptoSettings::default(),
            ingress: IngressSettings::default(),
            stream: StreamSettings::default(),
            quota: QuotaSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthSettings {
    /// HMAC secret for internal-service JWTs
    pub jwt_secret: String,
    /// Static end-user tokens: token -> username
    pub user_tokens: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseSettings {
    pub wait_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Attempts for transient apply failures
    pub apply_retries: u32,
}

impl Default for ReleaseSettings {
    fn default() -> Self {
        Self {
            wait_timeout_secs: 1800,
            poll_interval_ms: 2000,
            apply_retries: 3,
        }
    }
}

impl ReleaseSettings {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    pub builder_image: String,
    pub max_builds_per_cluster: usize,
    pub builder_pod_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Registry prefix for built images when a module names no repository
    pub image_registry: String,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            builder_image: "bkpaas/slugbuilder:latest".to_string(),
            max_builds_per_cluster: 4,
            builder_pod_timeout_secs: 3600,
            sweep_interval_secs: 300,
            image_registry: "hub.bkpaas.local/bkapps".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoSettings {
    pub secret: String,
    pub algorithm: CipherAlgorithm,
}

impl Default for CryptoSettings {
    fn default() -> Self {
        Self {
            secret: String::new(),
            algorithm: CipherAlgorithm::BkCrypt,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressSettings {
    pub enable_access_control: bool,
    pub enable_paas_analysis: bool,
    /// Upstream for the access control `auth_request`
    pub access_control_url: String,
}

impl Default for IngressSettings {
    fn default() -> Self {
        Self {
            enable_access_control: false,
            enable_paas_analysis: false,
            access_control_url: "http://bkpaas-access-control/check".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Seconds a finished channel is kept before expiry
    pub ttl_secs: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self { ttl_secs: 3600 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct QuotaSettings {
    /// Base URL of the repository quota service; in-memory backend when absent
    pub backend_url: Option<String>,
    pub token: Option<String>,
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

pub fn parse_settings(content: &str) -> Result<Settings, SettingsError> {
    serde_yaml::from_str(content).map_err(|e| SettingsError::ParseError(e.to_string()))
}

/// Check cross-field constraints that serde cannot express
pub fn validate_settings(settings: &Settings) -> Result<(), SettingsError> {
    if settings.crypto.secret.is_empty() {
        return Err(SettingsError::Invalid("crypto.secret must be set".into()));
    }
    if settings.auth.jwt_secret.is_empty() && settings.auth.user_tokens.is_empty() {
        return Err(SettingsError::Invalid(
            "auth needs a jwt_secret or at least one user token".into(),
        ));
    }
    if settings.workers == 0 {
        return Err(SettingsError::Invalid("workers must be at least 1".into()));
    }
    if settings.build.max_builds_per_cluster == 0 {
        return Err(SettingsError::Invalid(
            "build.max_builds_per_cluster must be at least 1".into(),
        ));
    }
    if settings.release.poll_interval_ms == 0 {
        return Err(SettingsError::Invalid(
            "release.poll_interval_ms must be positive".into(),
        ));
    }
    Ok(())
}

/// Expand `~` and environment references in a configured path
pub fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(raw),
    }
}

impl Settings {
    pub fn cipher(&self) -> Result<CipherManager, SettingsError> {
        Ok(CipherManager::new(
            &self.crypto.secret,
            self.crypto.algorithm,
        )?)
    }

    pub fn clusters_path(&self) -> Option<PathBuf> {
        self.clusters_file.as_deref().map(expand_path)
    }
}

// ============================================================================
// SBIO: I/O wrapper
// ============================================================================

pub fn load_settings(path: &Path) -> Result<Settings, SettingsError> {
    let content = std::fs::read_to_string(path)?;
    parse_settings(&content)
}
