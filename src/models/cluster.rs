use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::EncryptedString;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterType {
    #[default]
    Normal,
    Virtual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExposedUrlType {
    #[default]
    Subdomain,
    Subpath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterFeatureFlag {
    EnableEgressIp,
    EnableMountLogToHost,
    EnableBkLogCollector,
    EnableAutoscaling,
    IngressUseRegex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainConfig {
    pub name: String,
    #[serde(default)]
    pub https_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressConfig {
    /// Root domains for `SUBDOMAIN` hosts
    #[serde(default)]
    pub app_root_domains: Vec<DomainConfig>,
    /// Hosts serving `SUBPATH` paths
    #[serde(default)]
    pub sub_path_domains: Vec<DomainConfig>,
    #[serde(default)]
    pub frontend_ingress_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Host directory mounted into workloads when log mounting is enabled
    #[serde(default = "default_log_host_dir")]
    pub host_dir: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            host_dir: default_log_host_dir(),
        }
    }
}

fn default_log_host_dir() -> String {
    "/data/bkapp/v3logs".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterAuth {
    #[serde(default)]
    pub token: Option<EncryptedString>,
    /// PEM CA bundle
    #[serde(default)]
    pub ca_data: Option<String>,
    /// PEM client certificate
    #[serde(default)]
    pub cert_data: Option<String>,
    /// PEM client key
    #[serde(default)]
    pub key_data: Option<EncryptedString>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiServer {
    pub url: String,
    /// Overrides the cluster-level `assert_hostname` for this endpoint
    #[serde(default)]
    pub overridden_hostname: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub region: String,
    #[serde(default, rename = "type")]
    pub cluster_type: ClusterType,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub exposed_url_type: ExposedUrlType,
    /// Hostname expected in the api server certificate
    #[serde(default)]
    pub assert_hostname: Option<String>,
    #[serde(default)]
    pub ingress_config: IngressConfig,
    #[serde(default)]
    pub feature_flags: BTreeMap<ClusterFeatureFlag, bool>,
    #[serde(default)]
    pub log_config: LogConfig,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub api_servers: Vec<ApiServer>,
    #[serde(default)]
    pub auth: ClusterAuth,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated: DateTime<Utc>,
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_read_timeout() -> u64 {
    30
}

fn default_tenant() -> String {
    "default".to_string()
}

impl Cluster {
    /// Missing flags read as disabled
    pub fn has_feature(&self, flag: ClusterFeatureFlag) -> bool {
        self.feature_flags.get(&flag).copied().unwrap_or(false)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_defaults_from_yaml() {
        let cluster: Cluster = serde_yaml::from_str(
            "name: c1\nregion: default\napi_servers:\n  - url: https://10.0.0.1:6443\n",
        )
        .unwrap();
        assert_eq!(cluster.exposed_url_type, ExposedUrlType::Subdomain);
        assert_eq!(cluster.connect_timeout_secs, 5);
        assert!(!cluster.is_default);
        assert!(!cluster.has_feature(ClusterFeatureFlag::EnableAutoscaling));
    }

    #[test]
    fn test_feature_flags_parse() {
        let cluster: Cluster = serde_yaml::from_str(
            "name: c1\nregion: default\nfeature_flags:\n  ENABLE_AUTOSCALING: true\n  INGRESS_USE_REGEX: false\n",
        )
        .unwrap();
        assert!(cluster.has_feature(ClusterFeatureFlag::EnableAutoscaling));
        assert!(!cluster.has_feature(ClusterFeatureFlag::IngressUseRegex));
        assert!(!cluster.has_feature(ClusterFeatureFlag::EnableMountLogToHost));
    }
}
