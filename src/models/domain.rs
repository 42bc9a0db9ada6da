use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::EncryptedString;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DomainSource {
    BuiltIn,
    Custom,
    Independent,
}

/// A host + path an env is reachable on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppDomain {
    pub id: Uuid,
    pub wl_app_id: Uuid,
    pub host: String,
    pub path_prefix: String,
    pub source: DomainSource,
    #[serde(default)]
    pub https_enabled: bool,
    pub tenant_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Cluster-scoped path prefix of an env
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSubpath {
    pub id: Uuid,
    pub wl_app_id: Uuid,
    pub cluster_name: String,
    pub subpath: String,
    pub source: DomainSource,
    pub tenant_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// User-registered hostname bound to a module environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub id: Uuid,
    pub name: String,
    /// `/` or `/<segment>/`
    pub path_prefix: String,
    pub module_env_id: Uuid,
    pub wl_app_id: Uuid,
    #[serde(default)]
    pub https_enabled: bool,
    pub tenant_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Domain {
    pub fn normalize_path_prefix(raw: &str) -> String {
        let trimmed = raw.trim_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{}/", trimmed)
        }
    }
}

/// TLS material any matching host may use
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppDomainSharedCert {
    pub name: String,
    pub cert_data: String,
    pub key_data: EncryptedString,
    #[serde(default)]
    pub ca_data: Option<String>,
    /// Host patterns, `*.` prefix for wildcards
    pub auto_match_cns: Vec<String>,
    pub tenant_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl AppDomainSharedCert {
    /// Length of the longest CN pattern matching `host`
    pub fn match_len(&self, host: &str) -> Option<usize> {
        self.auto_match_cns
            .iter()
            .filter(|cn| cn_matches(cn, host))
            .map(|cn| cn.len())
            .max()
    }

    /// Secret name the cert is materialized under in workload namespaces
    pub fn secret_name(&self) -> String {
        format!("eng-shared-{}", self.name)
    }
}

fn cn_matches(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(suffix) => host
            .strip_suffix(suffix)
            .and_then(|rest| rest.strip_suffix('.'))
            .map(|label| !label.is_empty() && !label.contains('.'))
            .unwrap_or(false),
        None => pattern == host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherAlgorithm, CipherManager};

    fn cert(name: &str, cns: &[&str]) -> AppDomainSharedCert {
        let cipher = CipherManager::new("k", CipherAlgorithm::BkCrypt).unwrap();
        AppDomainSharedCert {
            name: name.into(),
            cert_data: "CERT".into(),
            key_data: EncryptedString::seal(&cipher, "KEY").unwrap(),
            ca_data: None,
            auto_match_cns: cns.iter().map(|s| s.to_string()).collect(),
            tenant_id: "default".into(),
            created: Utc::now(),
            updated: Utc::now(),
        }
    }

    #[test]
    fn test_wildcard_matches_one_label() {
        let c = cert("cert-a", &["*.example.com"]);
        assert!(c.match_len("api.example.com").is_some());
        assert!(c.match_len("a.b.example.com").is_none());
        assert!(c.match_len("example.com").is_none());
    }

    #[test]
    fn test_exact_cn() {
        let c = cert("cert-b", &["www.example.com"]);
        assert_eq!(c.match_len("www.example.com"), Some(15));
        assert!(c.match_len("api.example.com").is_none());
    }

    #[test]
    fn test_normalize_path_prefix() {
        assert_eq!(Domain::normalize_path_prefix(""), "/");
        assert_eq!(Domain::normalize_path_prefix("/"), "/");
        assert_eq!(Domain::normalize_path_prefix("foo"), "/foo/");
        assert_eq!(Domain::normalize_path_prefix("/foo/"), "/foo/");
    }
}
