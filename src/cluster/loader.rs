//! Cluster directory file
//!
//! ```yaml
//! clusters:
//!   - name: main
//!     region: default
//!     is_default: true
//!     api_servers:
//!       - url: https://10.0.0.1:6443
//!     auth:
//!       token: bkcrypt$...
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::models::Cluster;
use crate::settings::SettingsError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterFile {
    #[serde(default)]
    pub clusters: Vec<Cluster>,
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

pub fn parse_clusters(content: &str) -> Result<Vec<Cluster>, SettingsError> {
    let file: ClusterFile =
        serde_yaml::from_str(content).map_err(|e| SettingsError::ParseError(e.to_string()))?;
    validate_clusters(&file.clusters)?;
    Ok(file.clusters)
}

/// Names unique, api servers declared, at most one default per region
pub fn validate_clusters(clusters: &[Cluster]) -> Result<(), SettingsError> {
    let mut names = std::collections::BTreeSet::new();
    let mut defaults: BTreeMap<&str, &str> = BTreeMap::new();

    for cluster in clusters {
        if cluster.name.trim().is_empty() {
            return Err(SettingsError::Invalid("cluster name must not be empty".into()));
        }
        if !names.insert(cluster.name.as_str()) {
            return Err(SettingsError::Invalid(format!(
                "cluster '{}' is declared twice",
                cluster.name
            )));
        }
        if cluster.api_servers.is_empty() {
            return Err(SettingsError::Invalid(format!(
                "cluster '{}' has no api_servers",
                cluster.name
            )));
        }
        if cluster.is_default {
            if let Some(other) = defaults.insert(cluster.region.as_str(), cluster.name.as_str()) {
                return Err(SettingsError::Invalid(format!(
                    "region '{}' has two default clusters: '{}' and '{}'",
                    cluster.region, other, cluster.name
                )));
            }
        }
    }
    Ok(())
}

// ============================================================================
// SBIO: I/O wrapper
// ============================================================================

pub fn load_clusters(path: &Path) -> Result<Vec<Cluster>, SettingsError> {
    let content = std::fs::read_to_string(path)?;
    parse_clusters(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClusterFeatureFlag, ExposedUrlType};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
clusters:
  - name: main
    region: default
    is_default: true
    exposed_url_type: SUBPATH
    feature_flags:
      ENABLE_AUTOSCALING: true
    ingress_config:
      sub_path_domains:
        - name: apps.example.com
    api_servers:
      - url: memory://main
  - name: backup
    region: default
    api_servers:
      - url: https://10.0.0.2:6443
        overridden_hostname: kubernetes
"#;

    #[test]
    fn test_parse_clusters() {
        let clusters = parse_clusters(SAMPLE).unwrap();
        assert_eq!(clusters.len(), 2);
        let main = &clusters[0];
        assert!(main.is_default);
        assert_eq!(main.exposed_url_type, ExposedUrlType::Subpath);
        assert!(main.has_feature(ClusterFeatureFlag::EnableAutoscaling));
        assert!(!main.has_feature(ClusterFeatureFlag::EnableEgressIp));
        assert_eq!(main.connect_timeout_secs, 5);
        assert_eq!(
            clusters[1].api_servers[0].overridden_hostname.as_deref(),
            Some("kubernetes")
        );
    }

    #[test]
    fn test_two_defaults_in_region_rejected() {
        let content = SAMPLE.replace("    region: default\n    api_servers:\n      - url: https", "    region: default\n    is_default: true\n    api_servers:\n      - url: https");
        let err = parse_clusters(&content).unwrap_err();
        assert!(err.to_string().contains("two default clusters"));
    }

    #[test]
    fn test_missing_api_servers_rejected() {
        let err = parse_clusters("clusters:\n  - name: a\n    region: r\n").unwrap_err();
        assert!(matches!(err, SettingsError::Invalid(_)));
    }

    #[test]
    fn test_load_clusters_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let clusters = load_clusters(file.path()).unwrap();
        assert_eq!(clusters[0].name, "main");
    }
}
