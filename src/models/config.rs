use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Toleration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata key holding the mapper generation pointer
pub const MAPPER_VERSION_KEY: &str = "mapper_version";

/// Naming and labelling scheme generation for workload objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MapperVersion {
    /// `<region>-<name>-<proc>-deployment` naming
    V1,
    /// `<name>-<proc>` naming
    #[default]
    V2,
}

impl MapperVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            MapperVersion::V1 => "v1",
            MapperVersion::V2 => "v2",
        }
    }
}

impl fmt::Display for MapperVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MapperVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "v1" => Ok(MapperVersion::V1),
            "v2" => Ok(MapperVersion::V2),
            other => Err(format!("unknown mapper version '{}'", other)),
        }
    }
}

/// Versioned scheduling config of a WlApp; the latest version wins
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub id: Uuid,
    pub wl_app_id: Uuid,
    pub version: u32,
    /// Target cluster name; `None` means the region default
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub image_pull_policy: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub tenant_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Config {
    pub fn initial(wl_app_id: Uuid, tenant_id: &str) -> Self {
        let now = Utc::now();
        let mut metadata = BTreeMap::new();
        metadata.insert(
            MAPPER_VERSION_KEY.to_string(),
            serde_json::Value::String(MapperVersion::default().to_string()),
        );
        Self {
            id: Uuid::new_v4(),
            wl_app_id,
            version: 1,
            cluster: None,
            node_selector: BTreeMap::new(),
            tolerations: Vec::new(),
            image: None,
            image_pull_policy: None,
            metadata,
            tenant_id: tenant_id.to_string(),
            created: now,
            updated: now,
        }
    }

    /// Copy this config as the base for the next version
    pub fn next_draft(&self) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            version: self.version + 1,
            created: now,
            updated: now,
            ..self.clone()
        }
    }

    /// Configured cluster name, treating blank as unset
    pub fn cluster_name(&self) -> Option<&str> {
        self.cluster.as_deref().filter(|c| !c.trim().is_empty())
    }

    /// Unknown or missing pointers read as the current generation
    pub fn mapper_version(&self) -> MapperVersion {
        self.metadata
            .get(MAPPER_VERSION_KEY)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }

    pub fn set_mapper_version(&mut self, version: MapperVersion) {
        self.metadata.insert(
            MAPPER_VERSION_KEY.to_string(),
            serde_json::Value::String(version.to_string()),
        );
    }
}
