use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::process::DEFAULT_PLAN;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuota {
    pub cpu: String,
    pub memory: String,
}

/// Resource preset a process runs with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcePlan {
    pub name: String,
    pub limits: ResourceQuota,
    pub requests: ResourceQuota,
    /// Hard cap on replicas for processes on this plan
    pub max_replicas: i32,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

fn default_tenant() -> String {
    "default".to_string()
}

impl ResourcePlan {
    /// Plan used when a requested plan cannot be resolved
    pub fn default_plan() -> Self {
        let now = Utc::now();
        Self {
            name: DEFAULT_PLAN.to_string(),
            limits: ResourceQuota {
                cpu: "4000m".to_string(),
                memory: "1024Mi".to_string(),
            },
            requests: ResourceQuota {
                cpu: "200m".to_string(),
                memory: "256Mi".to_string(),
            },
            max_replicas: 5,
            is_active: true,
            tenant_id: default_tenant(),
            created: now,
            updated: now,
        }
    }
}
