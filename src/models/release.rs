use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Binds a build to a config; `version` is monotonic per WlApp starting at 1
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    pub id: Uuid,
    pub wl_app_id: Uuid,
    pub version: u32,
    pub build_id: Uuid,
    pub config_id: Uuid,
    /// Process type -> command string, copied from the build
    pub procfile: BTreeMap<String, String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub operator: String,
    pub tenant_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Release {
    pub fn is_successful(&self) -> bool {
        !self.failed
    }
}

/// Process types to tear down or roll when moving between procfiles
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZombieSet {
    /// Present before, absent now: delete workloads
    pub types: BTreeSet<String>,
    /// Present in both with a different command: roll workloads
    pub names: BTreeSet<String>,
}

impl ZombieSet {
    /// Only the command string is compared; argument lists are not part of a
    /// procfile entry.
    pub fn between(previous: &BTreeMap<String, String>, next: &BTreeMap<String, String>) -> Self {
        let types = previous
            .keys()
            .filter(|k| !next.contains_key(*k))
            .cloned()
            .collect();
        let names = previous
            .iter()
            .filter_map(|(k, cmd)| match next.get(k) {
                Some(new_cmd) if new_cmd != cmd => Some(k.clone()),
                _ => None,
            })
            .collect();
        Self { types, names }
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty() && self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn procfile(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_zombie_rename_is_delete() {
        let set = ZombieSet::between(&procfile(&[("web", "./a")]), &procfile(&[("api", "./a")]));
        assert_eq!(set.types.iter().collect::<Vec<_>>(), vec!["web"]);
        assert!(set.names.is_empty());
    }

    #[test]
    fn test_zombie_changed_command_is_rolled() {
        let set = ZombieSet::between(
            &procfile(&[("web", "./a"), ("worker", "celery")]),
            &procfile(&[("web", "./b"), ("worker", "celery")]),
        );
        assert!(set.types.is_empty());
        assert_eq!(set.names.iter().collect::<Vec<_>>(), vec!["web"]);
    }

    #[test]
    fn test_zombie_identical_is_empty() {
        let p = procfile(&[("web", "./a")]);
        assert!(ZombieSet::between(&p, &p).is_empty());
        assert!(ZombieSet::between(&BTreeMap::new(), &p).is_empty());
    }
}
