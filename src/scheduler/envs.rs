//! Environment variables of a workload container
//!
//! Layers, later wins: platform builtins, module config vars (global then
//! env-scoped), process vars, pipeline extras.

use std::collections::BTreeMap;

use crate::models::ConfigVar;

pub const PROCESS_TYPE_PLACEHOLDER: &str = "{{bk_var_process_type}}";
pub const MAJOR_VERSION: &str = "3";

/// Values the platform injects into every process
#[derive(Debug, Clone)]
pub struct BuiltinContext {
    pub prefix: String,
    pub app_code: String,
    pub app_secret: String,
    pub module_name: String,
    pub environment: String,
    pub region: String,
    pub sub_path: String,
}

impl BuiltinContext {
    pub fn log_name_prefix(&self) -> String {
        format!("{}-bkapp-{}-{}", self.region, self.app_code, self.environment)
    }

    pub fn vars(&self, process_type: &str, port: i32) -> BTreeMap<String, String> {
        let p = &self.prefix;
        [
            ("PORT".to_string(), port.to_string()),
            (format!("{}APP_ID", p), self.app_code.clone()),
            (format!("{}APP_SECRET", p), self.app_secret.clone()),
            (format!("{}APP_MODULE_NAME", p), self.module_name.clone()),
            (format!("{}ENVIRONMENT", p), self.environment.clone()),
            (format!("{}MAJOR_VERSION", p), MAJOR_VERSION.to_string()),
            (format!("{}ENGINE_REGION", p), self.region.clone()),
            (format!("{}LOG_NAME_PREFIX", p), self.log_name_prefix()),
            (format!("{}SUB_PATH", p), self.sub_path.clone()),
            (format!("{}PROCESS_TYPE", p), process_type.to_string()),
        ]
        .into_iter()
        .collect()
    }
}

pub fn merge_envs(
    builtin: BTreeMap<String, String>,
    config_vars: &[ConfigVar],
    process_vars: &BTreeMap<String, String>,
    extras: &BTreeMap<String, String>,
    process_type: &str,
) -> BTreeMap<String, String> {
    let mut merged = builtin;
    for var in config_vars {
        merged.insert(var.key.clone(), var.value.clone());
    }
    merged.extend(process_vars.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged.extend(extras.iter().map(|(k, v)| (k.clone(), v.clone())));

    for value in merged.values_mut() {
        if value.contains(PROCESS_TYPE_PLACEHOLDER) {
            *value = value.replace(PROCESS_TYPE_PLACEHOLDER, process_type);
        }
    }
    merged
}
