//! Application-side records the engine acts on, and the workload app (WlApp)
//! each module environment maps to.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::EncryptedString;

/// Token substituted for `_`, which is not allowed in DNS labels
pub const UNDERSCORE_TOKEN: &str = "0us0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppType {
    Default,
    Engineless,
    CloudNative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Stag,
    Prod,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Stag => "stag",
            Environment::Prod => "prod",
        }
    }

    pub fn all() -> [Environment; 2] {
        [Environment::Stag, Environment::Prod]
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stag" => Ok(Environment::Stag),
            "prod" => Ok(Environment::Prod),
            other => Err(format!("unknown environment '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: Uuid,
    /// Globally unique application code
    pub code: String,
    pub name: String,
    pub region: String,
    #[serde(rename = "type")]
    pub app_type: AppType,
    pub secret: EncryptedString,
    pub tenant_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildMethod {
    #[default]
    Buildpack,
    Dockerfile,
    CustomImage,
}

/// Where a module's source comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceOrigin {
    #[default]
    AuthorizedVcs,
    Package,
    SMart,
    /// S-Mart package that ships a prebuilt image
    SMartImage,
    Image,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default)]
    pub build_method: BuildMethod,
    /// Repository the built image is pushed to
    #[serde(default)]
    pub image_repository: Option<String>,
    /// Image used as-is when the build method is `CUSTOM_IMAGE`
    #[serde(default)]
    pub custom_image: Option<String>,
    /// User credential for pulling from `image_repository`
    #[serde(default)]
    pub image_credential_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSpec {
    pub enabled: bool,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

impl HookSpec {
    pub fn argv(&self) -> Vec<String> {
        self.command.iter().chain(self.args.iter()).cloned().collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub id: Uuid,
    pub application_id: Uuid,
    pub name: String,
    pub is_default: bool,
    #[serde(default)]
    pub source_origin: SourceOrigin,
    #[serde(default)]
    pub build_config: BuildConfig,
    #[serde(default)]
    pub pre_release_hook: Option<HookSpec>,
    /// Annotations of the cloud-native model resource
    #[serde(default)]
    pub model_annotations: BTreeMap<String, String>,
    pub tenant_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Module {
    /// Custom-image modules and image-typed S-Mart packages skip the build phase
    pub fn skips_build(&self) -> bool {
        self.build_config.build_method == BuildMethod::CustomImage
            || self.source_origin == SourceOrigin::SMartImage
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleEnv {
    pub id: Uuid,
    pub module_id: Uuid,
    pub environment: Environment,
    pub wl_app_id: Uuid,
    #[serde(default)]
    pub is_offlined: bool,
    pub tenant_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Scope of a module-level config var
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigVarScope {
    #[serde(rename = "_global_")]
    Global,
    #[serde(rename = "stag")]
    Stag,
    #[serde(rename = "prod")]
    Prod,
}

impl ConfigVarScope {
    pub fn applies_to(&self, env: Environment) -> bool {
        matches!(
            (self, env),
            (ConfigVarScope::Global, _)
                | (ConfigVarScope::Stag, Environment::Stag)
                | (ConfigVarScope::Prod, Environment::Prod)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigVar {
    pub id: Uuid,
    pub module_id: Uuid,
    pub scope: ConfigVarScope,
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub description: String,
    pub tenant_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Workload-side record of one application x module x environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WlApp {
    pub id: Uuid,
    pub region: String,
    pub name: String,
    #[serde(rename = "type")]
    pub app_type: AppType,
    pub app_code: String,
    pub module_name: String,
    pub environment: Environment,
    pub tenant_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl WlApp {
    /// Derive the workload app name for a module environment
    pub fn name_for(app_code: &str, module_name: &str, is_default: bool, env: Environment) -> String {
        if is_default {
            format!("bkapp-{}-{}", app_code, env)
        } else {
            format!("bkapp-{}-m-{}-{}", app_code, module_name, env)
        }
    }

    /// DNS-label compatible form of the name
    pub fn scheduler_safe_name(&self) -> String {
        self.name.replace('_', UNDERSCORE_TOKEN)
    }

    pub fn namespace(&self) -> String {
        self.scheduler_safe_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wl_app(name: &str) -> WlApp {
        WlApp {
            id: Uuid::new_v4(),
            region: "default".into(),
            name: name.into(),
            app_type: AppType::Default,
            app_code: "foo".into(),
            module_name: "default".into(),
            environment: Environment::Stag,
            tenant_id: "default".into(),
            created: Utc::now(),
            updated: Utc::now(),
        }
    }

    #[test]
    fn test_scheduler_safe_name_replaces_underscore() {
        let app = wl_app("bkapp-my_app-stag");
        assert_eq!(app.scheduler_safe_name(), "bkapp-my0us0app-stag");
        assert_eq!(app.namespace(), "bkapp-my0us0app-stag");
    }

    #[test]
    fn test_wl_app_name_for_modules() {
        assert_eq!(
            WlApp::name_for("foo", "default", true, Environment::Prod),
            "bkapp-foo-prod"
        );
        assert_eq!(
            WlApp::name_for("foo", "api", false, Environment::Stag),
            "bkapp-foo-m-api-stag"
        );
    }

    #[test]
    fn test_config_var_scope() {
        assert!(ConfigVarScope::Global.applies_to(Environment::Prod));
        assert!(ConfigVarScope::Stag.applies_to(Environment::Stag));
        assert!(!ConfigVarScope::Stag.applies_to(Environment::Prod));
    }

    #[test]
    fn test_scope_serde_names() {
        let json = serde_json::to_string(&ConfigVarScope::Global).unwrap();
        assert_eq!(json, "\"_global_\"");
    }
}
