//! CLI contexts: named engine endpoints and the tokens used to reach them

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::settings::DEFAULT_PORT;

/// Name of the built-in context pointing at a local engine
pub const LOCAL_CONTEXT: &str = "local";

/// Default config file location: ~/.paas-engine/config
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".paas-engine")
        .join("config")
}

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Context '{0}' not found")]
    ContextNotFound(String),

    #[error("Context name '{0}' is reserved")]
    Reserved(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to write config: {0}")]
    WriteError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A remote engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub name: String,
    /// Base URL of the engine API, e.g. "http://paas-engine.internal:8600"
    pub url: String,
    /// Bearer token sent with every request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// End user to act as when the token is a service token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(rename = "current-context")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_context: Option<String>,

    #[serde(default)]
    pub contexts: HashMap<String, Context>,

    #[serde(default)]
    pub local: LocalConfig,
}

/// Where the built-in `local` context points
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: default_host(),
            token: None,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

pub fn parse_config(content: &str) -> Result<Config, ContextError> {
    serde_yaml::from_str(content).map_err(|e| ContextError::ParseError(e.to_string()))
}

pub fn serialize_config(config: &Config) -> Result<String, ContextError> {
    serde_yaml::to_string(config).map_err(|e| ContextError::WriteError(e.to_string()))
}

/// Add or replace a context
pub fn add_context(config: &mut Config, context: Context) -> Result<(), ContextError> {
    if context.name == LOCAL_CONTEXT {
        return Err(ContextError::Reserved(context.name));
    }
    config.contexts.insert(context.name.clone(), context);
    Ok(())
}

/// Remove a context, clearing the selection when it was current
pub fn remove_context(config: &mut Config, name: &str) -> Option<Context> {
    let removed = config.contexts.remove(name);
    if config.current_context.as_deref() == Some(name) {
        config.current_context = None;
    }
    removed
}

pub fn set_current_context(config: &mut Config, name: &str) -> Result<(), ContextError> {
    if name != LOCAL_CONTEXT && !config.contexts.contains_key(name) {
        return Err(ContextError::ContextNotFound(name.to_string()));
    }
    config.current_context = Some(name.to_string());
    Ok(())
}

impl Config {
    pub fn current_name(&self) -> &str {
        self.current_context.as_deref().unwrap_or(LOCAL_CONTEXT)
    }

    /// Endpoint, token and acting user of the current context
    pub fn current_target(&self) -> Result<(String, Option<String>, Option<String>), ContextError> {
        match self.current_name() {
            LOCAL_CONTEXT => Ok((
                format!("http://{}:{}", self.local.host, self.local.port),
                self.local.token.clone(),
                None,
            )),
            name => self
                .contexts
                .get(name)
                .map(|c| (c.url.trim_end_matches('/').to_string(), c.token.clone(), c.user.clone()))
                .ok_or_else(|| ContextError::ContextNotFound(name.to_string())),
        }
    }
}

impl Context {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            token: None,
            user: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Load config, treating a missing file as empty
pub fn load_config_from(path: &Path) -> Result<Config, ContextError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

pub fn save_config_to(config: &Config, path: &Path) -> Result<(), ContextError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serialize_config(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_targets_local_engine() {
        let config = Config::default();
        assert_eq!(config.current_name(), LOCAL_CONTEXT);
        let (url, token, _) = config.current_target().unwrap();
        assert_eq!(url, format!("http://127.0.0.1:{}", DEFAULT_PORT));
        assert!(token.is_none());
    }

    #[test]
    fn test_parse_config() {
        let yaml = r#"
current-context: prod
contexts:
  prod:
    name: prod
    url: https://engine.example.com/
    token: secret123
    user: alice
"#;
        let config = parse_config(yaml).unwrap();
        let (url, token, user) = config.current_target().unwrap();
        assert_eq!(url, "https://engine.example.com");
        assert_eq!(token.as_deref(), Some("secret123"));
        assert_eq!(user.as_deref(), Some("alice"));
    }

    #[test]
    fn test_local_name_is_reserved() {
        let mut config = Config::default();
        let result = add_context(&mut config, Context::new("local", "http://x"));
        assert!(matches!(result, Err(ContextError::Reserved(_))));
    }

    #[test]
    fn test_remove_current_context_clears_selection() {
        let mut config = Config::default();
        add_context(&mut config, Context::new("test", "http://localhost:8600")).unwrap();
        set_current_context(&mut config, "test").unwrap();

        assert!(remove_context(&mut config, "test").is_some());
        assert!(config.current_context.is_none());
    }

    #[test]
    fn test_set_unknown_context_fails() {
        let mut config = Config::default();
        let result = set_current_context(&mut config, "nonexistent");
        assert!(matches!(result, Err(ContextError::ContextNotFound(_))));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config");
        let mut config = Config::default();
        add_context(
            &mut config,
            Context::new("staging", "http://10.0.0.1:8600").with_token("t"),
        )
        .unwrap();
        set_current_context(&mut config, "staging").unwrap();
        save_config_to(&config, &path).unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded.current_name(), "staging");
        assert_eq!(loaded.contexts["staging"].token.as_deref(), Some("t"));
    }
}
