//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return Results, I/O is handled by caller

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;

use super::{DeployArgs, EnvTarget, SettingsArgs};
use crate::cluster::load_clusters;
use crate::context::{self, Config, Context, ContextError};
use crate::crypto::{CipherAlgorithm, CipherError, CipherManager};
use crate::models::Deployment;
use crate::quota::RepositoryQuota;
use crate::scheduler::ProcessInfo;
use crate::server::auth::USER_HEADER;
use crate::server::ErrorEnvelope;
use crate::settings::{load_settings, validate_settings, Settings, SettingsError};

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Invalid(String),

    #[error("Engine returned {code}: {detail}")]
    Server { code: String, detail: String },
}

pub type CommandResult<T> = Result<T, CommandError>;

// ============================================================================
// Context Commands (Pure business logic)
// ============================================================================

#[derive(Debug, Clone)]
pub struct ContextInfo {
    pub name: String,
    pub url: String,
    pub is_current: bool,
}

pub fn context_list(config: &Config) -> Vec<ContextInfo> {
    let current = config.current_name();
    let mut contexts: Vec<_> = config
        .contexts
        .values()
        .map(|ctx| ContextInfo {
            name: ctx.name.clone(),
            url: ctx.url.clone(),
            is_current: ctx.name == current,
        })
        .collect();

    contexts.push(ContextInfo {
        name: context::LOCAL_CONTEXT.to_string(),
        url: format!("http://{}:{}", config.local.host, config.local.port),
        is_current: current == context::LOCAL_CONTEXT,
    });

    contexts.sort_by(|a, b| a.name.cmp(&b.name));
    contexts
}

pub fn context_current(config: &Config) -> CommandResult<(String, String)> {
    let (url, _, _) = config.current_target()?;
    Ok((config.current_name().to_string(), url))
}

pub fn context_add(
    config: &mut Config,
    name: &str,
    url: &str,
    token: Option<&str>,
    user: Option<&str>,
) -> CommandResult<()> {
    let mut ctx = Context::new(name, url);
    if let Some(token) = token {
        ctx = ctx.with_token(token);
    }
    if let Some(user) = user {
        ctx = ctx.with_user(user);
    }
    context::add_context(config, ctx)?;
    Ok(())
}

// ============================================================================
// Settings Commands
// ============================================================================

/// Settings file with command line overrides applied
pub fn resolve_settings(args: &SettingsArgs) -> CommandResult<Settings> {
    let mut settings = load_settings(&args.settings)?;
    args.apply(&mut settings);
    Ok(settings)
}

/// Outcome of `check`
#[derive(Debug)]
pub struct CheckReport {
    pub settings_path: String,
    pub clusters: Vec<String>,
    pub cipher: CipherAlgorithm,
    pub errors: Vec<String>,
}

impl CheckReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate settings and the cluster file, collecting every problem
pub fn check_files(args: &SettingsArgs) -> CheckReport {
    let mut report = CheckReport {
        settings_path: args.settings.display().to_string(),
        clusters: Vec::new(),
        cipher: CipherAlgorithm::default(),
        errors: Vec::new(),
    };
    let settings = match resolve_settings(args) {
        Ok(settings) => settings,
        Err(e) => {
            report.errors.push(e.to_string());
            return report;
        }
    };
    report.cipher = settings.crypto.algorithm;
    if let Err(e) = validate_settings(&settings) {
        report.errors.push(e.to_string());
    }
    if let Err(e) = settings.cipher() {
        report.errors.push(e.to_string());
    }
    match settings.clusters_path() {
        Some(path) => match load_clusters(&path) {
            Ok(clusters) => report.clusters = clusters.into_iter().map(|c| c.name).collect(),
            Err(e) => report
                .errors
                .push(format!("{}: {}", path.display(), e)),
        },
        None => report
            .errors
            .push("no cluster file configured (clusters_file or --clusters)".to_string()),
    }
    report
}

pub fn encrypt_value(settings: &Settings, value: &str, algorithm: Option<&str>) -> CommandResult<String> {
    let cipher = settings.cipher()?;
    let algorithm = match algorithm {
        Some(tag) => tag.parse::<CipherAlgorithm>()?,
        None => cipher.algorithm(),
    };
    Ok(cipher.encrypt_with(algorithm, value)?)
}

pub fn decrypt_value(settings: &Settings, value: &str) -> CommandResult<String> {
    let cipher: CipherManager = settings.cipher()?;
    Ok(cipher.decrypt(value)?)
}

// ============================================================================
// Deploy Commands
// ============================================================================

/// Parse repeated `type=command` flags into a procfile
pub fn parse_procfile(entries: &[String]) -> CommandResult<BTreeMap<String, String>> {
    entries
        .iter()
        .map(|entry| {
            let (kind, command) = entry
                .split_once('=')
                .ok_or_else(|| CommandError::Invalid(format!("expected TYPE=COMMAND, got '{}'", entry)))?;
            let kind = kind.trim();
            if kind.is_empty() || command.trim().is_empty() {
                return Err(CommandError::Invalid(format!("empty process in '{}'", entry)));
            }
            Ok((kind.to_string(), command.trim().to_string()))
        })
        .collect()
}

pub fn deploy_body(args: &DeployArgs) -> CommandResult<Value> {
    if args.source_package.is_none() && args.image.is_none() {
        return Err(CommandError::Invalid(
            "one of --source-package or --image is required".to_string(),
        ));
    }
    Ok(json!({
        "source_package": args.source_package,
        "image": args.image,
        "branch": args.branch,
        "revision": args.revision,
        "procfile": parse_procfile(&args.procs)?,
    }))
}

// ============================================================================
// HTTP Client for the engine
// ============================================================================

pub struct EngineClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    user: Option<String>,
}

impl EngineClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token: None,
            user: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn from_context(config: &Config) -> CommandResult<Self> {
        let (url, token, user) = config.current_target()?;
        let mut client = Self::new(url);
        client.token = token;
        client.user = user;
        Ok(client)
    }

    fn build_request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.request(method, &url);
        if let Some(ref token) = self.token {
            req = req.bearer_auth(token);
        }
        if let Some(ref user) = self.user {
            req = req.header(USER_HEADER, user);
        }
        req
    }

    /// Send and decode, mapping error envelopes to [`CommandError::Server`]
    async fn send<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> CommandResult<T> {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let envelope = resp.json::<ErrorEnvelope>().await.ok();
            return Err(match envelope {
                Some(e) => CommandError::Server {
                    code: e.code,
                    detail: e.detail,
                },
                None => CommandError::Server {
                    code: status.as_u16().to_string(),
                    detail: status.canonical_reason().unwrap_or("error").to_string(),
                },
            });
        }
        Ok(resp.json().await?)
    }

    async fn send_empty(&self, req: reqwest::RequestBuilder) -> CommandResult<()> {
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let detail = resp
            .json::<ErrorEnvelope>()
            .await
            .map(|e| (e.code, e.detail))
            .unwrap_or_else(|_| (status.as_u16().to_string(), status.to_string()));
        Err(CommandError::Server {
            code: detail.0,
            detail: detail.1,
        })
    }

    pub async fn list_processes(&self, target: &EnvTarget) -> CommandResult<Vec<ProcessInfo>> {
        let path = format!("{}/processes", target.path());
        self.send(self.build_request(reqwest::Method::GET, &path))
            .await
    }

    pub async fn scale(&self, target: &EnvTarget, process_type: &str, replicas: i32) -> CommandResult<()> {
        let path = format!("{}/processes/scale", target.path());
        let req = self
            .build_request(reqwest::Method::POST, &path)
            .json(&json!({ "proc_type": process_type, "replicas": replicas }));
        self.send_empty(req).await
    }

    pub async fn deploy(&self, target: &EnvTarget, body: &Value) -> CommandResult<Deployment> {
        let path = format!("{}/deployments", target.path());
        self.send(self.build_request(reqwest::Method::POST, &path).json(body))
            .await
    }

    pub async fn get_deployment(&self, target: &EnvTarget, id: uuid::Uuid) -> CommandResult<Deployment> {
        let path = format!("{}/deployments/{}", target.path(), id);
        self.send(self.build_request(reqwest::Method::GET, &path))
            .await
    }

    /// Poll a deployment until it finishes
    pub async fn wait_deployment(
        &self,
        target: &EnvTarget,
        id: uuid::Uuid,
        interval: Duration,
    ) -> CommandResult<Deployment> {
        loop {
            let deployment = self.get_deployment(target, id).await?;
            if deployment.status.is_terminal() {
                return Ok(deployment);
            }
            tokio::time::sleep(interval).await;
        }
    }

    pub async fn extend_quota(
        &self,
        repo: &str,
        extra_bytes: u64,
        max_allowed_bytes: u64,
        required_usage_rate: Option<f64>,
    ) -> CommandResult<RepositoryQuota> {
        let req = self
            .build_request(reqwest::Method::POST, "/api/admin/quotas/extend")
            .json(&json!({
                "repo": repo,
                "extra_bytes": extra_bytes,
                "max_allowed_bytes": max_allowed_bytes,
                "required_usage_rate": required_usage_rate,
            }));
        self.send(req).await
    }
}

/// Load the context file from `path` or the default location
pub fn load_context_config(path: Option<&Path>) -> CommandResult<Config> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(context::default_config_path);
    Ok(context::load_config_from(&path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    #[test]
    fn test_context_list_marks_current() {
        let mut config = Config::default();
        context_add(&mut config, "prod", "http://10.0.0.1:8600", None, None).unwrap();
        context::set_current_context(&mut config, "prod").unwrap();

        let contexts = context_list(&config);
        assert_eq!(contexts.len(), 2);
        assert!(contexts.iter().any(|c| c.name == "prod" && c.is_current));
        assert!(contexts.iter().any(|c| c.name == "local" && !c.is_current));
    }

    #[test]
    fn test_parse_procfile() {
        let procfile =
            parse_procfile(&["web=gunicorn app -b :5000".into(), "worker = celery".into()]).unwrap();
        assert_eq!(procfile["web"], "gunicorn app -b :5000");
        assert_eq!(procfile["worker"], "celery");
        assert!(parse_procfile(&["web".into()]).is_err());
        assert!(parse_procfile(&["=x".into()]).is_err());
    }

    #[test]
    fn test_encrypt_then_decrypt_with_other_cipher() {
        let mut settings = Settings::default();
        settings.crypto.secret = "s3cret".into();
        let sealed = encrypt_value(&settings, "token", Some("sm4ctr")).unwrap();
        assert!(sealed.starts_with("sm4ctr$"));
        assert_eq!(decrypt_value(&settings, &sealed).unwrap(), "token");
        assert!(encrypt_value(&settings, "x", Some("rot13")).is_err());
    }

    #[test]
    fn test_check_reports_missing_cluster_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "crypto:\n  secret: abc\nauth:\n  jwt_secret: j").unwrap();
        let args = SettingsArgs {
            settings: file.path().to_path_buf(),
            clusters: Some(PathBuf::from("/nonexistent/clusters.yaml")),
            env_file: None,
            crypto_secret: None,
        };
        let report = check_files(&args);
        assert!(!report.is_ok());
        assert!(report.errors[0].contains("/nonexistent/clusters.yaml"));
    }

    #[test]
    fn test_check_passes_with_clusters() {
        let dir = tempfile::tempdir().unwrap();
        let clusters = dir.path().join("clusters.yaml");
        std::fs::write(
            &clusters,
            "clusters:\n  - name: c1\n    region: r1\n    is_default: true\n    api_servers:\n      - url: memory://c1\n",
        )
        .unwrap();
        let settings = dir.path().join("engine.yaml");
        std::fs::write(
            &settings,
            format!(
                "crypto:\n  secret: abc\nauth:\n  jwt_secret: j\nclusters_file: {}\n",
                clusters.display()
            ),
        )
        .unwrap();

        let report = check_files(&SettingsArgs {
            settings,
            clusters: None,
            env_file: None,
            crypto_secret: None,
        });
        assert!(report.is_ok(), "{:?}", report.errors);
        assert_eq!(report.clusters, vec!["c1".to_string()]);
    }
}
