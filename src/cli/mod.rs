//! CLI module for paas-engine
//!
//! Provides subcommands:
//! - `paas-engine serve` - Run the API, task workers and builder pod sweeper
//! - `paas-engine check` - Validate the settings and cluster files
//! - `paas-engine encrypt` / `decrypt` - Operate on tagged field ciphertexts
//! - `paas-engine context` - Manage remote engine contexts
//! - `paas-engine get processes`, `scale`, `deploy`, `extend-quota` - Talk to
//!   the engine selected by the current context

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

use crate::settings::Settings;

#[derive(Parser, Debug)]
#[command(name = "paas-engine")]
#[command(about = "Workload control plane for PaaS applications on Kubernetes")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to the context file (default: ~/.paas-engine/config)
    #[arg(long, global = true, env = "PAAS_ENGINE_CONTEXT_FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the engine
    Serve(ServeArgs),

    /// Validate the settings and cluster files without starting
    Check(SettingsArgs),

    /// Encrypt a value with the configured cipher
    Encrypt(EncryptArgs),

    /// Decrypt a tagged value
    Decrypt(DecryptArgs),

    /// Manage engine contexts
    Context(ContextArgs),

    /// List resources of a module environment
    Get(GetArgs),

    /// Scale a process
    Scale(ScaleArgs),

    /// Start a deployment
    Deploy(DeployArgs),

    /// Grow the image repository quota of an application
    #[command(name = "extend-quota")]
    ExtendQuota(ExtendQuotaArgs),
}

/// Where the engine reads its settings from
#[derive(Parser, Debug, Clone)]
pub struct SettingsArgs {
    /// Settings file (YAML)
    #[arg(short, long, env = "PAAS_ENGINE_SETTINGS", default_value = "engine.yaml")]
    pub settings: PathBuf,

    /// Cluster directory file, overrides `clusters_file` from the settings
    #[arg(long, env = "PAAS_ENGINE_CLUSTERS")]
    pub clusters: Option<PathBuf>,

    /// Path to a .env file loaded before reading the settings
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Secret for field encryption
    #[arg(long, env = "PAAS_ENGINE_CRYPTO_SECRET", hide_env_values = true)]
    pub crypto_secret: Option<String>,
}

#[derive(Parser, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub settings: SettingsArgs,

    /// Bind address for the API server
    #[arg(long, env = "PAAS_ENGINE_BIND_ADDR")]
    pub bind_addr: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "PAAS_ENGINE_PORT")]
    pub port: Option<u16>,

    /// Redis URL for stream channels
    #[arg(long, env = "PAAS_ENGINE_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Number of task workers
    #[arg(long, env = "PAAS_ENGINE_WORKERS")]
    pub workers: Option<usize>,

    /// HMAC secret for service tokens
    #[arg(long, env = "PAAS_ENGINE_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,
}

impl SettingsArgs {
    /// Layer command line and environment values over file settings
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(clusters) = &self.clusters {
            settings.clusters_file = Some(clusters.display().to_string());
        }
        if let Some(secret) = &self.crypto_secret {
            settings.crypto.secret = secret.clone();
        }
    }
}

impl ServeArgs {
    pub fn apply(&self, settings: &mut Settings) {
        self.settings.apply(settings);
        if let Some(addr) = &self.bind_addr {
            settings.bind_addr = addr.clone();
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(url) = &self.redis_url {
            settings.redis_url = Some(url.clone());
        }
        if let Some(workers) = self.workers {
            settings.workers = workers;
        }
        if let Some(secret) = &self.jwt_secret {
            settings.auth.jwt_secret = secret.clone();
        }
    }
}

#[derive(Parser, Debug)]
pub struct EncryptArgs {
    #[command(flatten)]
    pub settings: SettingsArgs,

    /// Plaintext to encrypt
    pub value: String,

    /// Cipher to use instead of the configured one (bkcrypt, sm4ctr)
    #[arg(long)]
    pub algorithm: Option<String>,
}

#[derive(Parser, Debug)]
pub struct DecryptArgs {
    #[command(flatten)]
    pub settings: SettingsArgs,

    /// Tagged ciphertext, e.g. `bkcrypt$...`
    pub value: String,
}

/// Module environment addressed by app code, module and env name
#[derive(Parser, Debug, Clone)]
pub struct EnvTarget {
    /// Application code
    #[arg(short, long)]
    pub app: String,

    /// Module name
    #[arg(short, long, default_value = "default")]
    pub module: String,

    /// Environment (stag or prod)
    #[arg(short, long, default_value = "stag")]
    pub env: String,
}

impl EnvTarget {
    pub fn path(&self) -> String {
        format!(
            "/api/apps/{}/modules/{}/envs/{}",
            self.app, self.module, self.env
        )
    }
}

#[derive(Parser, Debug)]
pub struct GetArgs {
    #[command(subcommand)]
    pub resource: GetResource,
}

#[derive(Subcommand, Debug)]
pub enum GetResource {
    /// List processes and their instances
    #[command(name = "processes", visible_alias = "process", visible_alias = "ps")]
    Processes {
        #[command(flatten)]
        target: EnvTarget,
    },
}

#[derive(Parser, Debug)]
pub struct ScaleArgs {
    #[command(flatten)]
    pub target: EnvTarget,

    /// Process type, e.g. "web"
    pub process_type: String,

    /// Number of replicas
    #[arg(long)]
    pub replicas: i32,
}

#[derive(Parser, Debug)]
pub struct DeployArgs {
    #[command(flatten)]
    pub target: EnvTarget,

    /// Source package URL to build from
    #[arg(long, conflicts_with = "image")]
    pub source_package: Option<String>,

    /// Prebuilt image for modules that skip the build
    #[arg(long)]
    pub image: Option<String>,

    #[arg(long)]
    pub branch: Option<String>,

    #[arg(long)]
    pub revision: Option<String>,

    /// Procfile entry as `type=command`, repeatable
    #[arg(long = "proc", value_name = "TYPE=COMMAND")]
    pub procs: Vec<String>,

    /// Wait for the deployment to finish
    #[arg(short, long)]
    pub wait: bool,
}

#[derive(Parser, Debug)]
pub struct ExtendQuotaArgs {
    /// Repository name
    pub repo: String,

    /// Bytes to add
    #[arg(long)]
    pub extra_bytes: u64,

    /// Ceiling the quota may not exceed
    #[arg(long)]
    pub max_allowed_bytes: u64,

    /// Usage rate the repository must reach first, e.g. 0.8
    #[arg(long)]
    pub required_usage_rate: Option<f64>,
}

#[derive(Parser, Debug)]
pub struct ContextArgs {
    #[command(subcommand)]
    pub action: ContextAction,
}

#[derive(Subcommand, Debug)]
pub enum ContextAction {
    /// List all contexts
    List,

    /// Show current context
    Current,

    /// Switch to a context
    Use {
        /// Context name
        name: String,
    },

    /// Add a new context
    Add {
        /// Context name
        name: String,

        /// Engine URL
        #[arg(long)]
        url: String,

        /// Bearer token
        #[arg(long)]
        token: Option<String>,

        /// User to act as with a service token
        #[arg(long)]
        user: Option<String>,
    },

    /// Delete a context
    Delete {
        /// Context name
        name: String,
    },
}
