use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use paas_engine::cli::{self, Cli, Commands, ContextAction, GetResource, SettingsArgs};
use paas_engine::cluster::load_clusters;
use paas_engine::context::{self, save_config_to};
use paas_engine::server::{create_router, AppState};
use paas_engine::settings::validate_settings;
use paas_engine::store::Store;
use paas_engine::Engine;

#[tokio::main]
async fn main() {
    let args = Cli::parse();

    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_env_file(args: &SettingsArgs) -> Result<()> {
    if let Some(ref env_file) = args.env_file {
        dotenvy::from_path(env_file)
            .with_context(|| format!("Failed to load env file {}", env_file.display()))?;
    }
    Ok(())
}

async fn run(args: Cli) -> Result<()> {
    let context_path = args
        .config
        .clone()
        .unwrap_or_else(context::default_config_path);

    match args.command {
        Commands::Serve(serve) => {
            load_env_file(&serve.settings)?;
            let mut settings = cli::resolve_settings(&serve.settings)?;
            serve.apply(&mut settings);
            validate_settings(&settings)?;
            serve_engine(settings).await
        }
        Commands::Check(check) => {
            load_env_file(&check)?;
            let report = cli::check_files(&check);
            print!("{}", cli::format_check_report(&report));
            if !report.is_ok() {
                bail!("{} problem(s) found", report.errors.len());
            }
            Ok(())
        }
        Commands::Encrypt(enc) => {
            load_env_file(&enc.settings)?;
            let settings = cli::resolve_settings(&enc.settings)?;
            println!(
                "{}",
                cli::encrypt_value(&settings, &enc.value, enc.algorithm.as_deref())?
            );
            Ok(())
        }
        Commands::Decrypt(dec) => {
            load_env_file(&dec.settings)?;
            let settings = cli::resolve_settings(&dec.settings)?;
            println!("{}", cli::decrypt_value(&settings, &dec.value)?);
            Ok(())
        }
        Commands::Context(ctx) => {
            let mut config = cli::load_context_config(Some(context_path.as_path()))?;
            match ctx.action {
                ContextAction::List => print!("{}", cli::format_context_list(&cli::context_list(&config))),
                ContextAction::Current => {
                    let (name, url) = cli::context_current(&config)?;
                    print!("{}", cli::format_current_context(&name, &url));
                }
                ContextAction::Use { name } => {
                    context::set_current_context(&mut config, &name)?;
                    save_config_to(&config, &context_path)?;
                    println!("Switched to context \"{}\"", name);
                }
                ContextAction::Add {
                    name,
                    url,
                    token,
                    user,
                } => {
                    cli::context_add(&mut config, &name, &url, token.as_deref(), user.as_deref())?;
                    save_config_to(&config, &context_path)?;
                    println!("Context \"{}\" added", name);
                }
                ContextAction::Delete { name } => {
                    if context::remove_context(&mut config, &name).is_none() {
                        bail!("context \"{}\" not found", name);
                    }
                    save_config_to(&config, &context_path)?;
                    println!("Context \"{}\" deleted", name);
                }
            }
            Ok(())
        }
        Commands::Get(get) => {
            let client = engine_client(&context_path)?;
            match get.resource {
                GetResource::Processes { target } => {
                    let processes = client.list_processes(&target).await?;
                    print!("{}", cli::format_process_list(&processes));
                }
            }
            Ok(())
        }
        Commands::Scale(scale) => {
            let client = engine_client(&context_path)?;
            client
                .scale(&scale.target, &scale.process_type, scale.replicas)
                .await?;
            println!("{} scaled to {}", scale.process_type, scale.replicas);
            Ok(())
        }
        Commands::Deploy(deploy) => {
            let client = engine_client(&context_path)?;
            let body = cli::deploy_body(&deploy)?;
            let mut deployment = client.deploy(&deploy.target, &body).await?;
            if deploy.wait {
                deployment = client
                    .wait_deployment(&deploy.target, deployment.id, Duration::from_secs(2))
                    .await?;
            }
            print!("{}", cli::format_deployment(&deployment));
            Ok(())
        }
        Commands::ExtendQuota(ext) => {
            let client = engine_client(&context_path)?;
            let quota = client
                .extend_quota(
                    &ext.repo,
                    ext.extra_bytes,
                    ext.max_allowed_bytes,
                    ext.required_usage_rate,
                )
                .await?;
            print!("{}", cli::format_quota(&quota));
            Ok(())
        }
    }
}

fn engine_client(context_path: &Path) -> Result<cli::EngineClient> {
    let config = cli::load_context_config(Some(context_path))?;
    Ok(cli::EngineClient::from_context(&config)?)
}

async fn serve_engine(settings: paas_engine::settings::Settings) -> Result<()> {
    let clusters = match settings.clusters_path() {
        Some(path) => load_clusters(&path)
            .with_context(|| format!("Failed to load clusters from {}", path.display()))?,
        None => Vec::new(),
    };
    let addr = format!("{}:{}", settings.bind_addr, settings.port);

    let engine = Arc::new(Engine::new(settings, Arc::new(Store::new()), clusters)?);
    let workers = engine.start_workers();
    let state = AppState::new(engine.clone(), workers.queue.clone());
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("paas-engine listening on {}", addr);
    info!(
        clusters = engine.store.clusters.all().len(),
        workers = engine.settings.workers,
        "engine ready"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("Server error")?;

    workers.shutdown().await;
    Ok(())
}
