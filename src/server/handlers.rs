//! Handlers for one module environment and its application
//!
//! Env-scoped routes live under `/api/apps/{code}/modules/{module}/envs/{env}`.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::auth::Principal;
use super::error::ApiResult;
use super::state::AppState;
use crate::error::EngineError;
use crate::models::{AutoscalingConfig, Deployment};
use crate::pipeline::{BuildRequest, DeployRequest};
use crate::tasks::Job;

type EnvPath = Path<(String, String, String)>;

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

// ============================================================================
// Builds, deployments, releases
// ============================================================================

pub async fn create_build(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((code, module, env)): EnvPath,
    Json(mut req): Json<BuildRequest>,
) -> ApiResult<impl IntoResponse> {
    let records = state.env(&code, &module, &env)?;
    req.operator = principal.username;
    let process = state
        .engine
        .pipeline
        .start_build(records.wl_app.id, req)
        .await?;
    state
        .queue
        .submit(Job::Build {
            build_process_id: process.id,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(process)))
}

pub async fn get_build(
    State(state): State<AppState>,
    Path((code, module, env, id)): Path<(String, String, String, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    let records = state.env(&code, &module, &env)?;
    let process = state.engine.store.build_processes.get(&id)?;
    if process.wl_app_id != records.wl_app.id {
        return Err(EngineError::not_found(format!("build process {}", id)).into());
    }
    Ok(Json(process))
}

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_page_size")]
    pub limit: usize,
}

#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub count: usize,
    pub results: Vec<T>,
}

impl<T> Page<T> {
    fn slice(items: Vec<T>, query: &PageQuery) -> Self {
        let count = items.len();
        let results = items
            .into_iter()
            .skip(query.offset)
            .take(query.limit.min(MAX_PAGE_SIZE))
            .collect();
        Self { count, results }
    }
}

/// Build processes of the env, newest generation first
pub async fn list_builds(
    State(state): State<AppState>,
    Path((code, module, env)): EnvPath,
    Query(query): Query<PageQuery>,
) -> ApiResult<impl IntoResponse> {
    let records = state.env(&code, &module, &env)?;
    let processes = state.engine.store.build_processes_of(records.wl_app.id);
    Ok(Json(Page::slice(processes, &query)))
}

pub async fn create_deployment(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((code, module, env)): EnvPath,
    Json(mut req): Json<DeployRequest>,
) -> ApiResult<impl IntoResponse> {
    let records = state.env(&code, &module, &env)?;
    req.operator = principal.username;
    let deployment = state
        .engine
        .pipeline
        .create_deployment(records.module_env.id, req)
        .await?;
    state
        .queue
        .submit(Job::Deploy {
            deployment_id: deployment.id,
            extra_envs: BTreeMap::new(),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

pub async fn list_deployments(
    State(state): State<AppState>,
    Path((code, module, env)): EnvPath,
) -> ApiResult<Json<Vec<Deployment>>> {
    let records = state.env(&code, &module, &env)?;
    Ok(Json(state.engine.store.deployments_of(records.module_env.id)))
}

fn env_deployment(state: &AppState, code: &str, module: &str, env: &str, id: Uuid) -> ApiResult<Deployment> {
    let records = state.env(code, module, env)?;
    let deployment = state.engine.store.deployments.get(&id)?;
    if deployment.module_env_id != records.module_env.id {
        return Err(EngineError::not_found(format!("deployment {}", id)).into());
    }
    Ok(deployment)
}

pub async fn get_deployment(
    State(state): State<AppState>,
    Path((code, module, env, id)): Path<(String, String, String, Uuid)>,
) -> ApiResult<Json<Deployment>> {
    Ok(Json(env_deployment(&state, &code, &module, &env, id)?))
}

#[derive(Debug, Default, Deserialize)]
pub struct InterruptRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn interrupt_deployment(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((code, module, env, id)): Path<(String, String, String, Uuid)>,
    body: Option<Json<InterruptRequest>>,
) -> ApiResult<Json<Deployment>> {
    env_deployment(&state, &code, &module, &env, id)?;
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| format!("interrupted by {}", principal.username));
    Ok(Json(state.engine.pipeline.interrupt_deployment(id, &reason)?))
}

pub async fn list_releases(
    State(state): State<AppState>,
    Path((code, module, env)): EnvPath,
) -> ApiResult<impl IntoResponse> {
    let records = state.env(&code, &module, &env)?;
    Ok(Json(state.engine.store.releases_of(records.wl_app.id)))
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub build_id: Uuid,
    #[serde(default)]
    pub summary: String,
}

/// Record a release of an existing build against the env's latest config
///
/// Workloads are not touched; the next deployment or scale applies it.
pub async fn create_release(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((code, module, env)): EnvPath,
    Json(req): Json<ReleaseRequest>,
) -> ApiResult<impl IntoResponse> {
    let records = state.env(&code, &module, &env)?;
    let build = state.engine.store.builds.get(&req.build_id)?;
    if build.wl_app_id != records.wl_app.id {
        return Err(EngineError::not_found(format!("build {}", req.build_id)).into());
    }
    let release = state
        .engine
        .pipeline
        .create_release(records.wl_app.id, &build, &principal.username, &req.summary)
        .await?;
    Ok((StatusCode::CREATED, Json(release)))
}

pub async fn get_release(
    State(state): State<AppState>,
    Path((code, module, env, version)): Path<(String, String, String, u32)>,
) -> ApiResult<impl IntoResponse> {
    let records = state.env(&code, &module, &env)?;
    Ok(Json(
        state
            .engine
            .store
            .release_by_version(records.wl_app.id, version)?,
    ))
}

// ============================================================================
// Processes
// ============================================================================

pub async fn list_processes(
    State(state): State<AppState>,
    Path((code, module, env)): EnvPath,
) -> ApiResult<impl IntoResponse> {
    let records = state.env(&code, &module, &env)?;
    let processes = state
        .engine
        .scheduler
        .get_processes_info(records.wl_app.id)
        .await?;
    Ok(Json(processes))
}

#[derive(Debug, Deserialize)]
pub struct ScaleRequest {
    pub proc_type: String,
    pub replicas: i32,
}

pub async fn scale_process(
    State(state): State<AppState>,
    Path((code, module, env)): EnvPath,
    Json(req): Json<ScaleRequest>,
) -> ApiResult<impl IntoResponse> {
    let records = state.env(&code, &module, &env)?;
    state
        .engine
        .scheduler
        .scale(records.wl_app.id, &req.proc_type, req.replicas)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct SwitchPlanRequest {
    pub plan_name: String,
}

pub async fn switch_plan(
    State(state): State<AppState>,
    Path((code, module, env, proc_type)): Path<(String, String, String, String)>,
    Json(req): Json<SwitchPlanRequest>,
) -> ApiResult<impl IntoResponse> {
    let records = state.env(&code, &module, &env)?;
    state
        .engine
        .scheduler
        .switch_plan(records.wl_app.id, &proc_type, &req.plan_name)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AutoscalingRequest {
    pub enabled: bool,
    #[serde(default)]
    pub config: Option<AutoscalingConfig>,
}

pub async fn set_autoscaling(
    State(state): State<AppState>,
    Path((code, module, env, proc_type)): Path<(String, String, String, String)>,
    Json(req): Json<AutoscalingRequest>,
) -> ApiResult<impl IntoResponse> {
    let records = state.env(&code, &module, &env)?;
    let config = match (req.enabled, req.config) {
        (true, Some(config)) => Some(config),
        (true, None) => {
            return Err(EngineError::field("config", "autoscaling config is required").into())
        }
        (false, _) => None,
    };
    state
        .engine
        .scheduler
        .set_autoscaling(records.wl_app.id, &proc_type, config)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_instance(
    State(state): State<AppState>,
    Path((code, module, env, name)): Path<(String, String, String, String)>,
) -> ApiResult<impl IntoResponse> {
    let records = state.env(&code, &module, &env)?;
    let instance = state
        .engine
        .scheduler
        .get_instance(records.wl_app.id, &name)
        .await?;
    Ok(Json(instance))
}

pub async fn instance_events(
    State(state): State<AppState>,
    Path((code, module, env, name)): Path<(String, String, String, String)>,
) -> ApiResult<impl IntoResponse> {
    let records = state.env(&code, &module, &env)?;
    let events = state
        .engine
        .scheduler
        .instance_events(records.wl_app.id, &name)
        .await?;
    Ok(Json(events))
}

// ============================================================================
// Commands and archive
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub extra_envs: Option<BTreeMap<String, String>>,
}

pub async fn create_command(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((code, module, env)): EnvPath,
    Json(req): Json<CommandRequest>,
) -> ApiResult<impl IntoResponse> {
    let records = state.env(&code, &module, &env)?;
    let command = state.engine.pipeline.create_command(
        records.wl_app.id,
        &req.command,
        &principal.username,
    )?;
    let stream_channel_id = Uuid::new_v4();
    state
        .queue
        .submit(Job::Command {
            command_id: command.id,
            stream_channel_id: Some(stream_channel_id),
            extra_envs: req.extra_envs,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "command": command, "stream_channel_id": stream_channel_id })),
    ))
}

pub async fn get_command(
    State(state): State<AppState>,
    Path((code, module, env, id)): Path<(String, String, String, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    let records = state.env(&code, &module, &env)?;
    let command = state.engine.store.commands.get(&id)?;
    if command.wl_app_id != records.wl_app.id {
        return Err(EngineError::not_found(format!("command {}", id)).into());
    }
    Ok(Json(command))
}

pub async fn archive_env(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((code, module, env)): EnvPath,
) -> ApiResult<impl IntoResponse> {
    let records = state.env(&code, &module, &env)?;
    let operation = state
        .engine
        .archiver
        .create_operation(records.wl_app.id, &principal.username)
        .await?;
    state
        .queue
        .submit(Job::Archive {
            wl_app_id: records.wl_app.id,
            operation_id: operation.id,
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(operation)))
}

// ============================================================================
// Ingresses and custom domains
// ============================================================================

pub async fn list_ingresses(
    State(state): State<AppState>,
    Path((code, module, env)): EnvPath,
) -> ApiResult<impl IntoResponse> {
    let records = state.env(&code, &module, &env)?;
    let ingresses = state.engine.ingress.list(records.wl_app.id).await?;
    Ok(Json(json!({
        "ingresses": ingresses,
        "accessible_urls": state.engine.ingress.accessible_urls(records.wl_app.id),
    })))
}

pub async fn sync_ingresses(
    State(state): State<AppState>,
    Path((code, module, env)): EnvPath,
) -> ApiResult<impl IntoResponse> {
    let records = state.env(&code, &module, &env)?;
    let report = state.engine.ingress.sync_all(records.wl_app.id).await?;
    Ok(Json(report))
}

pub async fn list_custom_domains(
    State(state): State<AppState>,
    Path((code, module, env)): EnvPath,
) -> ApiResult<impl IntoResponse> {
    let records = state.env(&code, &module, &env)?;
    let env_id = records.module_env.id;
    Ok(Json(
        state
            .engine
            .store
            .domains
            .find(|d| d.module_env_id == env_id),
    ))
}

#[derive(Debug, Deserialize)]
pub struct DomainRequest {
    pub name: String,
    #[serde(default = "root_path")]
    pub path_prefix: String,
    #[serde(default)]
    pub https_enabled: bool,
}

fn root_path() -> String {
    "/".to_string()
}

pub async fn bind_custom_domain(
    State(state): State<AppState>,
    Path((code, module, env)): EnvPath,
    Json(req): Json<DomainRequest>,
) -> ApiResult<impl IntoResponse> {
    let records = state.env(&code, &module, &env)?;
    let domain = state
        .engine
        .ingress
        .bind_custom_domain(records.module_env.id, &req.name, &req.path_prefix, req.https_enabled)
        .await?;
    state
        .engine
        .custom_domains_changed(records.module_env.id)
        .await?;
    Ok((StatusCode::CREATED, Json(domain)))
}

pub async fn unbind_custom_domain(
    State(state): State<AppState>,
    Path((code, module, env, id)): Path<(String, String, String, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    let records = state.env(&code, &module, &env)?;
    let domain = state.engine.store.domains.get(&id)?;
    if domain.module_env_id != records.module_env.id {
        return Err(EngineError::not_found(format!("domain {}", id)).into());
    }
    state.engine.ingress.unbind_custom_domain(id).await?;
    state
        .engine
        .custom_domains_changed(records.module_env.id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Credentials
// ============================================================================

/// Pull credential rows of one env, without passwords
#[derive(Debug, Serialize)]
pub struct ImageCredentialView {
    pub registry: String,
    pub username: String,
}

pub async fn list_image_credentials(
    State(state): State<AppState>,
    Path((code, module, env)): EnvPath,
) -> ApiResult<impl IntoResponse> {
    let records = state.env(&code, &module, &env)?;
    let rows: Vec<ImageCredentialView> = state
        .engine
        .store
        .image_credentials_of(records.wl_app.id)
        .into_iter()
        .map(|c| ImageCredentialView {
            registry: c.registry,
            username: c.username,
        })
        .collect();
    Ok(Json(rows))
}

#[derive(Debug, Serialize)]
pub struct UserCredentialView {
    pub name: String,
    pub username: String,
    pub description: String,
}

pub async fn list_user_credentials(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let application = state.engine.store.application_by_code(&code)?;
    let mut views: Vec<UserCredentialView> = state
        .engine
        .store
        .user_credentials
        .find(|c| c.application_id == application.id)
        .into_iter()
        .map(|c| UserCredentialView {
            name: c.name,
            username: c.username,
            description: c.description,
        })
        .collect();
    views.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Json(views))
}

#[derive(Debug, Deserialize)]
pub struct UserCredentialRequest {
    pub name: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub description: String,
}

/// Save a user credential and re-flush every released env
pub async fn upsert_user_credential(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(req): Json<UserCredentialRequest>,
) -> ApiResult<impl IntoResponse> {
    let application = state.engine.store.application_by_code(&code)?;
    let credential = state.engine.credentials.upsert_user_credential(
        &application,
        &req.name,
        &req.username,
        &req.password,
        &req.description,
    )?;
    let flushed = state
        .engine
        .pipeline
        .refresh_image_credentials(application.id)
        .await?;
    Ok(Json(json!({
        "name": credential.name,
        "username": credential.username,
        "refreshed_envs": flushed,
    })))
}

pub async fn delete_user_credential(
    State(state): State<AppState>,
    Path((code, name)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let application = state.engine.store.application_by_code(&code)?;
    state
        .engine
        .credentials
        .delete_user_credential(&application, &name)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct DefaultModuleRequest {
    pub module: String,
}

pub async fn switch_default_module(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(req): Json<DefaultModuleRequest>,
) -> ApiResult<impl IntoResponse> {
    let module = state
        .engine
        .switch_default_module(&code, &req.module)
        .await?;
    Ok(Json(json!({ "default_module": module.name })))
}
