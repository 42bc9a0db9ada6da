//! Admin and internal endpoints: provisioning, clusters, plans, shared
//! certificates and repository quota

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::auth::Principal;
use super::error::ApiResult;
use super::state::AppState;
use crate::cluster::loader::validate_clusters;
use crate::crypto::EncryptedString;
use crate::error::EngineError;
use crate::models::{ApiServer, AppDomainSharedCert, Cluster, ClusterAuth, ResourcePlan};
use crate::provision::{provision, ProvisionRequest};
use crate::quota::{extend_quota, ExtendRequest};
use crate::scheduler::plan_usages;

pub async fn provision_application(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<ProvisionRequest>,
) -> ApiResult<impl IntoResponse> {
    principal.require_internal()?;
    let provisioned = provision(&state.engine.store, &state.engine.cipher, req)?;
    tracing::info!(app = %provisioned.code, envs = provisioned.envs.len(), "application provisioned");
    Ok((StatusCode::CREATED, Json(provisioned)))
}

// ============================================================================
// Clusters
// ============================================================================

/// Cluster as returned by the API, credentials removed
#[derive(Debug, Serialize)]
pub struct ClusterView {
    #[serde(flatten)]
    pub cluster: Cluster,
    pub has_token: bool,
}

impl From<Cluster> for ClusterView {
    fn from(mut cluster: Cluster) -> Self {
        let has_token = cluster.auth.token.is_some();
        cluster.auth = ClusterAuth {
            ca_data: cluster.auth.ca_data.take(),
            cert_data: cluster.auth.cert_data.take(),
            ..Default::default()
        };
        Self { cluster, has_token }
    }
}

#[derive(Debug, Deserialize)]
pub struct ClusterRequest {
    #[serde(flatten)]
    pub cluster: Cluster,
    /// Plain bearer token, stored encrypted
    #[serde(default)]
    pub token: Option<String>,
    /// Plain client key, stored encrypted
    #[serde(default)]
    pub client_key: Option<String>,
}

pub async fn list_clusters(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<impl IntoResponse> {
    principal.require_admin()?;
    let mut clusters: Vec<ClusterView> = state
        .engine
        .store
        .clusters
        .all()
        .into_iter()
        .map(ClusterView::from)
        .collect();
    clusters.sort_by(|a, b| a.cluster.name.cmp(&b.cluster.name));
    Ok(Json(clusters))
}

pub async fn get_cluster(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    principal.require_admin()?;
    let cluster = state
        .engine
        .store
        .clusters
        .get(&name)
        .map_err(|_| EngineError::ClusterNotFound(name))?;
    Ok(Json(ClusterView::from(cluster)))
}

pub async fn upsert_cluster(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<ClusterRequest>,
) -> ApiResult<impl IntoResponse> {
    principal.require_admin()?;
    let mut cluster = req.cluster;
    let cipher = &state.engine.cipher;
    if let Some(token) = req.token.filter(|t| !t.is_empty()) {
        cluster.auth.token = Some(EncryptedString::seal(cipher, &token)?);
    }
    if let Some(key) = req.client_key.filter(|k| !k.is_empty()) {
        cluster.auth.key_data = Some(EncryptedString::seal(cipher, &key)?);
    }
    validate_clusters(std::slice::from_ref(&cluster))
        .map_err(|e| EngineError::field("api_servers", e.to_string()))?;

    let name = cluster.name.clone();
    let saved = state.engine.store.upsert_cluster(cluster)?;
    state.engine.directory.invalidate(&name);
    tracing::info!(cluster = %name, "cluster saved");
    Ok(Json(ClusterView::from(saved)))
}

pub async fn delete_cluster(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    principal.require_admin()?;
    state
        .engine
        .store
        .clusters
        .remove(&name)
        .ok_or_else(|| EngineError::ClusterNotFound(name.clone()))?;
    state.engine.directory.invalidate(&name);
    Ok(StatusCode::NO_CONTENT)
}

const API_SERVER_SCHEMES: [&str; 3] = ["http", "https", "memory"];

fn existing_cluster(state: &AppState, name: &str) -> Result<Cluster, EngineError> {
    state
        .engine
        .store
        .clusters
        .get(&name.to_string())
        .map_err(|_| EngineError::ClusterNotFound(name.to_string()))
}

/// Add an endpoint to the cluster's pool; the pool is rebuilt on next use
pub async fn bind_api_server(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(name): Path<String>,
    Json(server): Json<ApiServer>,
) -> ApiResult<impl IntoResponse> {
    principal.require_admin()?;
    let url = reqwest::Url::parse(server.url.trim())
        .map_err(|e| EngineError::field("url", e.to_string()))?;
    if !API_SERVER_SCHEMES.contains(&url.scheme()) {
        return Err(EngineError::field("url", format!("unsupported scheme '{}'", url.scheme())).into());
    }
    let server = ApiServer {
        url: server.url.trim().trim_end_matches('/').to_string(),
        ..server
    };

    let cluster = existing_cluster(&state, &name)?;
    if cluster.api_servers.iter().any(|s| s.url == server.url) {
        return Err(EngineError::conflict(
            "API_SERVER_ALREADY_BOUND",
            format!("{} is already bound to cluster {}", server.url, name),
        )
        .into());
    }
    let saved = state
        .engine
        .store
        .clusters
        .update(&name, |c| c.api_servers.push(server.clone()))?;
    state.engine.directory.invalidate(&name);
    tracing::info!(cluster = %name, url = %server.url, "api server bound");
    Ok((StatusCode::CREATED, Json(ClusterView::from(saved))))
}

#[derive(Debug, Deserialize)]
pub struct ApiServerQuery {
    pub url: String,
}

/// Remove an endpoint; the last one of a cluster cannot be removed
pub async fn unbind_api_server(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(name): Path<String>,
    Query(query): Query<ApiServerQuery>,
) -> ApiResult<impl IntoResponse> {
    principal.require_admin()?;
    let url = query.url.trim().trim_end_matches('/');
    let cluster = existing_cluster(&state, &name)?;
    if !cluster.api_servers.iter().any(|s| s.url == url) {
        return Err(EngineError::not_found(format!("api server {} of cluster {}", url, name)).into());
    }
    if cluster.api_servers.len() == 1 {
        return Err(EngineError::field("url", "a cluster needs at least one api server").into());
    }
    let saved = state
        .engine
        .store
        .clusters
        .update(&name, |c| c.api_servers.retain(|s| s.url != url))?;
    state.engine.directory.invalidate(&name);
    tracing::info!(cluster = %name, url, "api server unbound");
    Ok(Json(ClusterView::from(saved)))
}

// ============================================================================
// Plans
// ============================================================================

pub async fn list_plans(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<impl IntoResponse> {
    principal.require_admin()?;
    let mut plans = state.engine.store.plans.all();
    plans.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Json(plans))
}

pub async fn upsert_plan(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(plan): Json<ResourcePlan>,
) -> ApiResult<impl IntoResponse> {
    principal.require_admin()?;
    if plan.name.trim().is_empty() {
        return Err(EngineError::field("name", "plan name is required").into());
    }
    if plan.max_replicas < 1 {
        return Err(EngineError::field("max_replicas", "must be at least 1").into());
    }
    Ok(Json(state.engine.store.plans.upsert(plan)?))
}

pub async fn apps_using_plan(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    principal.require_admin()?;
    Ok(Json(plan_usages(&state.engine.store, &name)))
}

// ============================================================================
// Shared certificates
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SharedCertRequest {
    pub name: String,
    pub cert_data: String,
    pub key_data: String,
    #[serde(default)]
    pub ca_data: Option<String>,
    pub auto_match_cns: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SharedCertView {
    pub name: String,
    pub auto_match_cns: Vec<String>,
}

pub async fn upsert_shared_cert(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<SharedCertRequest>,
) -> ApiResult<impl IntoResponse> {
    principal.require_admin()?;
    if req.auto_match_cns.is_empty() {
        return Err(EngineError::field("auto_match_cns", "at least one CN is required").into());
    }
    let now = Utc::now();
    let cert = state.engine.store.shared_certs.upsert(AppDomainSharedCert {
        name: req.name,
        cert_data: req.cert_data,
        key_data: EncryptedString::seal(&state.engine.cipher, &req.key_data)?,
        ca_data: req.ca_data,
        auto_match_cns: req.auto_match_cns,
        tenant_id: "default".to_string(),
        created: now,
        updated: now,
    })?;
    Ok(Json(SharedCertView {
        name: cert.name,
        auto_match_cns: cert.auto_match_cns,
    }))
}

// ============================================================================
// Repository quota
// ============================================================================

pub async fn get_quota(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(repo): Path<String>,
) -> ApiResult<impl IntoResponse> {
    principal.require_admin()?;
    Ok(Json(state.engine.quota.get(&repo).await?))
}

pub async fn extend_repository_quota(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<ExtendRequest>,
) -> ApiResult<impl IntoResponse> {
    principal.require_admin()?;
    let quota = extend_quota(
        state.engine.quota.as_ref(),
        &req.repo,
        req.extra_bytes,
        req.max_allowed_bytes,
        req.required_usage_rate,
    )
    .await?;
    Ok(Json(quota))
}
