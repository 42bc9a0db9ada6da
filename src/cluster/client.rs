//! Typed Kubernetes client over a [`Transport`]

use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use super::pool::PoolError;
use super::resources::{KubeResource, ListParams, ResourceList};
use super::transport::{ApiRequest, ApiResponse, Method, Transport};
use k8s_openapi::api::core::v1::Pod;

#[derive(Error, Debug)]
pub enum KubeError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid object: {0}")]
    Invalid(String),

    #[error("transient cluster failure: {0}")]
    Transient(String),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("namespace '{0}' does not exist")]
    NamespaceMissing(String),

    #[error("rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("unexpected response shape: {0}")]
    Decode(String),

    #[error("{0}")]
    Unknown(String),
}

impl KubeError {
    /// Worth retrying after a backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, KubeError::Transient(_))
    }
}

/// `Status` body returned by the api server on failures
#[derive(Debug, Default, Deserialize)]
struct StatusBody {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Map a non-2xx response to a [`KubeError`]
pub fn classify_response(status: u16, body: &str, what: &str) -> KubeError {
    let parsed: StatusBody = serde_json::from_str(body).unwrap_or_default();
    let message = if parsed.message.is_empty() {
        body.trim().to_string()
    } else {
        parsed.message
    };

    match status {
        404 => match missing_namespace(&message) {
            Some(ns) => KubeError::NamespaceMissing(ns),
            None => KubeError::NotFound(what.to_string()),
        },
        409 if parsed.reason == "AlreadyExists" => KubeError::AlreadyExists(message),
        409 => KubeError::Conflict(message),
        400 | 422 => KubeError::Invalid(message),
        429 | 500..=599 => KubeError::Transient(format!("status {}: {}", status, message)),
        401 | 403 | 405..=499 => KubeError::Rejected { status, message },
        _ => KubeError::Unknown(format!("status {}: {}", status, message)),
    }
}

/// Extract the namespace from `namespaces "<ns>" not found`
fn missing_namespace(message: &str) -> Option<String> {
    let rest = message.strip_prefix("namespaces \"")?;
    let (ns, tail) = rest.split_once('"')?;
    tail.contains("not found").then(|| ns.to_string())
}

fn decode<T: serde::de::DeserializeOwned>(response: &ApiResponse) -> Result<T, KubeError> {
    serde_json::from_str(&response.body).map_err(|e| KubeError::Decode(e.to_string()))
}

// ============================================================================
// SBIO: I/O boundary
// ============================================================================

#[derive(Clone)]
pub struct KubeClient {
    cluster: String,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for KubeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClient")
            .field("cluster", &self.cluster)
            .finish()
    }
}

impl KubeClient {
    pub fn new(cluster: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            cluster: cluster.into(),
            transport,
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    async fn call(&self, request: ApiRequest, what: &str) -> Result<ApiResponse, KubeError> {
        let response = self.transport.send(request).await?;
        if (200..300).contains(&response.status) {
            Ok(response)
        } else {
            Err(classify_response(response.status, &response.body, what))
        }
    }

    fn describe<K: KubeResource>(namespace: &str, name: &str) -> String {
        if K::NAMESPACED {
            format!("{} {}/{}", K::KIND, namespace, name)
        } else {
            format!("{} {}", K::KIND, name)
        }
    }

    pub async fn get<K: KubeResource>(&self, namespace: &str, name: &str) -> Result<K, KubeError> {
        let path = K::object_path(Some(namespace), name);
        let response = self
            .call(ApiRequest::new(Method::Get, path), &Self::describe::<K>(namespace, name))
            .await?;
        decode(&response)
    }

    /// Like [`get`](Self::get) but maps not-found to `None`
    pub async fn get_opt<K: KubeResource>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, KubeError> {
        match self.get(namespace, name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(KubeError::NotFound(_)) | Err(KubeError::NamespaceMissing(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn list<K: KubeResource>(
        &self,
        namespace: &str,
        params: &ListParams,
    ) -> Result<Vec<K>, KubeError> {
        let path = K::collection_path(Some(namespace));
        let request = ApiRequest::new(Method::Get, path).query(params.to_query());
        match self.call(request, K::PLURAL).await {
            Ok(response) => Ok(decode::<ResourceList<K>>(&response)?.items),
            Err(KubeError::NamespaceMissing(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub async fn create<K: KubeResource>(&self, namespace: &str, obj: &K) -> Result<K, KubeError> {
        let path = K::collection_path(Some(namespace));
        let body = serde_json::to_value(obj).map_err(|e| KubeError::Decode(e.to_string()))?;
        let response = self
            .call(
                ApiRequest::new(Method::Post, path).body(body),
                &Self::describe::<K>(namespace, obj.name()),
            )
            .await?;
        decode(&response)
    }

    pub async fn replace<K: KubeResource>(&self, namespace: &str, obj: &K) -> Result<K, KubeError> {
        let path = K::object_path(Some(namespace), obj.name());
        let body = serde_json::to_value(obj).map_err(|e| KubeError::Decode(e.to_string()))?;
        let response = self
            .call(
                ApiRequest::new(Method::Put, path).body(body),
                &Self::describe::<K>(namespace, obj.name()),
            )
            .await?;
        decode(&response)
    }

    /// Create the object, or replace it carrying over the live resourceVersion
    pub async fn create_or_replace<K: KubeResource>(
        &self,
        namespace: &str,
        obj: &K,
    ) -> Result<K, KubeError> {
        match self.get_opt::<K>(namespace, obj.name()).await? {
            None => match self.create(namespace, obj).await {
                Err(KubeError::AlreadyExists(_)) => {
                    let live: K = self.get(namespace, obj.name()).await?;
                    self.replace_over(namespace, obj, &live).await
                }
                other => other,
            },
            Some(live) => self.replace_over(namespace, obj, &live).await,
        }
    }

    async fn replace_over<K: KubeResource>(
        &self,
        namespace: &str,
        obj: &K,
        live: &K,
    ) -> Result<K, KubeError> {
        let mut desired = obj.clone();
        desired.meta_mut().resource_version = live.meta().resource_version.clone();
        self.replace(namespace, &desired).await
    }

    pub async fn patch_merge<K: KubeResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, KubeError> {
        let path = K::object_path(Some(namespace), name);
        let response = self
            .call(
                ApiRequest::new(Method::Patch, path).body(patch.clone()),
                &Self::describe::<K>(namespace, name),
            )
            .await?;
        decode(&response)
    }

    /// Delete by name; returns false when the object was already gone
    pub async fn delete<K: KubeResource>(&self, namespace: &str, name: &str) -> Result<bool, KubeError> {
        let path = K::object_path(Some(namespace), name);
        match self
            .call(ApiRequest::new(Method::Delete, path), &Self::describe::<K>(namespace, name))
            .await
        {
            Ok(_) => Ok(true),
            Err(KubeError::NotFound(_)) | Err(KubeError::NamespaceMissing(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete every object matching a label selector
    pub async fn delete_collection<K: KubeResource>(
        &self,
        namespace: &str,
        params: &ListParams,
    ) -> Result<(), KubeError> {
        let path = K::collection_path(Some(namespace));
        let request = ApiRequest::new(Method::Delete, path).query(params.to_query());
        match self.call(request, K::PLURAL).await {
            Ok(_) | Err(KubeError::NamespaceMissing(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Read logs of a pod's first container
    pub async fn read_pod_log(
        &self,
        namespace: &str,
        name: &str,
        tail_lines: Option<u32>,
    ) -> Result<String, KubeError> {
        let path = format!("{}/log", Pod::object_path(Some(namespace), name));
        let mut query = Vec::new();
        if let Some(n) = tail_lines {
            query.push(("tailLines".to_string(), n.to_string()));
        }
        let response = self
            .call(
                ApiRequest::new(Method::Get, path).query(query),
                &Self::describe::<Pod>(namespace, name),
            )
            .await?;
        Ok(response.body)
    }
}
