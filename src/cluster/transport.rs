//! Request transports for the cluster client
//!
//! [`HaTransport`] speaks HTTPS to real api servers through an
//! [`HaEndpointPool`]; the in-process server in `memory` implements the same
//! trait for `memory://` clusters.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Url};

use super::client::KubeError;
use super::pool::{Endpoint, HaEndpointPool, PoolError};
use crate::crypto::CipherManager;
use crate::models::Cluster;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn is_write(&self) -> bool {
        !matches!(self, Method::Get)
    }
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    pub fn body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

/// Sends raw api requests to one cluster
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, KubeError>;
}

/// Endpoint-level server errors that trigger failover
fn is_endpoint_failure(status: u16) -> bool {
    matches!(status, 502..=504)
}

struct PooledEndpoint {
    client: Client,
    /// Base URL to send to, rewritten to `assert_hostname` when set
    base: String,
}

/// HTTPS transport over an endpoint pool with failover
pub struct HaTransport {
    pool: Arc<HaEndpointPool>,
    clients: Vec<PooledEndpoint>,
    token: Option<String>,
}

impl HaTransport {
    /// Build clients for every api server of `cluster`
    pub fn from_cluster(cluster: &Cluster, cipher: &CipherManager) -> Result<Self, KubeError> {
        let endpoints = cluster
            .api_servers
            .iter()
            .map(|s| {
                Endpoint::new(
                    s.url.clone(),
                    s.overridden_hostname
                        .clone()
                        .or_else(|| cluster.assert_hostname.clone()),
                )
            })
            .collect();
        let pool = Arc::new(HaEndpointPool::new(cluster.name.clone(), endpoints));

        let token = cluster
            .auth
            .token
            .as_ref()
            .map(|t| t.reveal(cipher))
            .transpose()
            .map_err(|e| KubeError::Unknown(format!("cluster token: {}", e)))?;
        let identity_pem = match (&cluster.auth.cert_data, &cluster.auth.key_data) {
            (Some(cert), Some(key)) => {
                let key = key
                    .reveal(cipher)
                    .map_err(|e| KubeError::Unknown(format!("cluster client key: {}", e)))?;
                Some(format!("{}\n{}", cert, key))
            }
            _ => None,
        };

        let mut clients = Vec::with_capacity(pool.endpoints().len());
        for endpoint in pool.endpoints() {
            let mut builder = Client::builder()
                .connect_timeout(cluster.connect_timeout())
                .timeout(cluster.read_timeout());

            if let Some(ca) = &cluster.auth.ca_data {
                let cert = reqwest::Certificate::from_pem(ca.as_bytes())
                    .map_err(|e| KubeError::Unknown(format!("cluster ca: {}", e)))?;
                builder = builder.add_root_certificate(cert);
            }
            if let Some(pem) = &identity_pem {
                let identity = reqwest::Identity::from_pem(pem.as_bytes())
                    .map_err(|e| KubeError::Unknown(format!("cluster identity: {}", e)))?;
                builder = builder.identity(identity);
            }

            let mut base = endpoint.url.clone();
            if let Some(hostname) = &endpoint.assert_hostname {
                if let Some((rewritten, addr)) = pin_hostname(&endpoint.url, hostname) {
                    builder = builder.resolve(hostname, addr);
                    base = rewritten;
                }
            }

            let client = builder
                .build()
                .map_err(|e| KubeError::Unknown(format!("http client: {}", e)))?;
            clients.push(PooledEndpoint { client, base });
        }

        Ok(Self {
            pool,
            clients,
            token,
        })
    }

    pub fn pool(&self) -> Arc<HaEndpointPool> {
        self.pool.clone()
    }
}

/// Rewrite an IP-addressed URL to `hostname`, returning the address to pin
fn pin_hostname(url: &str, hostname: &str) -> Option<(String, SocketAddr)> {
    let mut parsed = Url::parse(url).ok()?;
    let ip: IpAddr = parsed.host_str()?.trim_matches(['[', ']']).parse().ok()?;
    let port = parsed.port_or_known_default()?;
    parsed.set_host(Some(hostname)).ok()?;
    Some((
        parsed.as_str().trim_end_matches('/').to_string(),
        SocketAddr::new(ip, port),
    ))
}

#[async_trait]
impl Transport for HaTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, KubeError> {
        let candidates = self.pool.candidates()?;

        for index in candidates {
            let endpoint = &self.clients[index];
            let url = format!("{}{}", endpoint.base, request.path);
            let mut builder = match request.method {
                Method::Get => endpoint.client.get(&url),
                Method::Post => endpoint.client.post(&url),
                Method::Put => endpoint.client.put(&url),
                Method::Patch => endpoint.client.patch(&url),
                Method::Delete => endpoint.client.delete(&url),
            };
            if !request.query.is_empty() {
                builder = builder.query(&request.query);
            }
            if let Some(token) = &self.token {
                builder = builder.bearer_auth(token);
            }
            if let Some(body) = &request.body {
                let content_type = if request.method == Method::Patch {
                    "application/merge-patch+json"
                } else {
                    "application/json"
                };
                builder = builder
                    .header(reqwest::header::CONTENT_TYPE, content_type)
                    .body(body.to_string());
            }

            match builder.send().await {
                Ok(response) if is_endpoint_failure(response.status().as_u16()) => {
                    tracing::debug!(
                        url = %url,
                        status = response.status().as_u16(),
                        "endpoint-level failure, failing over"
                    );
                    self.pool.mark_unhealthy(index);
                }
                Ok(response) => {
                    self.pool.mark_healthy(index);
                    let status = response.status().as_u16();
                    let body = response
                        .text()
                        .await
                        .map_err(|e| KubeError::Transient(e.to_string()))?;
                    return Ok(ApiResponse { status, body });
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    tracing::debug!(url = %url, error = %e, "api server unreachable, failing over");
                    self.pool.mark_unhealthy(index);
                }
                Err(e) => return Err(KubeError::Transient(e.to_string())),
            }
        }

        Err(KubeError::Pool(PoolError::AllEndpointsDown(
            self.pool.cluster().to_string(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_hostname() {
        let (base, addr) = pin_hostname("https://10.0.0.1:6443", "kubernetes").unwrap();
        assert_eq!(base, "https://kubernetes:6443");
        assert_eq!(addr, "10.0.0.1:6443".parse().unwrap());
    }

    #[test]
    fn test_pin_hostname_skips_named_hosts() {
        assert!(pin_hostname("https://api.example.com:6443", "kubernetes").is_none());
    }

    #[test]
    fn test_endpoint_failure_statuses() {
        assert!(is_endpoint_failure(502));
        assert!(is_endpoint_failure(504));
        assert!(!is_endpoint_failure(500));
        assert!(!is_endpoint_failure(404));
    }
}
