//! Highly-available endpoint pool of one cluster
//!
//! Endpoints are tried in declaration order, skipping those inside their
//! unhealthy cool-down window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Default window an endpoint stays out of rotation after a failure
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("all api servers of cluster '{0}' are unhealthy")]
    AllEndpointsDown(String),

    #[error("cluster '{0}' has no api servers")]
    NoEndpoints(String),
}

#[derive(Debug)]
pub struct Endpoint {
    pub url: String,
    /// Hostname to verify the server certificate against
    pub assert_hostname: Option<String>,
    /// Milliseconds since pool creation until which the endpoint is skipped
    unhealthy_until: AtomicU64,
}

impl Endpoint {
    pub fn new(url: impl Into<String>, assert_hostname: Option<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            assert_hostname,
            unhealthy_until: AtomicU64::new(0),
        }
    }
}

#[derive(Debug)]
pub struct HaEndpointPool {
    cluster: String,
    endpoints: Vec<Endpoint>,
    cooldown: Duration,
    epoch: Instant,
}

impl HaEndpointPool {
    pub fn new(cluster: impl Into<String>, endpoints: Vec<Endpoint>) -> Self {
        Self::with_cooldown(cluster, endpoints, DEFAULT_COOLDOWN)
    }

    pub fn with_cooldown(
        cluster: impl Into<String>,
        endpoints: Vec<Endpoint>,
        cooldown: Duration,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            endpoints,
            cooldown,
            epoch: Instant::now(),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn is_healthy(&self, index: usize) -> bool {
        self.endpoints
            .get(index)
            .map(|e| e.unhealthy_until.load(Ordering::Acquire) <= self.now_ms())
            .unwrap_or(false)
    }

    pub fn mark_unhealthy(&self, index: usize) {
        if let Some(endpoint) = self.endpoints.get(index) {
            let until = self.now_ms() + self.cooldown.as_millis() as u64;
            endpoint.unhealthy_until.store(until, Ordering::Release);
            tracing::warn!(
                cluster = %self.cluster,
                endpoint = %endpoint.url,
                cooldown_secs = self.cooldown.as_secs(),
                "api server marked unhealthy"
            );
        }
    }

    pub fn mark_healthy(&self, index: usize) {
        if let Some(endpoint) = self.endpoints.get(index) {
            endpoint.unhealthy_until.store(0, Ordering::Release);
        }
    }

    /// Indexes of endpoints eligible for the next request, preferred first
    pub fn candidates(&self) -> Result<Vec<usize>, PoolError> {
        if self.endpoints.is_empty() {
            return Err(PoolError::NoEndpoints(self.cluster.clone()));
        }
        let healthy: Vec<usize> = (0..self.endpoints.len())
            .filter(|i| self.is_healthy(*i))
            .collect();
        if healthy.is_empty() {
            return Err(PoolError::AllEndpointsDown(self.cluster.clone()));
        }
        Ok(healthy)
    }
}
