//! Classified retries for cluster writes
//!
//! A missing namespace is created once and the write repeated; conflicts are
//! repeated with the operation re-reading the live object; transient
//! failures back off exponentially with jitter. Everything else fails fast.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use super::client::{KubeClient, KubeError};
use super::namespace::ensure_namespace;
use crate::models::WlApp;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after the first one
    pub retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn with_retries(retries: u32) -> Self {
        Self {
            retries,
            ..Default::default()
        }
    }

    /// Backoff before attempt `attempt + 1`
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter_ms = rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 2);
        exp + Duration::from_millis(jitter_ms)
    }
}

pub async fn apply_with_retry<T, F, Fut>(
    client: &KubeClient,
    wl_app: &WlApp,
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, KubeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, KubeError>>,
{
    let mut attempt = 0;
    let mut namespace_ensured = false;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(KubeError::NamespaceMissing(ns)) if !namespace_ensured => {
                tracing::info!(namespace = %ns, what, "namespace missing, creating it");
                ensure_namespace(client, wl_app).await?;
                namespace_ensured = true;
                continue;
            }
            Err(KubeError::Conflict(msg)) if attempt < policy.retries => {
                tracing::debug!(what, attempt, "conflict, re-reading: {}", msg);
            }
            Err(e) if e.is_transient() && attempt < policy.retries => {
                let delay = policy.delay(attempt);
                tracing::warn!(what, attempt, delay_ms = delay.as_millis() as u64, "transient failure: {}", e);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::MemoryApiServer;
    use crate::cluster::resources::object_meta;
    use crate::cluster::transport::Method;
    use crate::models::{AppType, Environment};
    use chrono::Utc;
    use k8s_openapi::api::core::v1::ConfigMap;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use uuid::Uuid;

    fn wl_app() -> WlApp {
        let now = Utc::now();
        WlApp {
            id: Uuid::new_v4(),
            region: "r1".into(),
            name: "bkapp-foo-stag".into(),
            app_type: AppType::Default,
            app_code: "foo".into(),
            module_name: "default".into(),
            environment: Environment::Stag,
            tenant_id: "default".into(),
            created: now,
            updated: now,
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn config_map() -> ConfigMap {
        ConfigMap {
            metadata: object_meta("settings", Some("bkapp-foo-stag"), BTreeMap::new()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_missing_namespace_is_created() {
        let server = Arc::new(MemoryApiServer::new("c1"));
        let client = KubeClient::new("c1", server.clone());
        let app = wl_app();
        let cm = config_map();
        let ns = app.namespace();

        apply_with_retry(&client, &app, &fast(), "configmap", || {
            client.create_or_replace(&ns, &cm)
        })
        .await
        .unwrap();
        assert!(server.object("namespaces", "", "bkapp-foo-stag").is_some());
        assert!(server.object("configmaps", "bkapp-foo-stag", "settings").is_some());
    }

    #[tokio::test]
    async fn test_transient_budget_is_bounded() {
        let server = Arc::new(MemoryApiServer::new("c1"));
        let client = KubeClient::new("c1", server.clone());
        let app = wl_app();
        crate::cluster::ensure_namespace(&client, &app).await.unwrap();
        let cm = config_map();
        let ns = app.namespace();

        server.inject_failure(Method::Get, "configmaps", 503, 2);
        apply_with_retry(&client, &app, &fast(), "configmap", || {
            client.create_or_replace(&ns, &cm)
        })
        .await
        .unwrap();

        server.inject_failure(Method::Get, "configmaps", 503, 3);
        let err = apply_with_retry(&client, &app, &fast(), "configmap", || {
            client.create_or_replace(&ns, &cm)
        })
        .await
        .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_invalid_fails_fast() {
        let server = Arc::new(MemoryApiServer::new("c1"));
        let client = KubeClient::new("c1", server.clone());
        let app = wl_app();
        server.inject_failure(Method::Get, "configmaps", 422, 1);
        let cm = config_map();
        let ns = app.namespace();
        let err = apply_with_retry(&client, &app, &fast(), "configmap", || {
            client.create_or_replace(&ns, &cm)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, KubeError::Invalid(_)));
    }
}
