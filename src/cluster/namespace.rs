//! Workload namespace guarantee

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Namespace;

use super::client::{KubeClient, KubeError};
use super::resources::{object_meta, LABEL_APP_CODE, LABEL_ENV, LABEL_MODULE_NAME, LABEL_WL_APP};
use crate::models::WlApp;

pub fn namespace_labels(wl_app: &WlApp) -> BTreeMap<String, String> {
    [
        (LABEL_APP_CODE, wl_app.app_code.clone()),
        (LABEL_MODULE_NAME, wl_app.module_name.clone()),
        (LABEL_ENV, wl_app.environment.to_string()),
        (LABEL_WL_APP, wl_app.scheduler_safe_name()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// Create the namespace of `wl_app` if needed; concurrent callers are fine
pub async fn ensure_namespace(client: &KubeClient, wl_app: &WlApp) -> Result<(), KubeError> {
    let name = wl_app.namespace();
    if client.get_opt::<Namespace>("", &name).await?.is_some() {
        return Ok(());
    }

    let namespace = Namespace {
        metadata: object_meta(name.clone(), None, namespace_labels(wl_app)),
        ..Default::default()
    };
    match client.create("", &namespace).await {
        Ok(_) => {
            tracing::info!(cluster = %client.cluster(), namespace = %name, "created namespace");
            Ok(())
        }
        Err(KubeError::AlreadyExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::MemoryApiServer;
    use crate::models::{AppType, Environment};
    use chrono::Utc;
    use std::sync::Arc;
    use uuid::Uuid;

    fn wl_app() -> WlApp {
        let now = Utc::now();
        WlApp {
            id: Uuid::new_v4(),
            region: "r1".into(),
            name: "bkapp-my_app-stag".into(),
            app_type: AppType::Default,
            app_code: "my_app".into(),
            module_name: "default".into(),
            environment: Environment::Stag,
            tenant_id: "default".into(),
            created: now,
            updated: now,
        }
    }

    #[tokio::test]
    async fn test_ensure_namespace_is_idempotent() {
        let server = Arc::new(MemoryApiServer::new("c1"));
        let client = KubeClient::new("c1", server.clone());
        let app = wl_app();

        ensure_namespace(&client, &app).await.unwrap();
        ensure_namespace(&client, &app).await.unwrap();
        assert_eq!(server.writes(), 1);

        let ns = server.object("namespaces", "", "bkapp-my0us0app-stag").unwrap();
        assert_eq!(ns["metadata"]["labels"]["env"], "stag");
        assert_eq!(ns["metadata"]["labels"]["app_code"], "my_app");
    }
}
