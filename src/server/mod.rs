//! HTTP API
//!
//! Everything except `/healthz` sits behind [`auth::require_auth`].

pub mod admin;
pub mod auth;
pub mod error;
pub mod handlers;
pub mod state;
pub mod streams;

use axum::routing::{delete, get, post, put};
use axum::{middleware, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use error::{ApiError, ApiResult, ErrorEnvelope};
pub use state::AppState;

const ENV_PREFIX: &str = "/api/apps/{code}/modules/{module}/envs/{env}";

fn env_routes() -> Router<AppState> {
    use handlers::*;
    Router::new()
        .route("/builds", post(create_build).get(list_builds))
        .route("/builds/{id}", get(get_build))
        .route("/deployments", post(create_deployment).get(list_deployments))
        .route("/deployments/{id}", get(get_deployment))
        .route("/deployments/{id}/interrupt", post(interrupt_deployment))
        .route("/releases", get(list_releases).post(create_release))
        .route("/releases/{version}", get(get_release))
        .route("/processes", get(list_processes))
        .route("/processes/scale", post(scale_process))
        .route("/processes/{proc_type}/plan", put(switch_plan))
        .route("/processes/{proc_type}/autoscaling", put(set_autoscaling))
        .route("/instances/{name}", get(get_instance))
        .route("/instances/{name}/events", get(instance_events))
        .route("/commands", post(create_command))
        .route("/commands/{id}", get(get_command))
        .route("/archive", post(archive_env))
        .route("/ingresses", get(list_ingresses))
        .route("/ingresses/sync", post(sync_ingresses))
        .route(
            "/custom-domains",
            get(list_custom_domains).post(bind_custom_domain),
        )
        .route("/custom-domains/{id}", delete(unbind_custom_domain))
        .route("/image-credentials", get(list_image_credentials))
}

fn admin_routes() -> Router<AppState> {
    use admin::*;
    Router::new()
        .route("/clusters", get(list_clusters).post(upsert_cluster))
        .route("/clusters/{name}", get(get_cluster).delete(delete_cluster))
        .route(
            "/clusters/{name}/api-servers",
            post(bind_api_server).delete(unbind_api_server),
        )
        .route("/plans", get(list_plans).post(upsert_plan))
        .route("/plans/{name}/apps", get(apps_using_plan))
        .route("/shared-certs", post(upsert_shared_cert))
        .route("/quotas/{repo}", get(get_quota))
        .route("/quotas/extend", post(extend_repository_quota))
}

/// Create the Axum router
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .nest(ENV_PREFIX, env_routes())
        .route(
            "/api/apps/{code}/credentials",
            get(handlers::list_user_credentials).post(handlers::upsert_user_credential),
        )
        .route(
            "/api/apps/{code}/credentials/{name}",
            delete(handlers::delete_user_credential),
        )
        .route(
            "/api/apps/{code}/default-module",
            put(handlers::switch_default_module),
        )
        .route("/api/provision", post(admin::provision_application))
        .route("/api/streams/{id}/history", get(streams::stream_history))
        .route("/api/streams/{id}/ws", get(streams::stream_ws))
        .nest("/api/admin", admin_routes())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/healthz", get(handlers::health))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, Workers};
    use crate::models::Cluster;
    use crate::store::Store;
    use crate::test_support::{test_settings, CLUSTER_YAML};
    use auth::{issue_token, Role, USER_HEADER};
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn create_test_app() -> (Router, Arc<Engine>, Workers) {
        let cluster: Cluster = serde_yaml::from_str(CLUSTER_YAML).unwrap();
        let engine = Arc::new(Engine::new(test_settings(), Arc::new(Store::new()), vec![cluster]).unwrap());
        let workers = engine.start_workers();
        let state = AppState::new(engine.clone(), workers.queue.clone());
        (create_router(state), engine, workers)
    }

    fn admin_token() -> String {
        issue_token("jwt-secret", Role::InternalSys, None, 300).unwrap()
    }

    fn request(method: &str, uri: &str, token: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(header::CONTENT_TYPE, "application/json");
        match body {
            Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn provision_foo(app: &Router) {
        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/provision",
                &admin_token(),
                Some(json!({
                    "code": "foo",
                    "name": "Foo",
                    "region": "r1",
                    "secret": "s",
                    "modules": [{"name": "default", "is_default": true}],
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_health_needs_no_token() {
        let (app, _, _workers) = create_test_app();
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_token_is_rejected() {
        let (app, _, _workers) = create_test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/admin/plans")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_admin_routes_need_admin_role() {
        let (app, _, _workers) = create_test_app();
        let token = issue_token("jwt-secret", Role::InternalPlatform, None, 300).unwrap();
        let mut req = request("GET", "/api/admin/clusters", &token, None);
        req.headers_mut().insert(USER_HEADER, "carol".parse().unwrap());
        let response = app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .oneshot(request("GET", "/api/admin/clusters", &admin_token(), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let clusters = json_body(response).await;
        assert_eq!(clusters[0]["name"], "c1");
        assert_eq!(clusters[0]["has_token"], false);
    }

    #[tokio::test]
    async fn test_unknown_env_is_not_found() {
        let (app, _, _workers) = create_test_app();
        provision_foo(&app).await;
        let response = app
            .oneshot(request(
                "GET",
                "/api/apps/foo/modules/default/envs/nope/processes",
                &admin_token(),
                None,
            ))
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_scale_validation_envelope() {
        let (app, _, _workers) = create_test_app();
        provision_foo(&app).await;
        let response = app
            .oneshot(request(
                "POST",
                "/api/apps/foo/modules/default/envs/stag/processes/scale",
                &admin_token(),
                Some(json!({"proc_type": "web", "replicas": -1})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["code"], "VALIDATION_ERROR");
        assert!(body["fields_detail"]["replicas"].is_array());
    }

    #[tokio::test]
    async fn test_deploy_through_api() {
        let (app, engine, workers) = create_test_app();
        provision_foo(&app).await;

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/apps/foo/modules/default/envs/stag/deployments",
                &admin_token(),
                Some(json!({
                    "source_package": "https://pkgs.example.com/foo.tgz",
                    "procfile": {"web": "gunicorn app"},
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let deployment = json_body(response).await;
        let id: uuid::Uuid = serde_json::from_value(deployment["id"].clone()).unwrap();
        assert_eq!(deployment["operator"], "admin");

        let mut finished = None;
        for _ in 0..200 {
            let current = engine.store.deployments.get(&id).unwrap();
            if current.status.is_terminal() {
                finished = Some(current);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let finished = finished.expect("deployment finished");
        assert_eq!(finished.status, crate::models::JobStatus::Successful);

        let response = app
            .oneshot(request(
                "GET",
                "/api/apps/foo/modules/default/envs/stag/releases",
                &admin_token(),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(json_body(response).await.as_array().unwrap().len(), 1);
        workers.shutdown().await;
    }

    #[tokio::test]
    async fn test_plan_admin_and_usage() {
        let (app, _, _workers) = create_test_app();
        provision_foo(&app).await;
        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/admin/plans",
                &admin_token(),
                Some(json!({
                    "name": "large",
                    "limits": {"cpu": "8000m", "memory": "4096Mi"},
                    "requests": {"cpu": "1000m", "memory": "1024Mi"},
                    "max_replicas": 10,
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(request("GET", "/api/admin/plans/large/apps", &admin_token(), None))
            .await
            .unwrap();
        assert_eq!(json_body(response).await, json!([]));
    }

    fn stag_wl_app(engine: &Engine) -> uuid::Uuid {
        let module_env_id = engine.resolve_env("foo", "default", "stag").unwrap();
        engine.store.module_envs.get(&module_env_id).unwrap().wl_app_id
    }

    #[tokio::test]
    async fn test_repeated_process_type_is_rejected() {
        let (app, engine, _workers) = create_test_app();
        provision_foo(&app).await;
        let req = Request::builder()
            .method("POST")
            .uri("/api/apps/foo/modules/default/envs/stag/deployments")
            .header(header::AUTHORIZATION, format!("Bearer {}", admin_token()))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                r#"{"image":"registry.example.com/foo:v1","procfile":{"web":"./a","web":"./b"}}"#,
            ))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["code"], "VALIDATION_ERROR");
        assert!(body["fields_detail"]["procfile"].is_array());
        assert!(engine.store.running_deployment(stag_wl_app(&engine)).is_none());
    }

    #[tokio::test]
    async fn test_builds_are_paginated_newest_first() {
        let (app, engine, _workers) = create_test_app();
        provision_foo(&app).await;
        let wl_app_id = stag_wl_app(&engine);
        for n in 1..=3 {
            engine
                .pipeline
                .start_build(
                    wl_app_id,
                    crate::pipeline::BuildRequest {
                        source_package: format!("https://pkgs.example.com/foo-{}.tgz", n),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let response = app
            .clone()
            .oneshot(request(
                "GET",
                "/api/apps/foo/modules/default/envs/stag/builds?limit=2",
                &admin_token(),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let page = json_body(response).await;
        assert_eq!(page["count"], 3);
        let generations: Vec<u64> = page["results"]
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b["generation"].as_u64().unwrap())
            .collect();
        assert_eq!(generations, vec![3, 2]);

        let response = app
            .oneshot(request(
                "GET",
                "/api/apps/foo/modules/default/envs/stag/builds?offset=2&limit=2",
                &admin_token(),
                None,
            ))
            .await
            .unwrap();
        let page = json_body(response).await;
        assert_eq!(page["results"].as_array().unwrap().len(), 1);
        assert_eq!(page["results"][0]["generation"], 1);
    }

    #[tokio::test]
    async fn test_release_of_existing_build() {
        let (app, engine, _workers) = create_test_app();
        provision_foo(&app).await;
        let wl_app_id = stag_wl_app(&engine);
        let build = engine
            .store
            .builds
            .insert(crate::models::Build::synthetic(
                wl_app_id,
                "registry.example.com/foo:v1",
                std::collections::BTreeMap::from([("web".to_string(), "./serve".to_string())]),
                "admin",
                "default",
            ))
            .unwrap();

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/apps/foo/modules/default/envs/stag/releases",
                &admin_token(),
                Some(json!({"build_id": build.id, "summary": "re-release"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let release = json_body(response).await;
        assert_eq!(release["version"], 1);
        assert_eq!(release["procfile"]["web"], "./serve");

        let response = app
            .clone()
            .oneshot(request(
                "GET",
                "/api/apps/foo/modules/default/envs/stag/releases/1",
                &admin_token(),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let fetched = json_body(response).await;
        assert_eq!(fetched["build_id"], json!(build.id));
        assert_eq!(fetched["summary"], "re-release");

        let response = app
            .clone()
            .oneshot(request(
                "GET",
                "/api/apps/foo/modules/default/envs/stag/releases/9",
                &admin_token(),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // Builds of another env are not visible here
        let response = app
            .oneshot(request(
                "POST",
                "/api/apps/foo/modules/default/envs/prod/releases",
                &admin_token(),
                Some(json!({"build_id": build.id})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_api_server_bind_and_unbind() {
        let (app, engine, _workers) = create_test_app();
        let uri = "/api/admin/clusters/c1/api-servers";

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                uri,
                &admin_token(),
                Some(json!({"url": "https://10.0.0.2:6443/"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let cluster = json_body(response).await;
        assert_eq!(cluster["api_servers"].as_array().unwrap().len(), 2);
        assert_eq!(cluster["api_servers"][1]["url"], "https://10.0.0.2:6443");

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                uri,
                &admin_token(),
                Some(json!({"url": "https://10.0.0.2:6443"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                uri,
                &admin_token(),
                Some(json!({"url": "ftp://10.0.0.3"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(request(
                "DELETE",
                &format!("{}?url=https://10.0.0.2:6443", uri),
                &admin_token(),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let servers = engine.store.clusters.get(&"c1".to_string()).unwrap().api_servers;
        assert_eq!(servers.len(), 1);

        let last = servers[0].url.clone();
        let response = app
            .oneshot(request(
                "DELETE",
                &format!("{}?url={}", uri, last),
                &admin_token(),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
