//! Shared fixtures for unit tests: one provisioned app on an in-memory cluster

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::cluster::{ClusterDirectory, MemoryApiServer};
use crate::crypto::{CipherAlgorithm, CipherManager};
use crate::models::{Application, Build, Cluster, Deployment, Module, ModuleEnv, Release, WlApp};
use crate::provision::{provision, ProvisionRequest};
use crate::scheduler::ProcessScheduler;
use crate::settings::Settings;
use crate::store::Store;

pub const CLUSTER_YAML: &str = r#"
name: c1
region: r1
is_default: true
ingress_config:
  app_root_domains:
    - name: apps.example.com
  sub_path_domains:
    - name: paas.example.com
      https_enabled: true
api_servers:
  - url: memory://c1
"#;

pub struct TestEnv {
    pub store: Arc<Store>,
    pub cipher: Arc<CipherManager>,
    pub directory: Arc<ClusterDirectory>,
    pub settings: Arc<Settings>,
    pub server: Arc<MemoryApiServer>,
    pub application: Application,
    pub module: Module,
    pub module_env: ModuleEnv,
    pub wl_app: WlApp,
}

pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.crypto.secret = "test-secret".to_string();
    settings.auth.jwt_secret = "jwt-secret".to_string();
    settings.release.poll_interval_ms = 10;
    settings.release.wait_timeout_secs = 2;
    settings
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_cluster(CLUSTER_YAML)
    }

    /// App `foo` with a default module, bound to the cluster in `cluster_yaml`
    pub fn with_cluster(cluster_yaml: &str) -> Self {
        let store = Arc::new(Store::new());
        let cipher = Arc::new(CipherManager::new("test-secret", CipherAlgorithm::BkCrypt).unwrap());
        let directory = Arc::new(ClusterDirectory::new(store.clone(), cipher.clone()));
        let cluster: Cluster = serde_yaml::from_str(cluster_yaml).unwrap();
        let server = directory.memory_server(&cluster.name);
        store.upsert_cluster(cluster).unwrap();

        let req: ProvisionRequest = serde_json::from_value(serde_json::json!({
            "code": "foo",
            "name": "Foo",
            "region": "r1",
            "secret": "app-secret",
            "modules": [{"name": "default", "is_default": true}],
        }))
        .unwrap();
        let provisioned = provision(&store, &cipher, req).unwrap();
        let stag = &provisioned.envs[0];
        let records = store.env_records(stag.wl_app_id).unwrap();

        Self {
            store,
            cipher,
            directory,
            settings: Arc::new(test_settings()),
            server,
            application: records.application,
            module: records.module,
            module_env: records.module_env,
            wl_app: records.wl_app,
        }
    }

    pub fn scheduler(&self) -> ProcessScheduler {
        ProcessScheduler::new(
            self.store.clone(),
            self.directory.clone(),
            self.cipher.clone(),
            self.settings.clone(),
        )
    }

    /// Persist a build and a successful release for the stag env
    pub fn release(&self, procfile: &[(&str, &str)], image: &str) -> Release {
        let procfile: BTreeMap<String, String> = procfile
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let build = self
            .store
            .builds
            .insert(Build::synthetic(
                self.wl_app.id,
                image,
                procfile.clone(),
                "tester",
                "default",
            ))
            .unwrap();
        let config = self.store.latest_config(self.wl_app.id).unwrap();
        let now = Utc::now();
        self.store
            .releases
            .insert(Release {
                id: Uuid::new_v4(),
                wl_app_id: self.wl_app.id,
                version: self.store.next_release_version(self.wl_app.id),
                build_id: build.id,
                config_id: config.id,
                procfile,
                summary: String::new(),
                failed: false,
                failure_reason: None,
                operator: "tester".into(),
                tenant_id: "default".into(),
                created: now,
                updated: now,
            })
            .unwrap()
    }

    /// Record an in-flight deployment on the stag env
    pub fn start_deployment(&self) -> Deployment {
        self.store
            .deployments
            .insert(Deployment::new(
                self.module_env.id,
                self.wl_app.id,
                "tester",
                "default",
            ))
            .unwrap()
    }
}
