//! Cluster selection and client construction
//!
//! Clients are built lazily per cluster and cached until the cluster record
//! changes. Api servers with a `memory://<name>` URL are served by an
//! in-process [`MemoryApiServer`] shared by every client of that name.

use std::sync::Arc;

use dashmap::DashMap;

use super::client::KubeClient;
use super::memory::MemoryApiServer;
use super::pool::HaEndpointPool;
use super::transport::{HaTransport, Transport};
use crate::crypto::CipherManager;
use crate::error::{EngineError, EngineResult};
use crate::models::{Cluster, WlApp};
use crate::store::Store;

pub const MEMORY_SCHEME: &str = "memory://";

pub struct ClusterDirectory {
    store: Arc<Store>,
    cipher: Arc<CipherManager>,
    clients: DashMap<String, KubeClient>,
    overrides: DashMap<String, Arc<dyn Transport>>,
    memory_servers: DashMap<String, Arc<MemoryApiServer>>,
    pools: DashMap<String, Arc<HaEndpointPool>>,
}

impl ClusterDirectory {
    pub fn new(store: Arc<Store>, cipher: Arc<CipherManager>) -> Self {
        Self {
            store,
            cipher,
            clients: DashMap::new(),
            overrides: DashMap::new(),
            memory_servers: DashMap::new(),
            pools: DashMap::new(),
        }
    }

    /// Cluster named by the latest config, else the region default
    pub fn resolve_cluster(&self, wl_app: &WlApp) -> EngineResult<Cluster> {
        let config = self.store.latest_config(wl_app.id)?;
        match config.cluster_name() {
            Some(name) => self
                .store
                .clusters
                .get(&name.to_string())
                .map_err(|_| EngineError::ClusterNotFound(name.to_string())),
            None => self.store.default_cluster(&wl_app.region).ok_or_else(|| {
                EngineError::ClusterNotFound(format!("no default cluster in region {}", wl_app.region))
            }),
        }
    }

    pub fn client(&self, cluster_name: &str) -> EngineResult<KubeClient> {
        if let Some(client) = self.clients.get(cluster_name) {
            return Ok(client.clone());
        }
        let cluster = self
            .store
            .clusters
            .get(&cluster_name.to_string())
            .map_err(|_| EngineError::ClusterNotFound(cluster_name.to_string()))?;
        let transport = self.transport_for(&cluster)?;
        let client = KubeClient::new(cluster.name.clone(), transport);
        self.clients.insert(cluster.name.clone(), client.clone());
        Ok(client)
    }

    /// Resolve the cluster of `wl_app` together with its client
    pub fn client_for(&self, wl_app: &WlApp) -> EngineResult<(Cluster, KubeClient)> {
        let cluster = self.resolve_cluster(wl_app)?;
        let client = self.client(&cluster.name)?;
        Ok((cluster, client))
    }

    fn transport_for(&self, cluster: &Cluster) -> EngineResult<Arc<dyn Transport>> {
        if let Some(transport) = self.overrides.get(&cluster.name) {
            return Ok(transport.clone());
        }
        if let Some(host) = cluster
            .api_servers
            .first()
            .and_then(|s| s.url.strip_prefix(MEMORY_SCHEME))
        {
            let server = self.memory_server(host.trim_end_matches('/'));
            return Ok(server);
        }

        let transport = HaTransport::from_cluster(cluster, &self.cipher)?;
        self.pools.insert(cluster.name.clone(), transport.pool());
        tracing::debug!(
            cluster = %cluster.name,
            endpoints = cluster.api_servers.len(),
            "built api server pool"
        );
        Ok(Arc::new(transport))
    }

    /// In-process api server for `name`, created on first use
    pub fn memory_server(&self, name: &str) -> Arc<MemoryApiServer> {
        self.memory_servers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryApiServer::new(name)))
            .clone()
    }

    /// Route requests for `cluster_name` through `transport`
    pub fn register_transport(&self, cluster_name: &str, transport: Arc<dyn Transport>) {
        self.overrides.insert(cluster_name.to_string(), transport);
        self.clients.remove(cluster_name);
    }

    /// Endpoint pool of an HTTPS cluster, once a client has been built
    pub fn pool(&self, cluster_name: &str) -> Option<Arc<HaEndpointPool>> {
        self.pools.get(cluster_name).map(|p| p.clone())
    }

    /// Drop the cached client after the cluster record changed
    pub fn invalidate(&self, cluster_name: &str) {
        self.clients.remove(cluster_name);
        self.pools.remove(cluster_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CipherAlgorithm;
    use crate::models::{ApiServer, AppType, Config, Environment};
    use chrono::Utc;
    use uuid::Uuid;

    fn cluster(name: &str, region: &str, is_default: bool) -> Cluster {
        serde_yaml::from_str::<Cluster>(&format!(
            "name: {}\nregion: {}\nis_default: {}\napi_servers: [{{url: 'memory://{}'}}]\n",
            name, region, is_default, name
        ))
        .unwrap()
    }

    fn setup() -> (Arc<Store>, ClusterDirectory, WlApp) {
        let store = Arc::new(Store::new());
        let cipher = Arc::new(CipherManager::new("s3cret", CipherAlgorithm::BkCrypt).unwrap());
        let now = Utc::now();
        let wl_app = store
            .wl_apps
            .insert(WlApp {
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
            })
            .unwrap();
        store
            .append_config(Config::initial(wl_app.id, "default"))
            .unwrap();
        let directory = ClusterDirectory::new(store.clone(), cipher);
        (store, directory, wl_app)
    }

    #[test]
    fn test_resolve_falls_back_to_region_default() {
        let (store, directory, wl_app) = setup();
        assert!(matches!(
            directory.resolve_cluster(&wl_app),
            Err(EngineError::ClusterNotFound(_))
        ));

        store.upsert_cluster(cluster("c1", "r1", true)).unwrap();
        store.upsert_cluster(cluster("c2", "r1", false)).unwrap();
        assert_eq!(directory.resolve_cluster(&wl_app).unwrap().name, "c1");
    }

    #[test]
    fn test_resolve_prefers_config_cluster() {
        let (store, directory, wl_app) = setup();
        store.upsert_cluster(cluster("c1", "r1", true)).unwrap();
        store.upsert_cluster(cluster("c2", "r1", false)).unwrap();

        let mut draft = store.latest_config(wl_app.id).unwrap().next_draft();
        draft.cluster = Some("c2".into());
        store.append_config(draft).unwrap();
        assert_eq!(directory.resolve_cluster(&wl_app).unwrap().name, "c2");

        let mut draft = store.latest_config(wl_app.id).unwrap().next_draft();
        draft.cluster = Some("gone".into());
        store.append_config(draft).unwrap();
        assert!(matches!(
            directory.resolve_cluster(&wl_app),
            Err(EngineError::ClusterNotFound(name)) if name == "gone"
        ));
    }

    #[test]
    fn test_memory_clusters_share_one_server() {
        let (store, directory, _) = setup();
        let mut c = cluster("c1", "r1", true);
        c.api_servers = vec![ApiServer {
            url: "memory://shared/".into(),
            overridden_hostname: None,
        }];
        store.upsert_cluster(c).unwrap();

        directory.client("c1").unwrap();
        let server = directory.memory_server("shared");
        assert_eq!(server.name(), "shared");
        assert!(directory.pool("c1").is_none());
    }
}
