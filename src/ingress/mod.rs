//! Ingress synchronizer
//!
//! Materializes the routes of one environment: built-in subdomains or
//! subpaths (whichever the cluster exposes) and user-bound custom domains.
//! Every sync reads the desired set from the store, lists live Ingresses
//! with the env's owner labels and applies the difference. Unchanged
//! objects are recognised by their desired-hash annotation and not written.

pub mod naming;
pub mod plugins;
pub mod render;
pub mod tls;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use k8s_openapi::api::networking::v1::Ingress;
use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

pub use plugins::{IngressPlugin, PluginChain, PluginContext};
pub use render::{rewrite_path, Backend, DesiredRoute, IngressKind, RouteOptions};

use crate::cluster::resources::{KubeResource, ListParams};
use crate::cluster::{apply_with_retry, ClusterDirectory, KubeClient, RetryPolicy};
use crate::crypto::CipherManager;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    AppDomain, AppSubpath, Cluster, Domain, DomainSource, ExposedUrlType, MapperVersion, WlApp,
};
use crate::scheduler::mapper::any_generation_selector;
use crate::scheduler::resolve_for_env;
use crate::store::{EnvRecords, Store};
use render::{render_ingress, DESIRED_HASH_ANNOTATION, LABEL_INGRESS_KIND};

/// Process type routes point at when it exists
pub const WEB_PROCESS: &str = "web";

/// Writes one sync made
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: usize,
}

impl SyncReport {
    pub fn writes(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    fn merge(&mut self, other: SyncReport) {
        self.created.extend(other.created);
        self.updated.extend(other.updated);
        self.deleted.extend(other.deleted);
        self.unchanged += other.unchanged;
    }
}

/// Summary of a live Ingress
#[derive(Debug, Clone, Serialize)]
pub struct IngressInfo {
    pub name: String,
    pub kind: String,
    pub host: String,
    pub paths: Vec<String>,
    pub tls_secret: Option<String>,
}

fn host_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?\.)+[a-z]{2,63}$")
            .expect("valid host pattern")
    })
}

pub fn validate_host(host: &str) -> EngineResult<()> {
    if host.len() > 253 || !host_pattern().is_match(host) {
        return Err(EngineError::field(
            "domain_name",
            format!("'{}' is not a valid host name", host),
        ));
    }
    Ok(())
}

fn ingress_info(ingress: &Ingress) -> IngressInfo {
    let rule = ingress
        .spec
        .as_ref()
        .and_then(|s| s.rules.as_ref())
        .and_then(|r| r.first());
    IngressInfo {
        name: ingress.name().to_string(),
        kind: ingress
            .labels()
            .get(LABEL_INGRESS_KIND)
            .cloned()
            .unwrap_or_default(),
        host: rule.and_then(|r| r.host.clone()).unwrap_or_default(),
        paths: rule
            .and_then(|r| r.http.as_ref())
            .map(|h| h.paths.iter().filter_map(|p| p.path.clone()).collect())
            .unwrap_or_default(),
        tls_secret: ingress
            .spec
            .as_ref()
            .and_then(|s| s.tls.as_ref())
            .and_then(|t| t.first())
            .and_then(|t| t.secret_name.clone()),
    }
}

/// Everything one sync needs about the env, fetched once
struct RouteTarget {
    records: EnvRecords,
    cluster: Cluster,
    client: KubeClient,
    mapper: MapperVersion,
    backend: Option<Backend>,
}

pub struct IngressSynchronizer {
    store: Arc<Store>,
    directory: Arc<ClusterDirectory>,
    cipher: Arc<CipherManager>,
    plugins: PluginChain,
    options: RouteOptions,
}

impl IngressSynchronizer {
    pub fn new(
        store: Arc<Store>,
        directory: Arc<ClusterDirectory>,
        cipher: Arc<CipherManager>,
        plugins: PluginChain,
    ) -> Self {
        Self {
            store,
            directory,
            cipher,
            plugins,
            options: RouteOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RouteOptions) -> Self {
        self.options = options;
        self
    }

    fn target(&self, wl_app_id: Uuid) -> EngineResult<RouteTarget> {
        let records = self.store.env_records(wl_app_id)?;
        let (cluster, client) = self.directory.client_for(&records.wl_app)?;
        let mapper = self.store.latest_config(wl_app_id)?.mapper_version();
        let backend = self.backend(&records, mapper);
        Ok(RouteTarget {
            records,
            cluster,
            client,
            mapper,
            backend,
        })
    }

    /// Service routes point at: the `web` process, else the first declared one
    fn backend(&self, records: &EnvRecords, mapper: MapperVersion) -> Option<Backend> {
        let specs = self.store.process_specs_of(records.module.id);
        let spec = specs
            .iter()
            .find(|s| s.name == WEB_PROCESS)
            .or_else(|| specs.first())?;
        let process = resolve_for_env(&self.store, spec, records.wl_app.environment);
        Some(Backend {
            service: mapper.service_name(&records.wl_app, &process.name),
            port: process.port,
        })
    }

    fn labels(&self, target: &RouteTarget, kind: IngressKind) -> BTreeMap<String, String> {
        let mut labels = target.mapper.owner_labels(&target.records.wl_app);
        labels.insert(LABEL_INGRESS_KIND.to_string(), kind.as_str().to_string());
        labels
    }

    fn env_prefix(&self, target: &RouteTarget) -> String {
        naming::env_prefix(
            &target.records.application,
            &target.records.module,
            target.records.wl_app.environment,
        )
    }

    /// Secret name for `host`, materializing the matching shared cert
    async fn tls_for(
        &self,
        target: &RouteTarget,
        host: &str,
        required: bool,
    ) -> EngineResult<Option<String>> {
        let certs = self.store.shared_certs.all();
        let Some(cert) = tls::pick_cert(&certs, host) else {
            if required {
                tracing::warn!(host, "https requested but no shared cert matches, serving plain http");
            }
            return Ok(None);
        };
        let wl_app = &target.records.wl_app;
        let namespace = wl_app.namespace();
        let secret = tls::tls_secret(
            cert,
            &namespace,
            target.mapper.owner_labels(wl_app),
            &self.cipher,
        )?;
        let client = &target.client;
        apply_with_retry(client, wl_app, &RetryPolicy::default(), "tls secret", || {
            tls::ensure_secret(client, &namespace, &secret)
        })
        .await?;
        Ok(Some(cert.secret_name()))
    }

    /// Bring live Ingresses of `kind` in line with `routes`
    ///
    /// Desired objects are written before leftovers are deleted.
    async fn reconcile(
        &self,
        target: &RouteTarget,
        kind: IngressKind,
        routes: Vec<DesiredRoute>,
    ) -> EngineResult<SyncReport> {
        let wl_app = &target.records.wl_app;
        let namespace = wl_app.namespace();
        let client = &target.client;
        let selector = any_generation_selector(wl_app).with(LABEL_INGRESS_KIND, kind.as_str());
        let live: BTreeMap<String, Ingress> = client
            .list::<Ingress>(&namespace, &ListParams::labels(selector))
            .await?
            .into_iter()
            .map(|i| (i.name().to_string(), i))
            .collect();

        let mut report = SyncReport::default();
        let desired: Vec<Ingress> = match &target.backend {
            Some(backend) => routes
                .iter()
                .map(|route| {
                    render_ingress(
                        wl_app,
                        route,
                        self.labels(target, kind),
                        backend,
                        self.options,
                        &self.plugins,
                    )
                })
                .collect(),
            None => Vec::new(),
        };
        let wanted: BTreeSet<String> = desired.iter().map(|i| i.name().to_string()).collect();

        let policy = RetryPolicy::default();
        for ingress in &desired {
            let name = ingress.name().to_string();
            match live.get(&name) {
                Some(current)
                    if current.annotation(DESIRED_HASH_ANNOTATION)
                        == ingress.annotation(DESIRED_HASH_ANNOTATION) =>
                {
                    report.unchanged += 1;
                }
                current => {
                    apply_with_retry(client, wl_app, &policy, "ingress", || {
                        client.create_or_replace(&namespace, ingress)
                    })
                    .await?;
                    if current.is_some() {
                        report.updated.push(name);
                    } else {
                        report.created.push(name);
                    }
                }
            }
        }

        for name in live.keys().filter(|n| !wanted.contains(*n)) {
            client.delete::<Ingress>(&namespace, name).await?;
            report.deleted.push(name.clone());
        }

        if report.writes() > 0 {
            tracing::info!(
                wl_app = %wl_app.name,
                kind = kind.as_str(),
                created = report.created.len(),
                updated = report.updated.len(),
                deleted = report.deleted.len(),
                "synced ingresses"
            );
        }
        Ok(report)
    }

    /// Replace the built-in domain rows of the env
    fn record_domains(&self, wl_app: &WlApp, hosts: &[(String, bool)], path_prefix: &str) -> EngineResult<()> {
        self.store
            .app_domains
            .remove_where(|d| d.wl_app_id == wl_app.id && d.source == DomainSource::BuiltIn);
        let now = Utc::now();
        for (host, https_enabled) in hosts {
            self.store.app_domains.insert(AppDomain {
                id: Uuid::new_v4(),
                wl_app_id: wl_app.id,
                host: host.clone(),
                path_prefix: path_prefix.to_string(),
                source: DomainSource::BuiltIn,
                https_enabled: *https_enabled,
                tenant_id: wl_app.tenant_id.clone(),
                created: now,
                updated: now,
            })?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn sync_subdomains(&self, wl_app_id: Uuid) -> EngineResult<SyncReport> {
        let target = self.target(wl_app_id)?;
        let wl_app = &target.records.wl_app;
        let hosts = if target.cluster.exposed_url_type == ExposedUrlType::Subdomain {
            let hosts = naming::subdomain_hosts(&target.cluster, &self.env_prefix(&target));
            self.record_domains(wl_app, &hosts, "/")?;
            hosts
        } else {
            Vec::new()
        };

        let mut routes = Vec::with_capacity(hosts.len());
        for (host, https) in &hosts {
            routes.push(DesiredRoute {
                name: naming::subdomain_ingress_name(wl_app, host),
                host: host.clone(),
                paths: vec!["/".to_string()],
                tls_secret: self.tls_for(&target, host, *https).await?,
            });
        }
        self.reconcile(&target, IngressKind::Subdomain, routes).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn sync_subpaths(&self, wl_app_id: Uuid) -> EngineResult<SyncReport> {
        let target = self.target(wl_app_id)?;
        let wl_app = &target.records.wl_app;
        let cluster = &target.cluster;

        self.store
            .app_subpaths
            .remove_where(|s| s.wl_app_id == wl_app.id && s.source == DomainSource::BuiltIn);
        let mut subpaths = Vec::new();
        if cluster.exposed_url_type == ExposedUrlType::Subpath {
            let now = Utc::now();
            self.store.app_subpaths.insert(AppSubpath {
                id: Uuid::new_v4(),
                wl_app_id: wl_app.id,
                cluster_name: cluster.name.clone(),
                subpath: naming::sub_path(&self.env_prefix(&target)),
                source: DomainSource::BuiltIn,
                tenant_id: wl_app.tenant_id.clone(),
                created: now,
                updated: now,
            })?;
            subpaths = self
                .store
                .app_subpaths
                .find(|s| s.wl_app_id == wl_app.id && s.cluster_name == cluster.name)
                .into_iter()
                .map(|s| s.subpath)
                .collect();
            subpaths.sort();
        }

        let hosts: Vec<(String, bool)> = if subpaths.is_empty() {
            Vec::new()
        } else {
            cluster
                .ingress_config
                .sub_path_domains
                .iter()
                .map(|d| (d.name.clone(), d.https_enabled))
                .collect()
        };
        if let Some(first) = subpaths.first() {
            self.record_domains(wl_app, &hosts, first)?;
        }

        let mut routes = Vec::with_capacity(hosts.len());
        for (host, https) in &hosts {
            routes.push(DesiredRoute {
                name: naming::subpath_ingress_name(wl_app, host),
                host: host.clone(),
                paths: subpaths.clone(),
                tls_secret: self.tls_for(&target, host, *https).await?,
            });
        }
        self.reconcile(&target, IngressKind::Subpath, routes).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn sync_custom_domains(&self, wl_app_id: Uuid) -> EngineResult<SyncReport> {
        let target = self.target(wl_app_id)?;
        let wl_app = &target.records.wl_app;
        let mut domains = self.store.domains.find(|d| d.wl_app_id == wl_app.id);
        domains.sort_by(|a, b| (&a.name, &a.path_prefix).cmp(&(&b.name, &b.path_prefix)));

        let mut routes = Vec::with_capacity(domains.len());
        for domain in &domains {
            routes.push(DesiredRoute {
                name: naming::custom_ingress_name(&domain.name, &domain.path_prefix),
                host: domain.name.clone(),
                paths: vec![domain.path_prefix.clone()],
                tls_secret: self.tls_for(&target, &domain.name, domain.https_enabled).await?,
            });
        }
        self.reconcile(&target, IngressKind::Custom, routes).await
    }

    /// Refresh every route of the env
    pub async fn sync_all(&self, wl_app_id: Uuid) -> EngineResult<SyncReport> {
        let mut report = self.sync_subdomains(wl_app_id).await?;
        report.merge(self.sync_subpaths(wl_app_id).await?);
        report.merge(self.sync_custom_domains(wl_app_id).await?);
        Ok(report)
    }

    pub async fn list(&self, wl_app_id: Uuid) -> EngineResult<Vec<IngressInfo>> {
        let wl_app = self.store.wl_apps.get(&wl_app_id)?;
        let (_, client) = self.directory.client_for(&wl_app)?;
        let ingresses = client
            .list::<Ingress>(
                &wl_app.namespace(),
                &ListParams::labels(any_generation_selector(&wl_app)),
            )
            .await?;
        Ok(ingresses.iter().map(ingress_info).collect())
    }

    /// Delete every Ingress owned by the env
    pub async fn delete_all(&self, wl_app_id: Uuid) -> EngineResult<usize> {
        let wl_app = self.store.wl_apps.get(&wl_app_id)?;
        let (_, client) = self.directory.client_for(&wl_app)?;
        let namespace = wl_app.namespace();
        let live = client
            .list::<Ingress>(&namespace, &ListParams::labels(any_generation_selector(&wl_app)))
            .await?;
        for ingress in &live {
            client.delete::<Ingress>(&namespace, ingress.name()).await?;
        }
        Ok(live.len())
    }

    /// URLs the env answers on, from the recorded built-in and custom domains
    pub fn accessible_urls(&self, wl_app_id: Uuid) -> Vec<String> {
        let mut urls: Vec<String> = self
            .store
            .app_domains
            .find(|d| d.wl_app_id == wl_app_id)
            .into_iter()
            .map(|d| {
                let scheme = if d.https_enabled { "https" } else { "http" };
                format!("{}://{}{}", scheme, d.host, d.path_prefix)
            })
            .chain(self.store.domains.find(|d| d.wl_app_id == wl_app_id).into_iter().map(|d| {
                let scheme = if d.https_enabled { "https" } else { "http" };
                format!("{}://{}{}", scheme, d.name, d.path_prefix)
            }))
            .collect();
        urls.sort();
        urls.dedup();
        urls
    }

    /// Bind a custom host to the env and route it
    #[tracing::instrument(skip(self))]
    pub async fn bind_custom_domain(
        &self,
        module_env_id: Uuid,
        host: &str,
        path_prefix: &str,
        https_enabled: bool,
    ) -> EngineResult<Domain> {
        let host = host.trim().to_ascii_lowercase();
        validate_host(&host)?;
        let path_prefix = Domain::normalize_path_prefix(path_prefix);
        let module_env = self.store.module_envs.get(&module_env_id)?;
        if self
            .store
            .domains
            .find_one(|d| d.name == host && d.path_prefix == path_prefix)
            .is_some()
        {
            return Err(EngineError::conflict(
                "DOMAIN_ALREADY_BOUND",
                format!("{}{} is already bound", host, path_prefix),
            ));
        }

        let now = Utc::now();
        let domain = self.store.domains.insert(Domain {
            id: Uuid::new_v4(),
            name: host,
            path_prefix,
            module_env_id,
            wl_app_id: module_env.wl_app_id,
            https_enabled,
            tenant_id: module_env.tenant_id.clone(),
            created: now,
            updated: now,
        })?;
        self.sync_custom_domains(module_env.wl_app_id).await?;
        Ok(domain)
    }

    pub async fn unbind_custom_domain(&self, domain_id: Uuid) -> EngineResult<()> {
        let domain = self
            .store
            .domains
            .remove(&domain_id)
            .ok_or_else(|| EngineError::not_found(format!("domain {}", domain_id)))?;
        self.sync_custom_domains(domain.wl_app_id).await?;
        Ok(())
    }
}
