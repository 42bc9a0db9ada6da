//! Component wiring
//!
//! [`Engine`] owns one instance of every component and hands out the shared
//! handles the HTTP layer and the workers use.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use crate::cluster::{ClusterDirectory, RetryPolicy};
use crate::credentials::ImageCredentialManager;
use crate::crypto::CipherManager;
use crate::error::{EngineError, EngineResult};
use crate::events::{DomainEvent, EventRegistry, IngressRefresher};
use crate::ingress::{IngressSynchronizer, PluginChain};
use crate::models::{AppType, Cluster, Module};
use crate::pipeline::Pipeline;
use crate::quota::{backend_from_settings, QuotaBackend};
use crate::scheduler::ProcessScheduler;
use crate::settings::Settings;
use crate::store::Store;
use crate::stream::{MemoryChannels, RedisChannels, StreamHub};
use crate::tasks::{spawn_sweeper, Archiver, JobExecutor, TaskQueue, WorkerPool};

pub struct Engine {
    pub settings: Arc<Settings>,
    pub store: Arc<Store>,
    pub cipher: Arc<CipherManager>,
    pub directory: Arc<ClusterDirectory>,
    pub streams: StreamHub,
    pub scheduler: Arc<ProcessScheduler>,
    pub ingress: Arc<IngressSynchronizer>,
    pub credentials: Arc<ImageCredentialManager>,
    pub pipeline: Arc<Pipeline>,
    pub archiver: Arc<Archiver>,
    pub executor: Arc<JobExecutor>,
    pub events: Arc<EventRegistry>,
    pub quota: Arc<dyn QuotaBackend>,
}

/// Running background workers
pub struct Workers {
    pub queue: TaskQueue,
    pool: WorkerPool,
    sweeper: watch::Sender<bool>,
}

impl Workers {
    pub async fn shutdown(self) {
        let _ = self.sweeper.send(true);
        self.pool.shutdown().await;
    }
}

impl Engine {
    /// Wire every component on top of `store`, registering `clusters`
    pub fn new(settings: Settings, store: Arc<Store>, clusters: Vec<Cluster>) -> EngineResult<Self> {
        let settings = Arc::new(settings);
        let cipher = Arc::new(CipherManager::new(
            &settings.crypto.secret,
            settings.crypto.algorithm,
        )?);
        for cluster in clusters {
            store.upsert_cluster(cluster)?;
        }
        let directory = Arc::new(ClusterDirectory::new(store.clone(), cipher.clone()));

        let ttl = Duration::from_secs(settings.stream.ttl_secs);
        let streams = match &settings.redis_url {
            Some(url) => StreamHub::new(Arc::new(RedisChannels::open(url)?), store.clone(), ttl),
            None => StreamHub::new(Arc::new(MemoryChannels::default()), store.clone(), ttl),
        };

        let scheduler = Arc::new(ProcessScheduler::new(
            store.clone(),
            directory.clone(),
            cipher.clone(),
            settings.clone(),
        ));
        let ingress = Arc::new(IngressSynchronizer::new(
            store.clone(),
            directory.clone(),
            cipher.clone(),
            PluginChain::from_settings(&settings.ingress),
        ));
        let credentials = Arc::new(ImageCredentialManager::new(
            store.clone(),
            cipher.clone(),
            RetryPolicy::with_retries(settings.release.apply_retries),
        ));
        let pipeline = Arc::new(Pipeline::new(
            store.clone(),
            directory.clone(),
            settings.clone(),
            streams.clone(),
            scheduler.clone(),
            ingress.clone(),
            credentials.clone(),
        ));
        let archiver = Arc::new(Archiver::new(store.clone(), scheduler.clone(), ingress.clone()));
        let executor = Arc::new(JobExecutor::new(pipeline.clone(), archiver.clone()));

        let mut events = EventRegistry::new();
        Arc::new(IngressRefresher::new(store.clone(), ingress.clone())).register(&mut events);

        let quota = backend_from_settings(&settings.quota);

        Ok(Self {
            settings,
            store,
            cipher,
            directory,
            streams,
            scheduler,
            ingress,
            credentials,
            pipeline,
            archiver,
            executor,
            events: Arc::new(events),
            quota,
        })
    }

    /// Start the worker pool and the builder pod sweeper
    pub fn start_workers(&self) -> Workers {
        let (queue, pool) = WorkerPool::start(self.executor.clone(), self.settings.workers);
        let sweeper = spawn_sweeper(
            self.pipeline.clone(),
            Duration::from_secs(self.settings.build.sweep_interval_secs),
        );
        Workers {
            queue,
            pool,
            sweeper,
        }
    }

    /// Make `module_name` the default module of the application
    #[tracing::instrument(skip(self))]
    pub async fn switch_default_module(&self, app_code: &str, module_name: &str) -> EngineResult<Module> {
        let application = self.store.application_by_code(app_code)?;
        let target = self.store.module_by_name(application.id, module_name)?;
        let current = self.store.default_module(application.id)?;
        if current.id == target.id {
            return Ok(target);
        }

        self.store.modules.update(&current.id, |m| m.is_default = false)?;
        let updated = self.store.modules.update(&target.id, |m| m.is_default = true)?;
        tracing::info!(app = app_code, from = %current.name, to = %updated.name, "default module switched");
        self.events
            .publish(&DomainEvent::DefaultModuleSwitched {
                application_id: application.id,
                old_module_id: current.id,
                new_module_id: target.id,
            })
            .await?;
        Ok(updated)
    }

    /// Publish the custom-domain update of a cloud-native env
    pub async fn custom_domains_changed(&self, module_env_id: Uuid) -> EngineResult<()> {
        let env = self.store.module_envs.get(&module_env_id)?;
        let wl_app = self.store.wl_apps.get(&env.wl_app_id)?;
        if wl_app.app_type != AppType::CloudNative {
            return Ok(());
        }
        self.events
            .publish(&DomainEvent::CustomDomainUpdated { module_env_id })
            .await
    }

    /// Resolve `app/module/env` path segments to a module env id
    pub fn resolve_env(&self, app_code: &str, module_name: &str, env: &str) -> EngineResult<Uuid> {
        let application = self.store.application_by_code(app_code)?;
        let module = self.store.module_by_name(application.id, module_name)?;
        let environment = env
            .parse()
            .map_err(|_| EngineError::field("environment", format!("unknown environment '{}'", env)))?;
        Ok(self.store.module_env(module.id, environment)?.id)
    }
}
