//! Cross-component reactions
//!
//! Components publish a [`DomainEvent`] at fixed points; handlers registered
//! for its kind run in registration order and are awaited before the
//! publisher continues.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::ingress::IngressSynchronizer;
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    /// The application's default module moved from `old_module_id` to `new_module_id`
    DefaultModuleSwitched {
        application_id: Uuid,
        old_module_id: Uuid,
        new_module_id: Uuid,
    },
    /// Custom domains of a cloud-native env changed
    CustomDomainUpdated { module_env_id: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DefaultModuleSwitched,
    CustomDomainUpdated,
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::DefaultModuleSwitched { .. } => EventKind::DefaultModuleSwitched,
            DomainEvent::CustomDomainUpdated { .. } => EventKind::CustomDomainUpdated,
        }
    }

    pub fn name(&self) -> &'static str {
        match self.kind() {
            EventKind::DefaultModuleSwitched => "application_default_module_switch",
            EventKind::CustomDomainUpdated => "cnative_custom_domain_updated",
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &DomainEvent) -> EngineResult<()>;
}

#[derive(Default)]
pub struct EventRegistry {
    handlers: HashMap<EventKind, Vec<Arc<dyn EventHandler>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Run every handler of the event's kind; the first error stops dispatch
    pub async fn publish(&self, event: &DomainEvent) -> EngineResult<()> {
        let Some(handlers) = self.handlers.get(&event.kind()) else {
            return Ok(());
        };
        for handler in handlers {
            tracing::debug!(event = event.name(), handler = handler.name(), "dispatching event");
            handler.handle(event).await?;
        }
        Ok(())
    }
}

/// Refreshes routes when the default module or custom domains change
pub struct IngressRefresher {
    store: Arc<Store>,
    ingress: Arc<IngressSynchronizer>,
}

impl IngressRefresher {
    pub fn new(store: Arc<Store>, ingress: Arc<IngressSynchronizer>) -> Self {
        Self { store, ingress }
    }

    /// Register for every event that affects routing
    pub fn register(self: Arc<Self>, registry: &mut EventRegistry) {
        registry.register(EventKind::DefaultModuleSwitched, self.clone());
        registry.register(EventKind::CustomDomainUpdated, self);
    }

    async fn refresh_module(&self, module_id: Uuid) -> EngineResult<()> {
        let envs = self.store.module_envs.find(|e| e.module_id == module_id);
        for env in envs {
            // Offlined envs get their routes back on the next deployment
            if env.is_offlined {
                continue;
            }
            self.ingress.sync_subdomains(env.wl_app_id).await?;
            self.ingress.sync_subpaths(env.wl_app_id).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for IngressRefresher {
    fn name(&self) -> &str {
        "ingress-refresher"
    }

    async fn handle(&self, event: &DomainEvent) -> EngineResult<()> {
        match event {
            DomainEvent::DefaultModuleSwitched {
                old_module_id,
                new_module_id,
                ..
            } => {
                self.refresh_module(*old_module_id).await?;
                self.refresh_module(*new_module_id).await
            }
            DomainEvent::CustomDomainUpdated { module_env_id } => {
                let env = self.store.module_envs.get(module_env_id)?;
                self.ingress.sync_all(env.wl_app_id).await?;
                Ok(())
            }
        }
    }
}
