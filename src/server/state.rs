use std::sync::Arc;

use uuid::Uuid;

use crate::engine::Engine;
use crate::error::EngineResult;
use crate::store::EnvRecords;
use crate::tasks::TaskQueue;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub queue: TaskQueue,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, queue: TaskQueue) -> Self {
        Self { engine, queue }
    }

    /// Records of the env addressed by `app/module/env` path segments
    pub fn env(&self, app_code: &str, module: &str, env: &str) -> EngineResult<EnvRecords> {
        let module_env_id: Uuid = self.engine.resolve_env(app_code, module, env)?;
        let module_env = self.engine.store.module_envs.get(&module_env_id)?;
        Ok(self.engine.store.env_records(module_env.wl_app_id)?)
    }
}
