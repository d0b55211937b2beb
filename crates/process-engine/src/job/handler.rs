//! Job handler trait and registry.
//!
//! The scheduler does not know what a job does; it looks the handler up by
//! the job's `handler_type` and runs it inside the job's unit of work.

use super::JobEntity;
use crate::context::CommandContext;
use crate::error::EngineResult;
use crate::runtime::jobs::{AsyncContinuationHandler, TriggerTimerHandler};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Handler type this handler is registered under.
    fn handler_type(&self) -> &str;

    /// Run the job. An error rolls back everything the handler did and is
    /// counted against the job's retries.
    async fn execute(&self, job: &JobEntity, ctx: &mut CommandContext) -> EngineResult<()>;
}

/// Handlers by type.
#[derive(Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any handler of the same type.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        let handler_type = handler.handler_type().to_string();
        tracing::debug!(handler_type = %handler_type, "Registered job handler");
        self.handlers.insert(handler_type, handler);
    }

    pub fn get(&self, handler_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(handler_type).cloned()
    }

    pub fn has(&self, handler_type: &str) -> bool {
        self.handlers.contains_key(handler_type)
    }

    pub fn list(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(|k| k.as_str()).collect();
        types.sort_unstable();
        types
    }
}

impl std::fmt::Debug for JobHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandlerRegistry")
            .field("handlers", &self.list())
            .finish()
    }
}

/// Registry with the handlers the process runtime needs.
pub fn create_default_registry() -> JobHandlerRegistry {
    let mut registry = JobHandlerRegistry::new();
    registry.register(Arc::new(AsyncContinuationHandler));
    registry.register(Arc::new(TriggerTimerHandler));
    registry
}
