//! Service task delegates.
//!
//! A delegate is the user logic behind a service task. It works on the
//! process variables and may raise [`EngineError::BusinessFault`], which an
//! error boundary on the task can catch.

use crate::error::EngineResult;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait]
pub trait ServiceDelegate: Send + Sync {
    /// Name service tasks refer to.
    fn name(&self) -> &str;

    async fn execute(&self, variables: &mut Map<String, Value>) -> EngineResult<()>;
}

/// Delegate backed by a plain function.
pub struct FnDelegate<F> {
    name: String,
    func: F,
}

impl<F> FnDelegate<F>
where
    F: Fn(&mut Map<String, Value>) -> EngineResult<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F> ServiceDelegate for FnDelegate<F>
where
    F: Fn(&mut Map<String, Value>) -> EngineResult<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, variables: &mut Map<String, Value>) -> EngineResult<()> {
        (self.func)(variables)
    }
}

/// Logs the variables it sees.
#[derive(Debug, Default)]
pub struct LogDelegate;

#[async_trait]
impl ServiceDelegate for LogDelegate {
    fn name(&self) -> &str {
        "log"
    }

    async fn execute(&self, variables: &mut Map<String, Value>) -> EngineResult<()> {
        let snapshot = serde_json::Value::Object(variables.clone());
        tracing::info!(variables = %snapshot, "Service task reached");
        Ok(())
    }
}

/// Delegates by name.
#[derive(Default)]
pub struct DelegateRegistry {
    delegates: HashMap<String, Arc<dyn ServiceDelegate>>,
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `log` delegate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LogDelegate));
        registry
    }

    pub fn register(&mut self, delegate: Arc<dyn ServiceDelegate>) {
        let name = delegate.name().to_string();
        tracing::debug!(delegate = %name, "Registered service delegate");
        self.delegates.insert(name, delegate);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ServiceDelegate>> {
        self.delegates.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.delegates.contains_key(name)
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.delegates.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for DelegateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegateRegistry")
            .field("delegates", &self.list())
            .finish()
    }
}
