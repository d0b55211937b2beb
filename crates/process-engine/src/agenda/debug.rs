//! Breakpoint hook consulted before every operation.

use super::Operation;
use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

/// Decides whether draining should pause before `operation` runs.
pub trait BreakpointHook: Send + Sync {
    fn should_pause(&self, operation: &dyn Operation) -> bool;
}

/// Pauses before any operation that targets one of the configured nodes.
#[derive(Debug, Default)]
pub struct NodeBreakpoints {
    nodes: RwLock<HashSet<String>>,
}

impl NodeBreakpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, node_id: impl Into<String>) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_id.into());
    }

    pub fn remove(&self, node_id: &str) -> bool {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node_id)
    }

    pub fn clear(&self) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl BreakpointHook for NodeBreakpoints {
    fn should_pause(&self, operation: &dyn Operation) -> bool {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        operation.target().is_some_and(|t| nodes.contains(t))
    }
}
