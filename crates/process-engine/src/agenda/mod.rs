//! The agenda: an ordered queue of operations for one unit of work.
//!
//! Graph traversal never recurses. Each [`Operation`] runs to completion
//! and may queue more operations; the command context pops and runs them
//! until the queue is empty. [`Agenda::plan`] appends (FIFO among
//! independent steps) while [`Agenda::plan_next`] puts an operation at the
//! front so the current path reaches its wait state before any sibling
//! path advances.

pub mod debug;
pub mod guard;

pub use debug::{BreakpointHook, NodeBreakpoints};
pub use guard::GuardedOperation;

use crate::context::CommandContext;
use crate::error::EngineResult;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;

/// One atomic step of execution.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Operation name for logs.
    fn name(&self) -> &str;

    /// Graph node this operation acts on, if any. Breakpoints match on it.
    fn target(&self) -> Option<&str> {
        None
    }

    async fn run(&self, ctx: &mut CommandContext) -> EngineResult<()>;
}

/// Queue of pending operations.
#[derive(Default)]
pub struct Agenda {
    queue: VecDeque<Box<dyn Operation>>,
}

impl Agenda {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue behind everything already planned.
    pub fn plan(&mut self, operation: Box<dyn Operation>) {
        self.queue.push_back(operation);
    }

    /// Queue ahead of everything already planned.
    pub fn plan_next(&mut self, operation: Box<dyn Operation>) {
        self.queue.push_front(operation);
    }

    pub fn pop(&mut self) -> Option<Box<dyn Operation>> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Names of the queued operations, front first.
    pub fn pending(&self) -> Vec<String> {
        self.queue.iter().map(|op| op.name().to_string()).collect()
    }
}

impl fmt::Debug for Agenda {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agenda")
            .field("pending", &self.pending())
            .finish()
    }
}
