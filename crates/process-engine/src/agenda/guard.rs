//! Business fault conversion.
//!
//! A [`GuardedOperation`] runs an inner operation and, when it fails with a
//! business fault the guard is interested in, plans a handler operation
//! next instead of aborting the unit of work. Any other error still aborts.

use super::Operation;
use crate::context::CommandContext;
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Builds the follow-up operation from the fault code and message.
pub type FaultHandler = Arc<dyn Fn(&str, &str) -> Box<dyn Operation> + Send + Sync>;

pub struct GuardedOperation {
    inner: Box<dyn Operation>,
    /// `None` catches every business fault.
    error_code: Option<String>,
    handler: FaultHandler,
}

impl GuardedOperation {
    pub fn new(inner: Box<dyn Operation>, error_code: Option<String>, handler: FaultHandler) -> Self {
        Self {
            inner,
            error_code,
            handler,
        }
    }

    fn catches(&self, code: &str) -> bool {
        self.error_code.as_deref().map_or(true, |c| c == code)
    }
}

#[async_trait]
impl Operation for GuardedOperation {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn target(&self) -> Option<&str> {
        self.inner.target()
    }

    async fn run(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        match self.inner.run(ctx).await {
            Err(EngineError::BusinessFault { code, message }) if self.catches(&code) => {
                debug!(
                    operation = %self.inner.name(),
                    code = %code,
                    "Business fault converted into follow-up operation"
                );
                ctx.plan_next((self.handler)(&code, &message));
                Ok(())
            }
            other => other,
        }
    }
}
