//! Built-in interceptors.

use super::{CommandInterceptor, DynCommand, Next};
use crate::context::CommandOutput;
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Logs one event per command with its duration and outcome.
#[derive(Debug, Default)]
pub struct LogInterceptor;

#[async_trait]
impl CommandInterceptor for LogInterceptor {
    fn name(&self) -> &str {
        "log"
    }

    async fn intercept<'a>(
        &'a self,
        command: &'a dyn DynCommand,
        next: Next<'a>,
    ) -> EngineResult<CommandOutput> {
        let started = Instant::now();
        let result = next.run(command).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => debug!(command = %command.name(), elapsed_ms, "Command completed"),
            Err(EngineError::Suspended { node, .. }) => {
                debug!(command = %command.name(), elapsed_ms, node = %node, "Command suspended")
            }
            Err(e) if e.is_concurrency_conflict() || e.is_business_fault() => {
                debug!(command = %command.name(), elapsed_ms, error = %e, "Command failed")
            }
            Err(e) => warn!(command = %command.name(), elapsed_ms, error = %e, "Command failed"),
        }
        result
    }
}

/// Re-runs commands that opted in whenever they hit a concurrency conflict.
///
/// Each attempt is a fresh unit of work, so the retried command re-reads
/// everything from the store. The wait grows linearly with the attempt.
#[derive(Debug, Clone)]
pub struct RetryInterceptor {
    attempts: u32,
    wait: Duration,
}

impl RetryInterceptor {
    pub fn new(attempts: u32, wait: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            wait,
        }
    }
}

#[async_trait]
impl CommandInterceptor for RetryInterceptor {
    fn name(&self) -> &str {
        "retry"
    }

    async fn intercept<'a>(
        &'a self,
        command: &'a dyn DynCommand,
        next: Next<'a>,
    ) -> EngineResult<CommandOutput> {
        if !command.config().retry_on_conflict {
            return next.run(command).await;
        }

        let mut attempt = 1;
        loop {
            match next.run(command).await {
                Err(e) if e.is_concurrency_conflict() && attempt < self.attempts => {
                    debug!(
                        command = %command.name(),
                        attempt,
                        error = %e,
                        "Concurrency conflict, retrying command"
                    );
                    tokio::time::sleep(self.wait * attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
