//! Commands and the interceptor chain that runs them.
//!
//! Every external trigger is a [`Command`]. The [`CommandExecutor`] passes
//! it through an ordered list of [`CommandInterceptor`]s; the end of the
//! chain opens a unit of work, runs the command, drains the agenda and
//! commits.

pub mod executor;
pub mod interceptors;

pub use executor::{CommandExecutor, CommandInterceptor, Next};
pub use interceptors::{LogInterceptor, RetryInterceptor};

use crate::context::{CommandContext, CommandOutput};
use crate::error::EngineResult;
use async_trait::async_trait;

/// Context propagation for nested command execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Propagation {
    /// Run inside the caller's unit of work.
    #[default]
    Required,
    /// Open, commit and close an independent unit of work.
    RequiresNew,
}

/// Per-command execution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandConfig {
    pub propagation: Propagation,
    /// Re-run the whole command on a concurrency conflict.
    pub retry_on_conflict: bool,
}

impl CommandConfig {
    pub fn requires_new() -> Self {
        Self {
            propagation: Propagation::RequiresNew,
            ..Self::default()
        }
    }

    pub fn with_retry_on_conflict(mut self) -> Self {
        self.retry_on_conflict = true;
        self
    }
}

/// An external trigger with a typed result.
#[async_trait]
pub trait Command: Send + Sync + 'static {
    type Output: Send + Sync + 'static;

    fn name(&self) -> &'static str;

    fn config(&self) -> CommandConfig {
        CommandConfig::default()
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Self::Output>;
}

/// Type-erased command as seen by interceptors.
#[async_trait]
pub trait DynCommand: Send + Sync {
    fn name(&self) -> &'static str;

    fn config(&self) -> CommandConfig;

    /// Run the command and store its output as the context result.
    async fn invoke(&self, ctx: &mut CommandContext) -> EngineResult<()>;

    /// A unit of work to continue instead of opening a new one.
    fn take_parked(&self) -> Option<CommandContext> {
        None
    }
}

#[async_trait]
impl<C: Command> DynCommand for C {
    fn name(&self) -> &'static str {
        Command::name(self)
    }

    fn config(&self) -> CommandConfig {
        Command::config(self)
    }

    async fn invoke(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let output = self.execute(ctx).await?;
        ctx.set_result(Box::new(output) as CommandOutput);
        Ok(())
    }
}

/// A command run with an overridden configuration.
pub struct Configured<C> {
    pub inner: C,
    pub config: CommandConfig,
}

#[async_trait]
impl<C: Command> Command for Configured<C> {
    type Output = C::Output;

    fn name(&self) -> &'static str {
        Command::name(&self.inner)
    }

    fn config(&self) -> CommandConfig {
        self.config
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Self::Output> {
        self.inner.execute(ctx).await
    }
}
