//! Command executor and interceptor chain.

use super::{Command, CommandConfig, DynCommand, Propagation};
use crate::context::{CommandContext, CommandOutput, DrainOutcome};
use crate::engine::EngineServices;
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

/// Cross-cutting behavior wrapped around every command.
///
/// An interceptor may work before and after calling `next.run(command)`,
/// call it several times, or not at all.
#[async_trait]
pub trait CommandInterceptor: Send + Sync {
    fn name(&self) -> &str;

    async fn intercept<'a>(
        &'a self,
        command: &'a dyn DynCommand,
        next: Next<'a>,
    ) -> EngineResult<CommandOutput>;
}

/// The remainder of the chain.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    services: &'a Arc<EngineServices>,
    rest: &'a [Arc<dyn CommandInterceptor>],
}

impl<'a> Next<'a> {
    pub fn services(&self) -> &'a Arc<EngineServices> {
        self.services
    }

    pub fn run(self, command: &'a dyn DynCommand) -> BoxFuture<'a, EngineResult<CommandOutput>> {
        Box::pin(async move {
            match self.rest.split_first() {
                Some((head, rest)) => {
                    let next = Next {
                        services: self.services,
                        rest,
                    };
                    head.intercept(command, next).await
                }
                None => invoke(self.services, command).await,
            }
        })
    }
}

/// End of the chain: open a unit of work, run the command, drain, close.
async fn invoke(
    services: &Arc<EngineServices>,
    command: &dyn DynCommand,
) -> EngineResult<CommandOutput> {
    let ctx = match command.take_parked() {
        Some(ctx) => ctx,
        None => {
            let mut ctx = CommandContext::new(services.clone(), command.name());
            if let Err(e) = command.invoke(&mut ctx).await {
                ctx.abort(&e).await;
                return Err(e);
            }
            ctx
        }
    };
    finish(services, ctx).await
}

/// Continues a unit of work parked at a breakpoint, so the resumed drain
/// and commit pass the interceptors like any other command.
pub(crate) struct ResumeParked {
    ctx: Mutex<Option<CommandContext>>,
}

impl ResumeParked {
    pub(crate) fn new(ctx: CommandContext) -> Self {
        Self {
            ctx: Mutex::new(Some(ctx)),
        }
    }
}

#[async_trait]
impl DynCommand for ResumeParked {
    fn name(&self) -> &'static str {
        "resume-parked"
    }

    fn config(&self) -> CommandConfig {
        CommandConfig::default()
    }

    async fn invoke(&self, _ctx: &mut CommandContext) -> EngineResult<()> {
        Err(EngineError::Internal(
            "parked unit of work was already resumed".to_string(),
        ))
    }

    fn take_parked(&self) -> Option<CommandContext> {
        self.ctx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Drain the agenda and close, or park the context at a breakpoint.
async fn finish(
    services: &Arc<EngineServices>,
    mut ctx: CommandContext,
) -> EngineResult<CommandOutput> {
    match ctx.drain_agenda().await {
        Ok(DrainOutcome::Exhausted) => {}
        Ok(DrainOutcome::Paused { node }) => {
            let context_id = ctx.id().to_string();
            info!(context_id = %context_id, node = %node, "Unit of work parked at breakpoint");
            services.park(ctx).await;
            return Err(EngineError::Suspended { context_id, node });
        }
        Err(e) => {
            ctx.abort(&e).await;
            return Err(e);
        }
    }

    let output = ctx.take_result();
    ctx.close().await?;
    output.ok_or_else(|| EngineError::Internal("command produced no result".to_string()))
}

/// Runs commands through the interceptor chain.
#[derive(Default)]
pub struct CommandExecutor {
    interceptors: Vec<Arc<dyn CommandInterceptor>>,
}

impl CommandExecutor {
    pub fn new(interceptors: Vec<Arc<dyn CommandInterceptor>>) -> Self {
        Self { interceptors }
    }

    pub fn interceptor_names(&self) -> Vec<&str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    /// Run `command` as an outermost unit of work.
    pub async fn execute<C: Command>(
        &self,
        services: &Arc<EngineServices>,
        command: C,
    ) -> EngineResult<C::Output> {
        let output = self.execute_dyn(services, &command).await?;
        downcast::<C::Output>(output)
    }

    /// Run a type-erased command, keeping its output boxed.
    pub(crate) async fn execute_dyn(
        &self,
        services: &Arc<EngineServices>,
        command: &dyn DynCommand,
    ) -> EngineResult<CommandOutput> {
        let next = Next {
            services,
            rest: &self.interceptors,
        };
        next.run(command).await
    }

    /// Run `command` from inside another command according to its
    /// propagation policy.
    pub async fn execute_nested<C: Command>(
        &self,
        ctx: &mut CommandContext,
        command: C,
    ) -> EngineResult<C::Output> {
        match Command::config(&command).propagation {
            Propagation::Required => command.execute(ctx).await,
            Propagation::RequiresNew => {
                let services = ctx.services().clone();
                self.execute(&services, command).await
            }
        }
    }
}

fn downcast<T: Send + Sync + 'static>(output: CommandOutput) -> EngineResult<T> {
    output
        .downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| EngineError::Internal("command result has an unexpected type".to_string()))
}

impl std::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("interceptors", &self.interceptor_names())
            .finish()
    }
}
