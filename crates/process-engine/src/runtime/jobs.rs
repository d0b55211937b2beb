//! Job handlers of the process runtime.

use super::entities::ExecutionEntity;
use super::operations::{ContinueProcess, TriggerExecution};
use crate::context::CommandContext;
use crate::error::{EngineError, EngineResult};
use crate::job::{JobEntity, JobHandler};
use async_trait::async_trait;
use tracing::debug;

pub const ASYNC_CONTINUATION: &str = "async-continuation";
pub const TRIGGER_TIMER: &str = "trigger-timer";
/// Handler type of jobs completed by external workers, never by the scheduler.
pub const EXTERNAL_WORKER: &str = "external-worker";

fn job_scope(job: &JobEntity) -> EngineResult<(String, String)> {
    match (&job.scope_id, &job.element_id) {
        (Some(execution_id), Some(element_id)) => Ok((execution_id.clone(), element_id.clone())),
        _ => Err(EngineError::JobFailed {
            job_id: job.id.clone(),
            message: "job has no execution scope".to_string(),
        }),
    }
}

/// Continues an execution at the node it was parked at by `async_before`.
#[derive(Debug, Default)]
pub struct AsyncContinuationHandler;

#[async_trait]
impl JobHandler for AsyncContinuationHandler {
    fn handler_type(&self) -> &str {
        ASYNC_CONTINUATION
    }

    async fn execute(&self, job: &JobEntity, ctx: &mut CommandContext) -> EngineResult<()> {
        let (execution_id, node_id) = job_scope(job)?;
        ctx.get::<ExecutionEntity>(&execution_id).await?;
        ctx.plan(Box::new(ContinueProcess::from_job(execution_id, node_id)));
        Ok(())
    }
}

/// Fires a timer catch event.
#[derive(Debug, Default)]
pub struct TriggerTimerHandler;

#[async_trait]
impl JobHandler for TriggerTimerHandler {
    fn handler_type(&self) -> &str {
        TRIGGER_TIMER
    }

    async fn execute(&self, job: &JobEntity, ctx: &mut CommandContext) -> EngineResult<()> {
        let (execution_id, node_id) = job_scope(job)?;
        let waiting_here = match ctx.find::<ExecutionEntity>(&execution_id).await? {
            Some(execution) => execution.current_node.as_deref() == Some(node_id.as_str()),
            None => false,
        };
        if !waiting_here {
            debug!(job_id = %job.id, execution_id = %execution_id, "Timer fired for an execution that moved on");
            return Ok(());
        }
        ctx.plan(Box::new(TriggerExecution::new(execution_id)));
        Ok(())
    }
}
