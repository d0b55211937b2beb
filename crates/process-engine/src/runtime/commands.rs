//! Public commands of the process runtime.

use super::entities::{ExecutionEntity, TaskEntity};
use super::operations::{child_execution_ids, ContinueProcess, TriggerExecution};
use crate::command::Command;
use crate::context::CommandContext;
use crate::entity::TypedEntity;
use crate::error::{EngineError, EngineResult};
use crate::job::entity::fields as job_fields;
use crate::job::manager::{find_job_ids, move_job};
use crate::job::{JobBucket, JobEntity};
use crate::result_ext::OptionResultExt;
use crate::store::RecordQuery;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::info;

async fn active_process_instance<'c>(
    ctx: &'c mut CommandContext,
    process_instance_id: &str,
) -> EngineResult<&'c mut ExecutionEntity> {
    let root = ctx.get::<ExecutionEntity>(process_instance_id).await?;
    if root.is_suspended {
        return Err(EngineError::Validation(format!(
            "process instance '{}' is suspended",
            process_instance_id
        )));
    }
    if root.is_ended() {
        return Err(EngineError::Validation(format!(
            "process instance '{}' has ended",
            process_instance_id
        )));
    }
    Ok(root)
}

/// Start an instance of the latest version of a definition.
/// Returns the process instance id.
#[derive(Debug, Clone, Default)]
pub struct StartProcessInstance {
    pub definition_key: String,
    pub business_key: Option<String>,
    pub variables: Map<String, Value>,
}

impl StartProcessInstance {
    pub fn new(definition_key: impl Into<String>) -> Self {
        Self {
            definition_key: definition_key.into(),
            ..Self::default()
        }
    }

    pub fn with_business_key(mut self, business_key: impl Into<String>) -> Self {
        self.business_key = Some(business_key.into());
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl Command for StartProcessInstance {
    type Output = String;

    fn name(&self) -> &'static str {
        "start-process-instance"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<String> {
        let definition = ctx.services().definitions().latest(&self.definition_key)?;
        let start = definition.start_node()?.id.clone();

        let root = ExecutionEntity::new_process_instance(
            &definition.key,
            definition.version,
            self.business_key.clone(),
            self.variables.clone(),
            ctx.now(),
        );
        let token = root.new_child(&start, ctx.now());
        let process_instance_id = root.id.clone();
        let token_id = token.id.clone();
        ctx.insert(root)?;
        ctx.insert(token)?;

        info!(
            process_instance_id = %process_instance_id,
            definition = %definition.key,
            version = definition.version,
            "Process instance started"
        );
        ctx.plan(Box::new(ContinueProcess::new(token_id, start)));
        Ok(process_instance_id)
    }
}

/// Complete a user task and continue its execution.
#[derive(Debug, Clone)]
pub struct CompleteTask {
    pub task_id: String,
    pub variables: Map<String, Value>,
}

impl CompleteTask {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            variables: Map::new(),
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl Command for CompleteTask {
    type Output = ();

    fn name(&self) -> &'static str {
        "complete-task"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let task = ctx.get::<TaskEntity>(&self.task_id).await?.clone();
        active_process_instance(ctx, &task.process_instance_id)
            .await?
            .merge_variables(&self.variables);
        ctx.delete::<TaskEntity>(&task.id).await?;
        ctx.plan(Box::new(TriggerExecution::new(task.execution_id)));
        Ok(())
    }
}

/// Continue an execution waiting at a node, optionally setting variables.
#[derive(Debug, Clone)]
pub struct SignalExecution {
    pub execution_id: String,
    pub variables: Map<String, Value>,
}

#[async_trait]
impl Command for SignalExecution {
    type Output = ();

    fn name(&self) -> &'static str {
        "signal-execution"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let execution = ctx.get::<ExecutionEntity>(&self.execution_id).await?.clone();
        if execution.is_process_instance() || execution.is_active {
            return Err(EngineError::Validation(format!(
                "execution '{}' is not waiting",
                self.execution_id
            )));
        }
        active_process_instance(ctx, &execution.process_instance_id)
            .await?
            .merge_variables(&self.variables);
        ctx.plan(Box::new(TriggerExecution::new(&self.execution_id)));
        Ok(())
    }
}

async fn set_suspended(
    ctx: &mut CommandContext,
    process_instance_id: &str,
    suspended: bool,
) -> EngineResult<Vec<String>> {
    let mut ids = child_execution_ids(ctx, process_instance_id, None).await?;
    ids.push(process_instance_id.to_string());
    for id in &ids {
        ctx.get::<ExecutionEntity>(id).await?.is_suspended = suspended;
    }
    Ok(ids)
}

/// Suspend a process instance: its executions stop accepting triggers and
/// its pending jobs move to the suspended bucket.
#[derive(Debug, Clone)]
pub struct SuspendProcessInstance {
    pub process_instance_id: String,
}

#[async_trait]
impl Command for SuspendProcessInstance {
    type Output = usize;

    fn name(&self) -> &'static str {
        "suspend-process-instance"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<usize> {
        let pi = self.process_instance_id.as_str();
        active_process_instance(ctx, pi).await?;
        set_suspended(ctx, pi, true).await?;

        let mut moved = 0;
        for bucket in [JobBucket::Timer, JobBucket::Executable, JobBucket::ExternalWorker] {
            for job_id in find_job_ids(ctx, bucket, job_fields::PROCESS_INSTANCE_ID, pi).await? {
                move_job(ctx, bucket, &job_id, JobBucket::Suspended, move |job| {
                    job.suspended_from = Some(bucket);
                    job.unlock();
                })
                .await?;
                moved += 1;
            }
        }
        info!(process_instance_id = %pi, jobs = moved, "Process instance suspended");
        Ok(moved)
    }
}

/// Undo [`SuspendProcessInstance`].
#[derive(Debug, Clone)]
pub struct ActivateProcessInstance {
    pub process_instance_id: String,
}

#[async_trait]
impl Command for ActivateProcessInstance {
    type Output = usize;

    fn name(&self) -> &'static str {
        "activate-process-instance"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<usize> {
        let pi = self.process_instance_id.as_str();
        if !ctx.get::<ExecutionEntity>(pi).await?.is_suspended {
            return Ok(0);
        }
        set_suspended(ctx, pi, false).await?;

        let suspended =
            find_job_ids(ctx, JobBucket::Suspended, job_fields::PROCESS_INSTANCE_ID, pi).await?;
        let mut moved = 0;
        for job_id in suspended {
            let origin = ctx
                .find_as::<JobEntity>(JobBucket::Suspended.entity_type(), &job_id)
                .await?
                .and_then(|job| job.suspended_from)
                .log_none("suspended job has no origin bucket")
                .unwrap_or(JobBucket::Executable);
            move_job(ctx, JobBucket::Suspended, &job_id, origin, |job| {
                job.suspended_from = None;
            })
            .await?;
            moved += 1;
        }
        info!(process_instance_id = %pi, jobs = moved, "Process instance activated");
        Ok(moved)
    }
}

/// Variables of a process instance.
#[derive(Debug, Clone)]
pub struct GetVariables {
    pub process_instance_id: String,
}

#[async_trait]
impl Command for GetVariables {
    type Output = Map<String, Value>;

    fn name(&self) -> &'static str {
        "get-variables"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Map<String, Value>> {
        Ok(ctx
            .get::<ExecutionEntity>(&self.process_instance_id)
            .await?
            .variables
            .clone())
    }
}

/// The root execution of a process instance.
#[derive(Debug, Clone)]
pub struct GetProcessInstance {
    pub process_instance_id: String,
}

#[async_trait]
impl Command for GetProcessInstance {
    type Output = ExecutionEntity;

    fn name(&self) -> &'static str {
        "get-process-instance"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<ExecutionEntity> {
        let execution = ctx
            .get::<ExecutionEntity>(&self.process_instance_id)
            .await?
            .clone();
        if !execution.is_process_instance() {
            return Err(EngineError::NotFound(format!(
                "process instance '{}'",
                self.process_instance_id
            )));
        }
        Ok(execution)
    }
}

/// Open user tasks of a process instance, oldest first.
#[derive(Debug, Clone)]
pub struct ListTasks {
    pub process_instance_id: String,
}

#[async_trait]
impl Command for ListTasks {
    type Output = Vec<TaskEntity>;

    fn name(&self) -> &'static str {
        "list-tasks"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Vec<TaskEntity>> {
        let query = RecordQuery::new(TaskEntity::TYPE)
            .eq("process_instance_id", self.process_instance_id.as_str())
            .order_by("created_at");
        let cache_key = format!("tasks:{}", self.process_instance_id);
        let ids = ctx.query_cached::<TaskEntity>(&cache_key, query, None).await?;
        Ok(ids
            .iter()
            .filter_map(|id| ctx.cache().find::<TaskEntity>(TaskEntity::TYPE, id).cloned())
            .collect())
    }
}
