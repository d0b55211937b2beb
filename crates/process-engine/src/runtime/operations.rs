//! Graph traversal operations.
//!
//! An execution moves through the definition one operation at a time:
//! [`ContinueProcess`] enters a node and decides what it does,
//! [`TakeOutgoingFlows`] selects the flows to follow, [`TriggerExecution`]
//! wakes a waiting execution and [`EndExecution`] removes a token. Only
//! [`ContinueProcess`] reports a target node, so a breakpoint pauses once
//! per node entry.

use super::definition::{FlowNode, NodeKind, ProcessDefinition};
use super::entities::{fields, ExecutionEntity, TaskEntity};
use crate::agenda::guard::FaultHandler;
use crate::agenda::{GuardedOperation, Operation};
use crate::context::CommandContext;
use crate::entity::TypedEntity;
use crate::error::{EngineError, EngineResult};
use crate::job::manager::{
    create_async_continuation, create_external, create_timer, delete_jobs_for_execution,
    JobScope,
};
use crate::store::RecordQuery;
use async_trait::async_trait;
use chrono::Duration;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Variable set when an error boundary catches a business fault.
pub const ERROR_CODE_VARIABLE: &str = "error_code";
pub const ERROR_MESSAGE_VARIABLE: &str = "error_message";

pub(crate) async fn load_execution(
    ctx: &mut CommandContext,
    execution_id: &str,
) -> EngineResult<ExecutionEntity> {
    Ok(ctx.get::<ExecutionEntity>(execution_id).await?.clone())
}

pub(crate) fn definition_of(
    ctx: &CommandContext,
    execution: &ExecutionEntity,
) -> EngineResult<Arc<ProcessDefinition>> {
    ctx.services()
        .definitions()
        .get(&execution.definition_key, execution.definition_version)
}

/// Variables of a process instance (held by its root execution).
pub(crate) async fn process_variables(
    ctx: &mut CommandContext,
    process_instance_id: &str,
) -> EngineResult<Map<String, Value>> {
    Ok(ctx
        .get::<ExecutionEntity>(process_instance_id)
        .await?
        .variables
        .clone())
}

/// Ids of the child executions of a process instance, optionally only
/// those waiting at `node_id`.
pub(crate) async fn child_execution_ids(
    ctx: &mut CommandContext,
    process_instance_id: &str,
    waiting_at: Option<&str>,
) -> EngineResult<Vec<String>> {
    let mut query = RecordQuery::new(ExecutionEntity::TYPE)
        .eq(fields::PROCESS_INSTANCE_ID, process_instance_id);
    let cache_key = match waiting_at {
        Some(node_id) => {
            query = query
                .eq(fields::CURRENT_NODE, node_id)
                .eq(fields::IS_ACTIVE, false);
            format!("executions:{}:waiting:{}", process_instance_id, node_id)
        }
        None => format!("executions:{}", process_instance_id),
    };
    let ids = ctx
        .query_cached::<ExecutionEntity>(&cache_key, query, None)
        .await?;
    Ok(ids
        .into_iter()
        .filter(|id| id != process_instance_id)
        .collect())
}

fn scope_of(execution: &ExecutionEntity, node_id: &str) -> JobScope {
    JobScope {
        execution_id: execution.id.clone(),
        process_instance_id: execution.process_instance_id.clone(),
        element_id: node_id.to_string(),
    }
}

/// Enter a node with an execution.
pub struct ContinueProcess {
    pub execution_id: String,
    pub node_id: String,
    /// Set when running from an async continuation job.
    pub skip_async: bool,
}

impl ContinueProcess {
    pub fn new(execution_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            node_id: node_id.into(),
            skip_async: false,
        }
    }

    pub fn from_job(execution_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            skip_async: true,
            ..Self::new(execution_id, node_id)
        }
    }

    async fn enter_wait_state(
        &self,
        ctx: &mut CommandContext,
        execution: &ExecutionEntity,
        node: &FlowNode,
    ) -> EngineResult<()> {
        match &node.kind {
            NodeKind::UserTask { assignee } => {
                let mut task = TaskEntity::new(execution, &node.id, ctx.now());
                task.name = node.name.clone();
                task.assignee = assignee.clone();
                debug!(task_id = %task.id, node = %node.id, "User task created");
                ctx.insert(task)?;
            }
            NodeKind::TimerCatchEvent { duration_ms } => {
                let due = ctx.now() + Duration::milliseconds(*duration_ms as i64);
                create_timer(ctx, &scope_of(execution, &node.id), due, None)?;
            }
            NodeKind::ExternalWorkerTask { topic } => {
                create_external(ctx, &scope_of(execution, &node.id), topic)?;
            }
            _ => {}
        }
        ctx.get::<ExecutionEntity>(&self.execution_id).await?.is_active = false;
        Ok(())
    }

    async fn join(
        &self,
        ctx: &mut CommandContext,
        execution: &ExecutionEntity,
        definition: &ProcessDefinition,
    ) -> EngineResult<()> {
        let expected = definition.incoming_count(&self.node_id);
        if expected <= 1 {
            ctx.plan_next(Box::new(TakeOutgoingFlows::new(&self.execution_id, &self.node_id)));
            return Ok(());
        }

        ctx.get::<ExecutionEntity>(&self.execution_id).await?.is_active = false;
        let waiting = child_execution_ids(
            ctx,
            &execution.process_instance_id,
            Some(&self.node_id),
        )
        .await?;
        if waiting.len() < expected {
            debug!(
                node = %self.node_id,
                arrived = waiting.len(),
                expected,
                "Parallel join waiting"
            );
            return Ok(());
        }

        for id in waiting.iter().filter(|id| **id != self.execution_id) {
            ctx.delete::<ExecutionEntity>(id).await?;
        }
        ctx.get::<ExecutionEntity>(&self.execution_id).await?.is_active = true;
        debug!(node = %self.node_id, joined = waiting.len(), "Parallel join completed");
        ctx.plan_next(Box::new(TakeOutgoingFlows::new(&self.execution_id, &self.node_id)));
        Ok(())
    }
}

#[async_trait]
impl Operation for ContinueProcess {
    fn name(&self) -> &str {
        "continue-process"
    }

    fn target(&self) -> Option<&str> {
        Some(&self.node_id)
    }

    async fn run(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let execution = load_execution(ctx, &self.execution_id).await?;
        let definition = definition_of(ctx, &execution)?;
        let node = definition.node(&self.node_id)?.clone();

        {
            let stored = ctx.get::<ExecutionEntity>(&self.execution_id).await?;
            stored.current_node = Some(node.id.clone());
            stored.is_active = true;
        }

        if node.async_before && !self.skip_async {
            create_async_continuation(ctx, &scope_of(&execution, &node.id))?;
            ctx.get::<ExecutionEntity>(&self.execution_id).await?.is_active = false;
            return Ok(());
        }

        match &node.kind {
            NodeKind::StartEvent | NodeKind::ExclusiveGateway { .. } => {
                ctx.plan_next(Box::new(TakeOutgoingFlows::new(&self.execution_id, &node.id)));
            }
            NodeKind::EndEvent => {
                ctx.plan_next(Box::new(EndExecution::new(&self.execution_id, &node.id)));
            }
            NodeKind::ServiceTask {
                delegate,
                error_boundary,
            } => {
                let call = Box::new(ExecuteServiceTask {
                    execution_id: self.execution_id.clone(),
                    node_id: node.id.clone(),
                    delegate: delegate.clone(),
                });
                match error_boundary {
                    Some(boundary) => {
                        let execution_id = self.execution_id.clone();
                        let target = boundary.target.clone();
                        let handler: FaultHandler =
                            Arc::new(move |code: &str, message: &str| -> Box<dyn Operation> {
                                Box::new(ContinueAfterFault {
                                    execution_id: execution_id.clone(),
                                    target: target.clone(),
                                    code: code.to_string(),
                                    message: message.to_string(),
                                })
                            });
                        ctx.plan_next(Box::new(GuardedOperation::new(
                            call,
                            boundary.error_code.clone(),
                            handler,
                        )));
                    }
                    None => ctx.plan_next(call),
                }
            }
            NodeKind::ParallelGateway => self.join(ctx, &execution, &definition).await?,
            NodeKind::UserTask { .. }
            | NodeKind::TimerCatchEvent { .. }
            | NodeKind::ExternalWorkerTask { .. } => {
                self.enter_wait_state(ctx, &execution, &node).await?
            }
        }
        Ok(())
    }
}

/// Run a service task's delegate and leave the node.
pub struct ExecuteServiceTask {
    pub execution_id: String,
    pub node_id: String,
    pub delegate: String,
}

#[async_trait]
impl Operation for ExecuteServiceTask {
    fn name(&self) -> &str {
        "execute-service-task"
    }

    async fn run(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let delegate = ctx
            .services()
            .delegates()
            .get(&self.delegate)
            .ok_or_else(|| {
                EngineError::Validation(format!("no delegate registered as '{}'", self.delegate))
            })?;
        let execution = load_execution(ctx, &self.execution_id).await?;
        let mut variables = process_variables(ctx, &execution.process_instance_id).await?;

        delegate.execute(&mut variables).await?;

        ctx.get::<ExecutionEntity>(&execution.process_instance_id)
            .await?
            .variables = variables;
        ctx.plan_next(Box::new(TakeOutgoingFlows::new(&self.execution_id, &self.node_id)));
        Ok(())
    }
}

/// Continue at an error boundary target after a caught business fault.
pub struct ContinueAfterFault {
    pub execution_id: String,
    pub target: String,
    pub code: String,
    pub message: String,
}

#[async_trait]
impl Operation for ContinueAfterFault {
    fn name(&self) -> &str {
        "continue-after-fault"
    }

    async fn run(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let process_instance_id = load_execution(ctx, &self.execution_id)
            .await?
            .process_instance_id;
        let root = ctx.get::<ExecutionEntity>(&process_instance_id).await?;
        root.variables
            .insert(ERROR_CODE_VARIABLE.to_string(), Value::from(self.code.clone()));
        root.variables.insert(
            ERROR_MESSAGE_VARIABLE.to_string(),
            Value::from(self.message.clone()),
        );
        ctx.plan_next(Box::new(ContinueProcess::new(&self.execution_id, &self.target)));
        Ok(())
    }
}

/// Leave a node through its selected outgoing flows.
///
/// The current execution follows the first selected flow and runs next;
/// every further flow gets a new sibling execution queued behind the
/// already planned work.
pub struct TakeOutgoingFlows {
    pub execution_id: String,
    pub node_id: String,
}

impl TakeOutgoingFlows {
    pub fn new(execution_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            node_id: node_id.into(),
        }
    }

    fn select(
        &self,
        ctx: &CommandContext,
        definition: &ProcessDefinition,
        variables: &Map<String, Value>,
    ) -> EngineResult<Vec<String>> {
        let node = definition.node(&self.node_id)?;
        let flows = definition.outgoing(&self.node_id);
        let evaluator = ctx.services().evaluator().clone();
        let holds = |condition: &Option<String>| -> EngineResult<bool> {
            match condition {
                Some(expr) => evaluator.evaluate_condition(expr, variables),
                None => Ok(true),
            }
        };

        let selected: Vec<String> = match &node.kind {
            NodeKind::ParallelGateway => flows.iter().map(|f| f.target.clone()).collect(),
            NodeKind::ExclusiveGateway { default_flow } => {
                let mut chosen = None;
                for flow in flows
                    .iter()
                    .filter(|f| Some(&f.id) != default_flow.as_ref())
                {
                    if holds(&flow.condition)? {
                        chosen = Some(flow.target.clone());
                        break;
                    }
                }
                let fallback = default_flow
                    .as_ref()
                    .and_then(|id| flows.iter().find(|f| &f.id == id))
                    .map(|f| f.target.clone());
                chosen.or(fallback).into_iter().collect()
            }
            _ => {
                let mut targets = Vec::new();
                for flow in &flows {
                    if holds(&flow.condition)? {
                        targets.push(flow.target.clone());
                    }
                }
                targets
            }
        };

        if selected.is_empty() {
            return Err(EngineError::Validation(format!(
                "no outgoing flow of '{}' can be taken",
                self.node_id
            )));
        }
        Ok(selected)
    }
}

#[async_trait]
impl Operation for TakeOutgoingFlows {
    fn name(&self) -> &str {
        "take-outgoing-flows"
    }

    async fn run(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let execution = load_execution(ctx, &self.execution_id).await?;
        let definition = definition_of(ctx, &execution)?;

        if definition.outgoing(&self.node_id).is_empty() {
            ctx.plan_next(Box::new(EndExecution::new(&self.execution_id, &self.node_id)));
            return Ok(());
        }

        let variables = process_variables(ctx, &execution.process_instance_id).await?;
        let targets = self.select(ctx, &definition, &variables)?;
        let mut targets = targets.into_iter();

        if let Some(first) = targets.next() {
            ctx.plan_next(Box::new(ContinueProcess::new(&self.execution_id, first)));
        }
        for target in targets {
            let root = ctx
                .get::<ExecutionEntity>(&execution.process_instance_id)
                .await?
                .clone();
            let sibling = root.new_child(&target, ctx.now());
            let sibling_id = sibling.id.clone();
            ctx.insert(sibling)?;
            debug!(execution_id = %sibling_id, node = %target, "Concurrent execution forked");
            ctx.plan(Box::new(ContinueProcess::new(sibling_id, target)));
        }
        Ok(())
    }
}

/// Wake a waiting execution and leave its current node.
pub struct TriggerExecution {
    pub execution_id: String,
}

impl TriggerExecution {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
        }
    }
}

#[async_trait]
impl Operation for TriggerExecution {
    fn name(&self) -> &str {
        "trigger-execution"
    }

    async fn run(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let execution = ctx.get::<ExecutionEntity>(&self.execution_id).await?;
        if execution.is_suspended {
            return Err(EngineError::Validation(format!(
                "execution '{}' is suspended",
                self.execution_id
            )));
        }
        let node_id = execution.current_node.clone().ok_or_else(|| {
            EngineError::Validation(format!(
                "execution '{}' is not at a node",
                self.execution_id
            ))
        })?;
        execution.is_active = true;
        ctx.plan_next(Box::new(TakeOutgoingFlows::new(&self.execution_id, node_id)));
        Ok(())
    }
}

/// Remove a token; complete the process instance when it was the last.
pub struct EndExecution {
    pub execution_id: String,
    pub node_id: String,
}

impl EndExecution {
    pub fn new(execution_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            node_id: node_id.into(),
        }
    }
}

#[async_trait]
impl Operation for EndExecution {
    fn name(&self) -> &str {
        "end-execution"
    }

    async fn run(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let execution = load_execution(ctx, &self.execution_id).await?;
        delete_jobs_for_execution(ctx, &execution.id).await?;
        if !execution.is_process_instance() {
            ctx.delete::<ExecutionEntity>(&execution.id).await?;
        }

        let remaining = child_execution_ids(ctx, &execution.process_instance_id, None).await?;
        if !remaining.is_empty() {
            return Ok(());
        }

        let now = ctx.now();
        let root = ctx
            .get::<ExecutionEntity>(&execution.process_instance_id)
            .await?;
        root.current_node = Some(self.node_id.clone());
        root.is_active = false;
        root.ended_at = Some(now);
        info!(
            process_instance_id = %root.id,
            definition = %root.definition_key,
            end_node = %self.node_id,
            "Process instance completed"
        );
        Ok(())
    }
}
