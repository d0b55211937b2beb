//! A small process runtime on top of the execution core.
//!
//! Definitions are directed graphs of nodes and sequence flows. Instances
//! are moved through them by agenda operations; wait states persist the
//! instance and hand control back to the caller, async continuations and
//! timers hand it to the job scheduler.

pub mod commands;
pub mod definition;
pub mod delegate;
pub mod entities;
pub mod evaluator;
pub mod jobs;
pub mod operations;

pub use commands::{
    ActivateProcessInstance, CompleteTask, GetProcessInstance, GetVariables, ListTasks,
    SignalExecution, StartProcessInstance, SuspendProcessInstance,
};
pub use definition::{
    DefinitionRepository, ErrorBoundary, FlowNode, InMemoryDefinitionRepository, NodeKind,
    ProcessDefinition, SequenceFlow,
};
pub use delegate::{DelegateRegistry, FnDelegate, LogDelegate, ServiceDelegate};
pub use entities::{ExecutionEntity, TaskEntity};
pub use evaluator::{ExpressionEvaluator, MiniJinjaEvaluator};
pub use jobs::{AsyncContinuationHandler, TriggerTimerHandler};
