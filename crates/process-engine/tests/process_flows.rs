mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{build_engine, test_config, vars};
use process_engine::agenda::NodeBreakpoints;
use process_engine::command::{CommandInterceptor, DynCommand, Next};
use process_engine::context::CommandOutput;
use process_engine::entity::TypedEntity;
use process_engine::job::{
    CompleteExternalJob, FetchAndLockExternalJobs, JobBucket, JobEntity, JobRunOutcome, ListJobs,
};
use process_engine::runtime::{
    ActivateProcessInstance, CompleteTask, ExecutionEntity, FnDelegate, GetProcessInstance,
    GetVariables, ListTasks, ServiceDelegate, SignalExecution, StartProcessInstance,
    SuspendProcessInstance, TaskEntity,
};
use process_engine::{EngineError, EngineResult, InMemoryStore, ManualClock, ProcessEngine};
use serde_json::{json, Map, Value};
use tokio_test::assert_err;

const APPROVAL: &str = r#"
key: approval
nodes:
  - id: start
    kind: { type: start_event }
  - id: review
    kind: { type: user_task, assignee: alice }
  - id: decide
    kind: { type: exclusive_gateway, default_flow: to_rejected }
  - id: archive
    kind: { type: service_task, delegate: archive }
  - id: approved
    kind: { type: end_event }
  - id: rejected
    kind: { type: end_event }
flows:
  - { id: f1, source: start, target: review }
  - { id: f2, source: review, target: decide }
  - { id: to_archive, source: decide, target: archive, condition: "approved" }
  - { id: to_rejected, source: decide, target: rejected }
  - { id: f3, source: archive, target: approved }
"#;

const PAYMENT: &str = r#"
key: payment
nodes:
  - id: start
    kind: { type: start_event }
  - id: charge
    kind:
      type: service_task
      delegate: charge
      error_boundary: { error_code: DECLINED, target: declined }
  - id: paid
    kind: { type: end_event }
  - id: declined
    kind: { type: end_event }
flows:
  - { id: f1, source: start, target: charge }
  - { id: f2, source: charge, target: paid }
"#;

const PARALLEL: &str = r#"
key: parallel
nodes:
  - id: start
    kind: { type: start_event }
  - id: fork
    kind: { type: parallel_gateway }
  - id: a
    kind: { type: user_task }
  - id: b
    kind: { type: user_task }
  - id: join
    kind: { type: parallel_gateway }
  - id: end
    kind: { type: end_event }
flows:
  - { id: f1, source: start, target: fork }
  - { id: f2, source: fork, target: a }
  - { id: f3, source: fork, target: b }
  - { id: f4, source: a, target: join }
  - { id: f5, source: b, target: join }
  - { id: f6, source: join, target: end }
"#;

const REMINDER: &str = r#"
key: reminder
nodes:
  - id: start
    kind: { type: start_event }
  - id: wait
    kind: { type: timer_catch_event, duration_ms: 60000 }
  - id: done
    kind: { type: end_event }
flows:
  - { id: f1, source: start, target: wait }
  - { id: f2, source: wait, target: done }
"#;

const BACKGROUND: &str = r#"
key: background
nodes:
  - id: start
    kind: { type: start_event }
  - id: work
    async_before: true
    kind: { type: service_task, delegate: archive }
  - id: done
    kind: { type: end_event }
flows:
  - { id: f1, source: start, target: work }
  - { id: f2, source: work, target: done }
"#;

const EXTERNAL: &str = r#"
key: external
nodes:
  - id: start
    kind: { type: start_event }
  - id: pay
    kind: { type: external_worker_task, topic: payments }
  - id: done
    kind: { type: end_event }
flows:
  - { id: f1, source: start, target: pay }
  - { id: f2, source: pay, target: done }
"#;

fn archive_delegate() -> Arc<dyn ServiceDelegate> {
    Arc::new(FnDelegate::new("archive", |vars: &mut Map<String, Value>| {
        vars.insert("archived".into(), Value::Bool(true));
        Ok(())
    }))
}

fn charge_delegate() -> Arc<dyn ServiceDelegate> {
    Arc::new(FnDelegate::new("charge", |vars: &mut Map<String, Value>| {
        let amount = vars.get("amount").and_then(Value::as_i64).unwrap_or(0);
        if amount < 0 {
            return Err(EngineError::business_fault("INVALID", "negative amount"));
        }
        if amount > 100 {
            return Err(EngineError::business_fault("DECLINED", "limit exceeded"));
        }
        vars.insert("charged".into(), Value::from(amount));
        Ok(())
    }))
}

fn engine(store: &Arc<InMemoryStore>, definitions: &[&str]) -> ProcessEngine {
    build_engine(store, definitions, test_config("node-a"), |b| {
        b.delegate(archive_delegate()).delegate(charge_delegate())
    })
}

async fn instance(engine: &ProcessEngine, id: &str) -> ExecutionEntity {
    engine
        .execute(GetProcessInstance {
            process_instance_id: id.to_string(),
        })
        .await
        .unwrap()
}

async fn tasks(engine: &ProcessEngine, id: &str) -> Vec<TaskEntity> {
    engine
        .execute(ListTasks {
            process_instance_id: id.to_string(),
        })
        .await
        .unwrap()
}

async fn jobs(engine: &ProcessEngine, bucket: JobBucket, id: &str) -> Vec<JobEntity> {
    engine
        .execute(ListJobs {
            bucket,
            process_instance_id: Some(id.to_string()),
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn user_task_and_exclusive_gateway() {
    let store = Arc::new(InMemoryStore::new());
    let engine = engine(&store, &[APPROVAL]);

    let pi = engine
        .execute(StartProcessInstance::new("approval").with_business_key("order-7"))
        .await
        .unwrap();
    let open = tasks(&engine, &pi).await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].element_id, "review");
    assert_eq!(open[0].assignee.as_deref(), Some("alice"));
    assert!(!instance(&engine, &pi).await.is_ended());

    engine
        .execute(CompleteTask::new(&open[0].id).with_variable("approved", true))
        .await
        .unwrap();

    let done = instance(&engine, &pi).await;
    assert!(done.is_ended());
    assert_eq!(done.current_node.as_deref(), Some("approved"));
    assert_eq!(done.business_key.as_deref(), Some("order-7"));
    assert_eq!(done.variables["archived"], json!(true));
    assert!(tasks(&engine, &pi).await.is_empty());
    // Only the process instance row is left.
    assert_eq!(store.rows(ExecutionEntity::TYPE).len(), 1);
}

#[tokio::test]
async fn exclusive_gateway_takes_default_flow() {
    let store = Arc::new(InMemoryStore::new());
    let engine = engine(&store, &[APPROVAL]);

    let pi = engine
        .execute(StartProcessInstance::new("approval"))
        .await
        .unwrap();
    let task = tasks(&engine, &pi).await.remove(0);
    engine
        .execute(CompleteTask::new(&task.id).with_variable("approved", false))
        .await
        .unwrap();

    let done = instance(&engine, &pi).await;
    assert_eq!(done.current_node.as_deref(), Some("rejected"));
    assert!(done.variables.get("archived").is_none());
}

#[tokio::test]
async fn error_boundary_catches_business_fault() {
    let store = Arc::new(InMemoryStore::new());
    let engine = engine(&store, &[PAYMENT]);

    let small = engine
        .execute(StartProcessInstance::new("payment").with_variable("amount", 50))
        .await
        .unwrap();
    let small = instance(&engine, &small).await;
    assert_eq!(small.current_node.as_deref(), Some("paid"));
    assert_eq!(small.variables["charged"], json!(50));

    let large = engine
        .execute(StartProcessInstance::new("payment").with_variable("amount", 500))
        .await
        .unwrap();
    let large = instance(&engine, &large).await;
    assert!(large.is_ended());
    assert_eq!(large.current_node.as_deref(), Some("declined"));
    assert_eq!(large.variables["error_code"], json!("DECLINED"));
    assert!(large.variables.get("charged").is_none());
}

#[tokio::test]
async fn uncaught_business_fault_rolls_back_start() {
    let store = Arc::new(InMemoryStore::new());
    let engine = engine(&store, &[PAYMENT]);

    let err = assert_err!(
        engine
            .execute(StartProcessInstance::new("payment").with_variable("amount", -1))
            .await
    );
    assert!(matches!(err, EngineError::BusinessFault { ref code, .. } if code == "INVALID"));
    assert!(store.rows(ExecutionEntity::TYPE).is_empty());
}

#[tokio::test]
async fn parallel_fork_and_join() {
    let store = Arc::new(InMemoryStore::new());
    let engine = engine(&store, &[PARALLEL]);

    let pi = engine
        .execute(StartProcessInstance::new("parallel"))
        .await
        .unwrap();
    let open = tasks(&engine, &pi).await;
    let mut nodes: Vec<&str> = open.iter().map(|t| t.element_id.as_str()).collect();
    nodes.sort_unstable();
    assert_eq!(nodes, vec!["a", "b"]);

    let first = open.iter().find(|t| t.element_id == "a").unwrap();
    engine.execute(CompleteTask::new(&first.id)).await.unwrap();
    assert!(!instance(&engine, &pi).await.is_ended());
    assert_eq!(tasks(&engine, &pi).await.len(), 1);

    let second = open.iter().find(|t| t.element_id == "b").unwrap();
    engine.execute(CompleteTask::new(&second.id)).await.unwrap();
    let done = instance(&engine, &pi).await;
    assert!(done.is_ended());
    assert_eq!(done.current_node.as_deref(), Some("end"));
    assert_eq!(store.rows(ExecutionEntity::TYPE).len(), 1);
}

#[tokio::test]
async fn timer_fires_once_due() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let engine = build_engine(&store, &[REMINDER], test_config("node-a"), |b| {
        b.clock(clock.clone())
    });

    let pi = engine
        .execute(StartProcessInstance::new("reminder"))
        .await
        .unwrap();
    let timers = jobs(&engine, JobBucket::Timer, &pi).await;
    assert_eq!(timers.len(), 1);
    assert_eq!(timers[0].element_id.as_deref(), Some("wait"));

    let scheduler = engine.job_scheduler();
    assert!(scheduler.run_once().await.unwrap().is_empty());

    clock.advance(chrono::Duration::seconds(61));
    let outcomes = scheduler.run_once().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].1, JobRunOutcome::Completed);

    let done = instance(&engine, &pi).await;
    assert!(done.is_ended());
    assert!(jobs(&engine, JobBucket::Timer, &pi).await.is_empty());
    assert!(jobs(&engine, JobBucket::Executable, &pi).await.is_empty());
}

#[tokio::test]
async fn suspended_instance_parks_its_jobs() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let engine = build_engine(&store, &[REMINDER, APPROVAL], test_config("node-a"), |b| {
        b.clock(clock.clone()).delegate(archive_delegate())
    });

    let pi = engine
        .execute(StartProcessInstance::new("reminder"))
        .await
        .unwrap();
    let moved = engine
        .execute(SuspendProcessInstance {
            process_instance_id: pi.clone(),
        })
        .await
        .unwrap();
    assert_eq!(moved, 1);
    assert!(jobs(&engine, JobBucket::Timer, &pi).await.is_empty());
    let parked = jobs(&engine, JobBucket::Suspended, &pi).await;
    assert_eq!(parked[0].suspended_from, Some(JobBucket::Timer));

    clock.advance(chrono::Duration::seconds(61));
    assert!(engine.job_scheduler().run_once().await.unwrap().is_empty());

    engine
        .execute(ActivateProcessInstance {
            process_instance_id: pi.clone(),
        })
        .await
        .unwrap();
    assert_eq!(jobs(&engine, JobBucket::Timer, &pi).await.len(), 1);
    engine.job_scheduler().run_once().await.unwrap();
    assert!(instance(&engine, &pi).await.is_ended());

    // Tasks of a suspended instance cannot be completed.
    let approval = engine
        .execute(StartProcessInstance::new("approval"))
        .await
        .unwrap();
    engine
        .execute(SuspendProcessInstance {
            process_instance_id: approval.clone(),
        })
        .await
        .unwrap();
    let task = tasks(&engine, &approval).await.remove(0);
    let err = assert_err!(engine.execute(CompleteTask::new(&task.id)).await);
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn async_continuation_runs_through_scheduler() {
    let store = Arc::new(InMemoryStore::new());
    let engine = engine(&store, &[BACKGROUND]);

    let pi = engine
        .execute(StartProcessInstance::new("background"))
        .await
        .unwrap();
    let waiting = instance(&engine, &pi).await;
    assert!(!waiting.is_ended());
    assert_eq!(jobs(&engine, JobBucket::Executable, &pi).await.len(), 1);

    let outcomes = engine.job_scheduler().run_once().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].1, JobRunOutcome::Completed);
    let done = instance(&engine, &pi).await;
    assert!(done.is_ended());
    assert_eq!(done.variables["archived"], json!(true));
}

#[tokio::test]
async fn background_scheduler_completes_async_work() {
    let store = Arc::new(InMemoryStore::new());
    let engine = engine(&store, &[BACKGROUND]);
    engine.job_scheduler().start();
    assert!(engine.job_scheduler().is_running());

    let pi = engine
        .execute(StartProcessInstance::new("background"))
        .await
        .unwrap();

    let mut ended = false;
    for _ in 0..250 {
        if instance(&engine, &pi).await.is_ended() {
            ended = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    engine.job_scheduler().shutdown().await.unwrap();

    assert!(ended, "async continuation was not executed");
    assert!(!engine.job_scheduler().is_running());
    assert_eq!(
        engine.job_scheduler().available_workers(),
        engine.config().max_concurrent_jobs
    );
}

#[tokio::test]
async fn external_worker_fetches_and_completes() {
    let store = Arc::new(InMemoryStore::new());
    let engine = engine(&store, &[EXTERNAL]);

    let pi = engine
        .execute(StartProcessInstance::new("external"))
        .await
        .unwrap();

    let fetch = |worker: &str| FetchAndLockExternalJobs {
        worker_id: worker.to_string(),
        topic: "payments".to_string(),
        limit: 10,
        lock_duration: chrono::Duration::minutes(5),
    };
    let locked = engine.execute(fetch("w1")).await.unwrap();
    assert_eq!(locked.len(), 1);
    assert!(engine.execute(fetch("w2")).await.unwrap().is_empty());

    let err = engine
        .execute(CompleteExternalJob {
            job_id: locked[0].id.clone(),
            worker_id: "w2".to_string(),
            variables: Map::new(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LockLost { .. }));

    engine
        .execute(CompleteExternalJob {
            job_id: locked[0].id.clone(),
            worker_id: "w1".to_string(),
            variables: vars(json!({"receipt": "r-1"})),
        })
        .await
        .unwrap();

    let done = instance(&engine, &pi).await;
    assert!(done.is_ended());
    assert_eq!(done.variables["receipt"], json!("r-1"));
}

#[tokio::test]
async fn breakpoint_parks_and_resumes_unit_of_work() {
    let store = Arc::new(InMemoryStore::new());
    let breakpoints = Arc::new(NodeBreakpoints::new());
    breakpoints.add("archive");
    let engine = build_engine(&store, &[APPROVAL], test_config("node-a"), |b| {
        b.delegate(archive_delegate()).breakpoints(breakpoints.clone())
    });

    let pi = engine
        .execute(StartProcessInstance::new("approval"))
        .await
        .unwrap();
    let task = tasks(&engine, &pi).await.remove(0);

    let err = engine
        .execute(CompleteTask::new(&task.id).with_variable("approved", true))
        .await
        .unwrap_err();
    let context_id = match err {
        EngineError::Suspended { context_id, node } => {
            assert_eq!(node, "archive");
            context_id
        }
        other => panic!("expected suspension, got {other:?}"),
    };

    // Nothing is committed while parked.
    assert!(store.get(TaskEntity::TYPE, &task.id).is_some());
    assert_eq!(
        engine.services().parked_contexts().await,
        vec![context_id.clone()]
    );

    engine.resume(&context_id).await.unwrap();
    let done = instance(&engine, &pi).await;
    assert!(done.is_ended());
    assert_eq!(done.variables["archived"], json!(true));
    assert!(store.get(TaskEntity::TYPE, &task.id).is_none());
}

/// Records the name and outcome of every command it sees.
#[derive(Default)]
struct Recorder {
    seen: std::sync::Mutex<Vec<(String, bool)>>,
}

impl Recorder {
    fn seen(&self) -> Vec<(String, bool)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandInterceptor for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn intercept<'a>(
        &'a self,
        command: &'a dyn DynCommand,
        next: Next<'a>,
    ) -> EngineResult<CommandOutput> {
        let result = next.run(command).await;
        self.seen
            .lock()
            .unwrap()
            .push((command.name().to_string(), result.is_ok()));
        result
    }
}

#[tokio::test]
async fn resumed_unit_of_work_passes_interceptors() {
    let store = Arc::new(InMemoryStore::new());
    let breakpoints = Arc::new(NodeBreakpoints::new());
    breakpoints.add("archive");
    let recorder = Arc::new(Recorder::default());
    let engine = build_engine(&store, &[APPROVAL], test_config("node-a"), |b| {
        b.delegate(archive_delegate())
            .breakpoints(breakpoints.clone())
            .interceptor(recorder.clone())
    });

    let pi = engine
        .execute(StartProcessInstance::new("approval"))
        .await
        .unwrap();
    let task = tasks(&engine, &pi).await.remove(0);
    let context_id = match engine
        .execute(CompleteTask::new(&task.id).with_variable("approved", true))
        .await
    {
        Err(EngineError::Suspended { context_id, .. }) => context_id,
        other => panic!("expected suspension, got {other:?}"),
    };
    let before = recorder.seen().len();

    engine.resume(&context_id).await.unwrap();
    let seen = recorder.seen();
    assert_eq!(seen.len(), before + 1);
    assert_eq!(seen[before], ("resume-parked".to_string(), true));
    assert!(instance(&engine, &pi).await.is_ended());
}

#[tokio::test]
async fn signal_moves_waiting_execution_on() {
    let store = Arc::new(InMemoryStore::new());
    let engine = engine(&store, &[REMINDER]);

    let pi = engine
        .execute(StartProcessInstance::new("reminder").with_variable("attempt", 1))
        .await
        .unwrap();
    let timer = jobs(&engine, JobBucket::Timer, &pi).await.remove(0);
    let waiting = timer.scope_id.clone().unwrap();

    // The root is not a waiting execution.
    let err = assert_err!(
        engine
            .execute(SignalExecution {
                execution_id: pi.clone(),
                variables: Map::new(),
            })
            .await
    );
    assert!(matches!(err, EngineError::Validation(_)));

    engine
        .execute(SignalExecution {
            execution_id: waiting,
            variables: vars(json!({"attempt": 2, "skipped": true})),
        })
        .await
        .unwrap();

    assert!(instance(&engine, &pi).await.is_ended());
    let variables = engine
        .execute(GetVariables {
            process_instance_id: pi.clone(),
        })
        .await
        .unwrap();
    assert_eq!(variables, vars(json!({"attempt": 2, "skipped": true})));
    // The pending timer went with its execution.
    assert!(jobs(&engine, JobBucket::Timer, &pi).await.is_empty());
}

#[tokio::test]
async fn discarded_breakpoint_rolls_back() {
    let store = Arc::new(InMemoryStore::new());
    let breakpoints = Arc::new(NodeBreakpoints::new());
    breakpoints.add("review");
    let engine = build_engine(&store, &[APPROVAL], test_config("node-a"), |b| {
        b.breakpoints(breakpoints.clone())
    });

    let err = assert_err!(engine.execute(StartProcessInstance::new("approval")).await);
    let context_id = match err {
        EngineError::Suspended { context_id, .. } => context_id,
        other => panic!("expected suspension, got {other:?}"),
    };

    engine.discard(&context_id).await.unwrap();
    assert!(engine.services().parked_contexts().await.is_empty());
    assert!(store.rows(ExecutionEntity::TYPE).is_empty());
    assert!(store.rows(TaskEntity::TYPE).is_empty());
    assert!(matches!(
        engine.resume(&context_id).await,
        Err(EngineError::NotFound(_))
    ));
}
