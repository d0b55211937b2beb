//! Engine assembly.
//!
//! [`EngineServices`] is the shared, immutable-after-build service registry
//! every unit of work reaches through its context. [`ProcessEngine`] is the
//! public facade; [`ProcessEngineBuilder`] wires defaults for everything the
//! caller does not provide.

use crate::agenda::BreakpointHook;
use crate::clock::{Clock, SystemClock};
use crate::command::executor::ResumeParked;
use crate::command::{
    Command, CommandConfig, CommandExecutor, CommandInterceptor, Configured, LogInterceptor,
    RetryInterceptor,
};
use crate::config::EngineConfig;
use crate::context::CommandContext;
use crate::entity::{FlushOrdering, TypedEntity};
use crate::error::{EngineError, EngineResult};
use crate::job::{
    create_default_registry, BackoffStrategy, ExponentialBackoff, JobBucket, JobHandler,
    JobHandlerRegistry, JobScheduler,
};
use crate::runtime::{
    DefinitionRepository, DelegateRegistry, ExecutionEntity, ExpressionEvaluator,
    InMemoryDefinitionRepository, MiniJinjaEvaluator, ServiceDelegate, TaskEntity,
};
use crate::store::{InMemoryStore, Storage};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

/// Store key of the default storage session.
pub const DEFAULT_STORE: &str = "main";

/// Services shared by every unit of work of one engine.
pub struct EngineServices {
    pub(crate) config: EngineConfig,
    pub(crate) stores: BTreeMap<String, Arc<dyn Storage>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) lock_clock: Arc<dyn Clock>,
    pub(crate) executor: CommandExecutor,
    pub(crate) flush_ordering: FlushOrdering,
    pub(crate) definitions: Arc<dyn DefinitionRepository>,
    pub(crate) evaluator: Arc<dyn ExpressionEvaluator>,
    pub(crate) delegates: Arc<DelegateRegistry>,
    pub(crate) job_handlers: Arc<JobHandlerRegistry>,
    pub(crate) backoff: Arc<dyn BackoffStrategy>,
    pub(crate) breakpoints: Option<Arc<dyn BreakpointHook>>,
    /// Signalled when new executable work was committed.
    pub(crate) job_added: Notify,
    parked: Mutex<HashMap<String, CommandContext>>,
}

impl EngineServices {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Clock used for due dates and timestamps.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Clock used for job lock expiry.
    pub fn lock_clock(&self) -> &Arc<dyn Clock> {
        &self.lock_clock
    }

    pub fn store(&self, kind: &str) -> EngineResult<Arc<dyn Storage>> {
        self.stores
            .get(kind)
            .cloned()
            .ok_or_else(|| EngineError::Config(format!("no store registered as '{}'", kind)))
    }

    pub fn definitions(&self) -> &Arc<dyn DefinitionRepository> {
        &self.definitions
    }

    pub fn evaluator(&self) -> &Arc<dyn ExpressionEvaluator> {
        &self.evaluator
    }

    pub fn delegates(&self) -> &DelegateRegistry {
        &self.delegates
    }

    pub fn job_handlers(&self) -> &JobHandlerRegistry {
        &self.job_handlers
    }

    pub fn backoff(&self) -> &Arc<dyn BackoffStrategy> {
        &self.backoff
    }

    /// Run a command as an outermost unit of work.
    pub async fn execute<C: Command>(self: &Arc<Self>, command: C) -> EngineResult<C::Output> {
        self.executor.execute(self, command).await
    }

    /// Keep a context paused at a breakpoint until it is resumed.
    pub(crate) async fn park(&self, ctx: CommandContext) {
        let mut parked = self.parked.lock().await;
        parked.insert(ctx.id().to_string(), ctx);
    }

    /// Continue a parked context from the operation it paused before.
    pub async fn resume(self: &Arc<Self>, context_id: &str) -> EngineResult<()> {
        let mut ctx = self
            .parked
            .lock()
            .await
            .remove(context_id)
            .ok_or_else(|| EngineError::NotFound(format!("parked context '{}'", context_id)))?;
        info!(context_id = %context_id, "Resuming parked unit of work");
        ctx.skip_next_breakpoint();
        self.executor
            .execute_dyn(self, &ResumeParked::new(ctx))
            .await
            .map(|_| ())
    }

    /// Roll back a parked context instead of resuming it.
    pub async fn discard(&self, context_id: &str) -> EngineResult<()> {
        let mut ctx = self
            .parked
            .lock()
            .await
            .remove(context_id)
            .ok_or_else(|| EngineError::NotFound(format!("parked context '{}'", context_id)))?;
        let reason = EngineError::Validation(format!("parked context '{}' discarded", context_id));
        ctx.abort(&reason).await;
        Ok(())
    }

    pub async fn parked_contexts(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.parked.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for EngineServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineServices")
            .field("node_id", &self.config.node_id)
            .field("stores", &self.stores.keys().collect::<Vec<_>>())
            .field("executor", &self.executor)
            .field("delegates", &self.delegates)
            .field("job_handlers", &self.job_handlers)
            .finish()
    }
}

/// A configured engine: command execution plus its job scheduler.
pub struct ProcessEngine {
    services: Arc<EngineServices>,
    scheduler: JobScheduler,
}

impl ProcessEngine {
    pub fn builder(config: EngineConfig) -> ProcessEngineBuilder {
        ProcessEngineBuilder::new(config)
    }

    pub async fn execute<C: Command>(&self, command: C) -> EngineResult<C::Output> {
        self.services.execute(command).await
    }

    /// Run a command with an overridden propagation / retry policy.
    pub async fn execute_with<C: Command>(
        &self,
        config: CommandConfig,
        command: C,
    ) -> EngineResult<C::Output> {
        self.services
            .execute(Configured {
                inner: command,
                config,
            })
            .await
    }

    pub async fn resume(&self, context_id: &str) -> EngineResult<()> {
        self.services.resume(context_id).await
    }

    pub async fn discard(&self, context_id: &str) -> EngineResult<()> {
        self.services.discard(context_id).await
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub fn job_scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &EngineConfig {
        self.services.config()
    }
}

/// Wires an engine. Anything not set falls back to an in-memory or
/// built-in default.
pub struct ProcessEngineBuilder {
    config: EngineConfig,
    stores: BTreeMap<String, Arc<dyn Storage>>,
    clock: Option<Arc<dyn Clock>>,
    lock_clock: Option<Arc<dyn Clock>>,
    definitions: Option<Arc<dyn DefinitionRepository>>,
    evaluator: Option<Arc<dyn ExpressionEvaluator>>,
    delegates: DelegateRegistry,
    job_handlers: JobHandlerRegistry,
    backoff: Option<Arc<dyn BackoffStrategy>>,
    breakpoints: Option<Arc<dyn BreakpointHook>>,
    interceptors: Vec<Arc<dyn CommandInterceptor>>,
    flush_ordering: Option<FlushOrdering>,
}

impl ProcessEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            stores: BTreeMap::new(),
            clock: None,
            lock_clock: None,
            definitions: None,
            evaluator: None,
            delegates: DelegateRegistry::with_builtins(),
            job_handlers: create_default_registry(),
            backoff: None,
            breakpoints: None,
            interceptors: Vec::new(),
            flush_ordering: None,
        }
    }

    /// The default store.
    pub fn store(self, store: Arc<dyn Storage>) -> Self {
        self.named_store(DEFAULT_STORE, store)
    }

    pub fn named_store(mut self, kind: impl Into<String>, store: Arc<dyn Storage>) -> Self {
        self.stores.insert(kind.into(), store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn lock_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.lock_clock = Some(clock);
        self
    }

    pub fn definitions(mut self, definitions: Arc<dyn DefinitionRepository>) -> Self {
        self.definitions = Some(definitions);
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn delegate(mut self, delegate: Arc<dyn ServiceDelegate>) -> Self {
        self.delegates.register(delegate);
        self
    }

    pub fn job_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.job_handlers.register(handler);
        self
    }

    pub fn backoff(mut self, backoff: Arc<dyn BackoffStrategy>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn breakpoints(mut self, hook: Arc<dyn BreakpointHook>) -> Self {
        self.breakpoints = Some(hook);
        self
    }

    /// Custom interceptor, run inside the built-in log and retry ones.
    pub fn interceptor(mut self, interceptor: Arc<dyn CommandInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Flush order of entity types, parents first. Types not listed flush
    /// after the listed ones.
    pub fn flush_ordering(mut self, ordering: FlushOrdering) -> Self {
        self.flush_ordering = Some(ordering);
        self
    }

    fn default_flush_ordering() -> FlushOrdering {
        let mut types = vec![ExecutionEntity::TYPE, TaskEntity::TYPE];
        types.extend(JobBucket::ALL.iter().map(|b| b.entity_type()));
        FlushOrdering::new(types)
    }

    pub fn build(self) -> EngineResult<ProcessEngine> {
        let config = self.config;

        let definitions = match self.definitions {
            Some(definitions) => definitions,
            None => {
                let repository = InMemoryDefinitionRepository::new();
                if let Some(dir) = &config.definitions_dir {
                    let deployed = repository.deploy_dir(dir)?;
                    info!(dir = %dir.display(), deployed, "Process definitions deployed");
                }
                Arc::new(repository)
            }
        };

        let mut stores = self.stores;
        if !stores.contains_key(DEFAULT_STORE) {
            warn!("No store configured, using in-memory store");
            stores.insert(DEFAULT_STORE.to_string(), Arc::new(InMemoryStore::new()));
        }

        let mut interceptors: Vec<Arc<dyn CommandInterceptor>> = vec![
            Arc::new(LogInterceptor),
            Arc::new(RetryInterceptor::new(
                config.conflict_retry_attempts,
                config.conflict_retry_wait(),
            )),
        ];
        interceptors.extend(self.interceptors);

        let backoff = self
            .backoff
            .unwrap_or_else(|| Arc::new(ExponentialBackoff::from_config(&config)));

        let services = Arc::new(EngineServices {
            stores,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            lock_clock: self.lock_clock.unwrap_or_else(|| Arc::new(SystemClock)),
            executor: CommandExecutor::new(interceptors),
            flush_ordering: self
                .flush_ordering
                .unwrap_or_else(Self::default_flush_ordering),
            definitions,
            evaluator: self
                .evaluator
                .unwrap_or_else(|| Arc::new(MiniJinjaEvaluator::new())),
            delegates: Arc::new(self.delegates),
            job_handlers: Arc::new(self.job_handlers),
            backoff,
            breakpoints: self.breakpoints,
            job_added: Notify::new(),
            parked: Mutex::new(HashMap::new()),
            config,
        });

        info!(
            node_id = %services.config.node_id,
            stores = ?services.stores.keys().collect::<Vec<_>>(),
            interceptors = ?services.executor.interceptor_names(),
            "Process engine built"
        );

        let scheduler = JobScheduler::new(services.clone());
        Ok(ProcessEngine {
            services,
            scheduler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let engine = ProcessEngine::builder(EngineConfig::default()).build().unwrap();
        let services = engine.services();
        assert!(services.store(DEFAULT_STORE).is_ok());
        assert!(services.store("archive").is_err());
        assert_eq!(services.executor.interceptor_names(), vec!["log", "retry"]);
        assert!(services.delegates().has("log"));
        assert_eq!(
            services.flush_ordering.rank(ExecutionEntity::TYPE),
            0
        );
        assert!(
            services.flush_ordering.rank(TaskEntity::TYPE)
                < services.flush_ordering.rank(JobBucket::Executable.entity_type())
        );
    }

    #[test]
    fn test_builder_deploys_definitions_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("noop.yaml"),
            "key: noop\nnodes:\n  - id: s\n    kind: { type: start_event }\n",
        )
        .unwrap();
        let config = EngineConfig {
            definitions_dir: Some(dir.path().to_path_buf()),
            ..EngineConfig::default()
        };
        let engine = ProcessEngine::builder(config).build().unwrap();
        assert_eq!(engine.services().definitions().latest("noop").unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_resume_unknown_context() {
        let engine = ProcessEngine::builder(EngineConfig::default()).build().unwrap();
        let err = engine.resume("nope").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
