//! The unit-of-work context.
//!
//! A [`CommandContext`] is created by the command executor for every
//! outermost command. It owns the entity cache, the storage sessions opened
//! on demand, the close listeners, the agenda and the command's result.
//! Nothing is ambient: commands, operations and listeners all receive the
//! context explicitly.
//!
//! Closing runs: `closing` listeners, cache flush, `after_session_flush`
//! listeners, commit of every open session, `closed` listeners. Any failure
//! before the commit turns into `close_failure` notifications followed by a
//! rollback of every session.
//!
//! Sessions on several stores commit one after another, not atomically.
//! Named stores commit first and the default store last, so a failed commit
//! on a named store still rolls back the process state. A failure of the
//! default store's own commit cannot undo named stores committed before it.

use crate::agenda::{Agenda, Operation};
use crate::command::Command;
use crate::engine::{EngineServices, DEFAULT_STORE};
use crate::entity::{
    decode, DynEntity, EntityCache, EntityKey, EntityMatcher, FlushSummary, PersistentEntity,
    TypedEntity,
};
use crate::error::{EngineError, EngineResult};
use crate::store::{compare_by, EntityRecord, RecordQuery, StorageSession};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Type-erased command result.
pub type CommandOutput = Box<dyn Any + Send + Sync>;

/// Lifecycle callbacks of a unit of work, invoked in registration order.
#[async_trait]
pub trait CloseListener: Send + Sync {
    /// Listener name; [`CommandContext::add_close_listener_once`] dedupes on it.
    fn name(&self) -> &str;

    /// Before the flush. May still modify entities or fail the unit of work.
    async fn closing(&self, _ctx: &mut CommandContext) -> EngineResult<()> {
        Ok(())
    }

    /// After the flush, before the commit. May still fail the unit of work.
    async fn after_session_flush(&self, _ctx: &CommandContext) -> EngineResult<()> {
        Ok(())
    }

    /// After every session committed.
    async fn closed(&self, _ctx: &CommandContext) {}

    /// The unit of work is being rolled back.
    async fn close_failure(&self, _ctx: &CommandContext, _error: &EngineError) {}
}

/// How an agenda drain ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Exhausted,
    /// A breakpoint matched before the operation targeting `node`.
    Paused { node: String },
}

/// State of one unit of work.
pub struct CommandContext {
    id: String,
    command_name: String,
    services: Arc<EngineServices>,
    cache: EntityCache,
    sessions: BTreeMap<String, Box<dyn StorageSession>>,
    listeners: Vec<Arc<dyn CloseListener>>,
    agenda: Agenda,
    result: Option<CommandOutput>,
    skip_breakpoint_once: bool,
}

impl CommandContext {
    pub(crate) fn new(services: Arc<EngineServices>, command_name: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            command_name: command_name.to_string(),
            services,
            cache: EntityCache::new(),
            sessions: BTreeMap::new(),
            listeners: Vec::new(),
            agenda: Agenda::new(),
            result: None,
            skip_breakpoint_once: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn command_name(&self) -> &str {
        &self.command_name
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    /// "Now" according to the engine clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.services.clock().now()
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut EntityCache {
        &mut self.cache
    }

    pub fn agenda(&self) -> &Agenda {
        &self.agenda
    }

    // ---- storage sessions --------------------------------------------------

    async fn ensure_session(&mut self, kind: &str) -> EngineResult<()> {
        if !self.sessions.contains_key(kind) {
            let store = self.services.store(kind)?;
            let session = store.open_session().await?;
            trace!(context_id = %self.id, store = %store.name(), "Storage session opened");
            self.sessions.insert(kind.to_string(), session);
        }
        Ok(())
    }

    /// The open session for a store, opened on first use.
    pub async fn session(&mut self, kind: &str) -> EngineResult<&mut Box<dyn StorageSession>> {
        self.ensure_session(kind).await?;
        self.sessions
            .get_mut(kind)
            .ok_or_else(|| EngineError::Internal(format!("session '{}' not open", kind)))
    }

    /// The session of the default store.
    pub async fn main_session(&mut self) -> EngineResult<&mut Box<dyn StorageSession>> {
        self.session(DEFAULT_STORE).await
    }

    // ---- entities -----------------------------------------------------------

    /// Cache-first lookup. The same instance is returned for every lookup
    /// of one identity within this unit of work.
    pub async fn find_as<E: PersistentEntity>(
        &mut self,
        entity_type: &str,
        id: &str,
    ) -> EngineResult<Option<&mut E>> {
        let key = EntityKey::new(entity_type, id);
        if !self.cache.contains(&key) {
            let record = self.main_session().await?.find(entity_type, id).await?;
            match record {
                Some(record) => {
                    self.cache.put_loaded(decode::<E>(&record)?)?;
                }
                None => return Ok(None),
            }
        }
        Ok(self.cache.find_mut::<E>(entity_type, id))
    }

    pub async fn find<E: TypedEntity>(&mut self, id: &str) -> EngineResult<Option<&mut E>> {
        self.find_as::<E>(E::TYPE, id).await
    }

    /// Like [`find`](Self::find) but absence is an error.
    pub async fn get<E: TypedEntity>(&mut self, id: &str) -> EngineResult<&mut E> {
        self.find_as::<E>(E::TYPE, id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("{} '{}'", E::TYPE, id)))
    }

    /// Read straight from the store, bypassing the identity map.
    pub async fn find_fresh(
        &mut self,
        entity_type: &str,
        id: &str,
    ) -> EngineResult<Option<EntityRecord>> {
        self.main_session().await?.find(entity_type, id).await
    }

    /// Add a new entity to the unit of work.
    pub fn insert<E: PersistentEntity>(&mut self, entity: E) -> EngineResult<()> {
        self.cache.insert(entity)
    }

    /// Schedule an entity for deletion, loading it first if needed.
    /// Returns false when it does not exist.
    pub async fn delete_as<E: PersistentEntity>(
        &mut self,
        entity_type: &str,
        id: &str,
    ) -> EngineResult<bool> {
        if self.find_as::<E>(entity_type, id).await?.is_none() {
            return Ok(false);
        }
        Ok(self.cache.delete(&EntityKey::new(entity_type, id)))
    }

    pub async fn delete<E: TypedEntity>(&mut self, id: &str) -> EngineResult<bool> {
        self.delete_as::<E>(E::TYPE, id).await
    }

    /// Cache-aware query.
    ///
    /// Runs `query` against the store, registers the rows in the identity
    /// map (cached instances win), then merges in entities that only exist
    /// in the cache and drops cached ones that no longer qualify. With no
    /// explicit matcher an entity qualifies when it is not scheduled for
    /// deletion and its current state satisfies the query conditions.
    /// Returns the ids of the merged result, ordered like the store would.
    pub async fn query_cached<E: PersistentEntity>(
        &mut self,
        cache_key: &str,
        query: RecordQuery,
        matcher: Option<Arc<dyn EntityMatcher>>,
    ) -> EngineResult<Vec<String>> {
        let unbounded = RecordQuery {
            limit: None,
            ..query.clone()
        };
        let records = self.main_session().await?.query(&unbounded).await?;

        let mut store_keys = Vec::with_capacity(records.len());
        for record in &records {
            let key = EntityKey::new(&record.entity_type, &record.id);
            if !self.cache.contains(&key) {
                self.cache.put_loaded(decode::<E>(record)?)?;
            }
            store_keys.push(key);
        }

        let matcher = matcher.unwrap_or_else(|| {
            Arc::new(QueryMatcher {
                query: query.clone(),
            })
        });
        self.cache
            .cache_result_list(cache_key, &query.entity_type, store_keys.clone(), matcher);

        let mut candidates = store_keys;
        for key in self.cache.keys_of_type(&query.entity_type) {
            if !candidates.contains(&key) {
                candidates.push(key);
            }
        }

        let mut retained: Vec<(String, serde_json::Value)> = Vec::new();
        for key in &candidates {
            if let Some(entity) = self.cache.find_dyn(key) {
                if self.cache.has_retained(cache_key, entity) {
                    retained.push((key.id.clone(), entity.snapshot()?));
                }
            }
        }
        let field = query.order_by.as_deref();
        retained.sort_by(|(a_id, a), (b_id, b)| compare_by(field, a, a_id, b, b_id));
        let mut ids: Vec<String> = retained.into_iter().map(|(id, _)| id).collect();
        if let Some(limit) = query.limit {
            ids.truncate(limit);
        }
        Ok(ids)
    }

    /// Flush the entity cache into the default store's session.
    pub async fn flush(&mut self) -> EngineResult<FlushSummary> {
        self.ensure_session(DEFAULT_STORE).await?;
        let session = self
            .sessions
            .get_mut(DEFAULT_STORE)
            .ok_or_else(|| EngineError::Internal("default session not open".to_string()))?;
        self.cache
            .flush(session.as_mut(), &self.services.flush_ordering)
            .await
    }

    // ---- agenda -------------------------------------------------------------

    pub fn plan(&mut self, operation: Box<dyn Operation>) {
        self.agenda.plan(operation);
    }

    pub fn plan_next(&mut self, operation: Box<dyn Operation>) {
        self.agenda.plan_next(operation);
    }

    /// Run queued operations until the agenda is empty or a breakpoint hits.
    pub async fn drain_agenda(&mut self) -> EngineResult<DrainOutcome> {
        let hook = self.services.breakpoints.clone();
        while let Some(operation) = self.agenda.pop() {
            if let Some(hook) = &hook {
                let skip = std::mem::take(&mut self.skip_breakpoint_once);
                if !skip && hook.should_pause(operation.as_ref()) {
                    let node = operation
                        .target()
                        .unwrap_or_else(|| operation.name())
                        .to_string();
                    self.agenda.plan_next(operation);
                    debug!(context_id = %self.id, node = %node, "Agenda paused at breakpoint");
                    return Ok(DrainOutcome::Paused { node });
                }
            }
            trace!(
                context_id = %self.id,
                operation = %operation.name(),
                target = ?operation.target(),
                "Running operation"
            );
            operation.run(self).await?;
        }
        Ok(DrainOutcome::Exhausted)
    }

    /// Let the next drain run the parked operation without pausing again.
    pub(crate) fn skip_next_breakpoint(&mut self) {
        self.skip_breakpoint_once = true;
    }

    // ---- result & listeners ---------------------------------------------------

    pub(crate) fn set_result(&mut self, output: CommandOutput) {
        self.result = Some(output);
    }

    pub(crate) fn take_result(&mut self) -> Option<CommandOutput> {
        self.result.take()
    }

    pub fn add_close_listener(&mut self, listener: Arc<dyn CloseListener>) {
        self.listeners.push(listener);
    }

    /// Register unless a listener with the same name is already present.
    pub fn add_close_listener_once(&mut self, listener: Arc<dyn CloseListener>) {
        if !self.listeners.iter().any(|l| l.name() == listener.name()) {
            self.listeners.push(listener);
        }
    }

    /// Run another command in this unit of work (or a new one, if the
    /// command's propagation asks for it).
    pub async fn execute_nested<C: Command>(&mut self, command: C) -> EngineResult<C::Output> {
        let services = self.services.clone();
        services.executor.execute_nested(self, command).await
    }

    // ---- close ----------------------------------------------------------------

    async fn flush_and_commit(&mut self) -> EngineResult<()> {
        let listeners = self.listeners.clone();
        for listener in &listeners {
            listener.closing(self).await?;
        }
        // Listeners registered while closing still get the later callbacks.
        let listeners = self.listeners.clone();

        let summary = self.flush().await?;
        for listener in &listeners {
            listener.after_session_flush(self).await?;
        }

        let (main, named): (Vec<_>, Vec<_>) = self
            .sessions
            .iter_mut()
            .partition(|(kind, _)| kind.as_str() == DEFAULT_STORE);
        let mut committed: Vec<&str> = Vec::new();
        for (kind, session) in named.into_iter().chain(main) {
            if let Err(e) = session.commit().await {
                if !committed.is_empty() {
                    warn!(
                        context_id = %self.id,
                        store = %kind,
                        committed = ?committed,
                        error = %e,
                        "Commit failed after other stores committed"
                    );
                }
                return Err(e);
            }
            trace!(context_id = %self.id, store = %kind, "Storage session committed");
            committed.push(kind.as_str());
        }
        debug!(
            context_id = %self.id,
            command = %self.command_name,
            writes = summary.writes(),
            "Unit of work committed"
        );
        Ok(())
    }

    /// Flush, commit and notify listeners; roll back on any failure.
    pub(crate) async fn close(mut self) -> EngineResult<()> {
        match self.flush_and_commit().await {
            Ok(()) => {
                let listeners = std::mem::take(&mut self.listeners);
                for listener in &listeners {
                    listener.closed(&self).await;
                }
                Ok(())
            }
            Err(e) => {
                self.abort(&e).await;
                Err(e)
            }
        }
    }

    /// Notify `close_failure` and roll back every open session.
    pub(crate) async fn abort(&mut self, error: &EngineError) {
        let listeners = std::mem::take(&mut self.listeners);
        for listener in &listeners {
            listener.close_failure(self, error).await;
        }
        for (kind, session) in self.sessions.iter_mut() {
            if let Err(e) = session.rollback().await {
                warn!(context_id = %self.id, store = %kind, error = %e, "Rollback failed");
            }
        }
        debug!(
            context_id = %self.id,
            command = %self.command_name,
            error = %error,
            "Unit of work rolled back"
        );
    }
}

impl fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandContext")
            .field("id", &self.id)
            .field("command", &self.command_name)
            .field("cache", &self.cache)
            .field("sessions", &self.sessions.keys().collect::<Vec<_>>())
            .field("agenda", &self.agenda)
            .finish()
    }
}

/// Default matcher of [`CommandContext::query_cached`].
struct QueryMatcher {
    query: RecordQuery,
}

impl EntityMatcher for QueryMatcher {
    fn is_retained(
        &self,
        _store_results: &[EntityKey],
        cache: &EntityCache,
        candidate: &dyn DynEntity,
    ) -> bool {
        if cache.is_deleted(&candidate.key()) {
            return false;
        }
        candidate
            .snapshot()
            .map(|data| self.query.matches(&data))
            .unwrap_or(false)
    }
}
