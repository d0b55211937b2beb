//! Identity map with dirty tracking.
//!
//! One [`EntityCache`] belongs to exactly one unit of work. It guarantees a
//! single in-memory instance per (type, id), remembers the persistent-state
//! snapshot each entity had when it entered the cache, and at flush time
//! writes only what actually changed.

use super::{DynEntity, EntityKey, FlushOrdering, PersistentEntity};
use crate::error::{EngineError, EngineResult};
use crate::store::StorageSession;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Lifecycle of a cached entity within the unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Read from the store (or already flushed).
    Loaded,
    /// Created in this unit of work, not yet written.
    Inserted,
    /// Scheduled for deletion at flush.
    Deleted,
}

/// An entity plus the snapshot it had when it entered the cache.
pub struct CachedEntity {
    pub entity: Box<dyn DynEntity>,
    pub original: Option<Value>,
    pub state: EntityState,
}

impl CachedEntity {
    /// True when the current state differs from the cached original.
    pub fn is_dirty(&self) -> EngineResult<bool> {
        match self.state {
            EntityState::Inserted | EntityState::Deleted => Ok(true),
            EntityState::Loaded => {
                let current = self.entity.snapshot()?;
                Ok(self.original.as_ref() != Some(&current))
            }
        }
    }
}

impl fmt::Debug for CachedEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedEntity")
            .field("key", &self.entity.key())
            .field("revision", &self.entity.current_revision())
            .field("state", &self.state)
            .finish()
    }
}

/// Retention predicate for cache-aware queries.
///
/// Receives the keys the store returned, the whole cache, and one candidate
/// entity; decides whether the candidate belongs in the merged result.
/// Must be free of side effects.
pub trait EntityMatcher: Send + Sync {
    fn is_retained(
        &self,
        store_results: &[EntityKey],
        cache: &EntityCache,
        candidate: &dyn DynEntity,
    ) -> bool;
}

impl<F> EntityMatcher for F
where
    F: Fn(&[EntityKey], &EntityCache, &dyn DynEntity) -> bool + Send + Sync,
{
    fn is_retained(
        &self,
        store_results: &[EntityKey],
        cache: &EntityCache,
        candidate: &dyn DynEntity,
    ) -> bool {
        self(store_results, cache, candidate)
    }
}

struct CachedResult {
    entity_type: String,
    keys: Vec<EntityKey>,
    matcher: Arc<dyn EntityMatcher>,
}

/// Write counts of one flush.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Loaded entities whose state did not change.
    pub skipped: usize,
}

impl FlushSummary {
    pub fn writes(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

/// Per-unit-of-work identity map.
#[derive(Default)]
pub struct EntityCache {
    entries: HashMap<EntityKey, CachedEntity>,
    results: HashMap<String, CachedResult>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_deleted(&self, key: &EntityKey) -> bool {
        self.entries
            .get(key)
            .is_some_and(|c| c.state == EntityState::Deleted)
    }

    pub fn state(&self, key: &EntityKey) -> Option<EntityState> {
        self.entries.get(key).map(|c| c.state)
    }

    /// Cached instance, including entities scheduled for deletion.
    pub fn find_dyn(&self, key: &EntityKey) -> Option<&dyn DynEntity> {
        self.entries.get(key).map(|c| c.entity.as_ref())
    }

    /// Typed lookup. Deleted entities are reported as absent.
    pub fn find<E: PersistentEntity>(&self, entity_type: &str, id: &str) -> Option<&E> {
        let key = EntityKey::new(entity_type, id);
        self.entries
            .get(&key)
            .filter(|c| c.state != EntityState::Deleted)
            .and_then(|c| c.entity.downcast_ref::<E>())
    }

    pub fn find_mut<E: PersistentEntity>(&mut self, entity_type: &str, id: &str) -> Option<&mut E> {
        let key = EntityKey::new(entity_type, id);
        self.entries
            .get_mut(&key)
            .filter(|c| c.state != EntityState::Deleted)
            .and_then(|c| c.entity.downcast_mut::<E>())
    }

    /// Keys of live (not deleted) cached entities of one type.
    pub fn keys_of_type(&self, entity_type: &str) -> Vec<EntityKey> {
        let mut keys: Vec<EntityKey> = self
            .entries
            .iter()
            .filter(|(k, c)| k.entity_type == entity_type && c.state != EntityState::Deleted)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Register an entity read from the store.
    ///
    /// If the key is already cached the existing instance wins and the
    /// freshly loaded copy is dropped, so callers always observe one object
    /// per identity.
    pub fn put_loaded<E: PersistentEntity>(&mut self, entity: E) -> EngineResult<&mut E> {
        let key = EntityKey::new(entity.entity_type(), entity.id());
        let cached = match self.entries.entry(key.clone()) {
            std::collections::hash_map::Entry::Occupied(occupied) => occupied.into_mut(),
            std::collections::hash_map::Entry::Vacant(vacant) => {
                let original = entity.snapshot()?;
                vacant.insert(CachedEntity {
                    entity: Box::new(entity),
                    original: Some(original),
                    state: EntityState::Loaded,
                })
            }
        };
        cached
            .entity
            .downcast_mut::<E>()
            .ok_or_else(|| EngineError::Internal(format!("cached entity {} has another type", key)))
    }

    /// Register a new entity. Its revision starts at 1.
    ///
    /// Re-inserting an identity deleted earlier in the same unit of work
    /// replaces the stored row instead, so the flush issues an update.
    pub fn insert<E: PersistentEntity>(&mut self, mut entity: E) -> EngineResult<()> {
        let key = EntityKey::new(entity.entity_type(), entity.id());
        if let Some(existing) = self.entries.get_mut(&key) {
            if existing.state != EntityState::Deleted {
                return Err(EngineError::Validation(format!(
                    "entity {} is already part of this unit of work",
                    key
                )));
            }
            entity.set_revision(existing.entity.current_revision());
            existing.entity = Box::new(entity);
            existing.state = EntityState::Loaded;
            return Ok(());
        }
        entity.set_revision(1);
        trace!(entity = %key, "Entity inserted into cache");
        self.entries.insert(
            key,
            CachedEntity {
                entity: Box::new(entity),
                original: None,
                state: EntityState::Inserted,
            },
        );
        Ok(())
    }

    /// Schedule deletion. Returns false when the key is not cached.
    ///
    /// An entity inserted in this unit of work simply disappears.
    pub fn delete(&mut self, key: &EntityKey) -> bool {
        match self.entries.get(key).map(|c| c.state) {
            Some(EntityState::Inserted) => {
                self.entries.remove(key);
                true
            }
            Some(_) => {
                if let Some(cached) = self.entries.get_mut(key) {
                    cached.state = EntityState::Deleted;
                }
                true
            }
            None => false,
        }
    }

    /// Remember a query result and the predicate used to merge later reads.
    pub fn cache_result_list(
        &mut self,
        cache_key: impl Into<String>,
        entity_type: impl Into<String>,
        keys: Vec<EntityKey>,
        matcher: Arc<dyn EntityMatcher>,
    ) {
        self.results.insert(
            cache_key.into(),
            CachedResult {
                entity_type: entity_type.into(),
                keys,
                matcher,
            },
        );
    }

    /// Store keys recorded under `cache_key`.
    pub fn result_list(&self, cache_key: &str) -> Option<&[EntityKey]> {
        self.results.get(cache_key).map(|r| r.keys.as_slice())
    }

    /// Ask the matcher of a cached result whether `candidate` belongs to it.
    ///
    /// Returns false when nothing is cached under `cache_key` or the
    /// candidate has another entity type.
    pub fn has_retained(&self, cache_key: &str, candidate: &dyn DynEntity) -> bool {
        match self.results.get(cache_key) {
            Some(result) if candidate.key().entity_type == result.entity_type => {
                result.matcher.is_retained(&result.keys, self, candidate)
            }
            _ => false,
        }
    }

    /// Write every changed entity through `session`.
    ///
    /// Inserts go first, then optimistic updates, then deletes. Within each
    /// group `ordering` decides which entity types go first. A revision
    /// mismatch is returned as a concurrency conflict and leaves the cache
    /// untouched; the caller is expected to roll back.
    pub async fn flush(
        &mut self,
        session: &mut dyn StorageSession,
        ordering: &FlushOrdering,
    ) -> EngineResult<FlushSummary> {
        let mut summary = FlushSummary::default();
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();

        for (key, cached) in &self.entries {
            match cached.state {
                EntityState::Inserted => inserts.push(key.clone()),
                EntityState::Deleted => deletes.push(key.clone()),
                EntityState::Loaded => {
                    if cached.is_dirty()? {
                        updates.push(key.clone());
                    } else {
                        summary.skipped += 1;
                    }
                }
            }
        }

        ordering.sort_parents_first(&mut inserts);
        ordering.sort_parents_first(&mut updates);
        ordering.sort_children_first(&mut deletes);

        for key in &inserts {
            let record = self.record_of(key)?;
            session.insert(&record).await?;
            summary.inserted += 1;
        }

        let mut written = Vec::with_capacity(updates.len());
        for key in &updates {
            let mut record = self.record_of(key)?;
            let expected = record.revision;
            record.revision = expected + 1;
            if session.update(&record, expected).await? == 0 {
                return Err(EngineError::conflict(
                    &key.entity_type,
                    &key.id,
                    format!("revision {} is stale", expected),
                ));
            }
            written.push((key, record));
            summary.updated += 1;
        }

        for key in &deletes {
            let revision = self
                .entries
                .get(key)
                .map(|c| c.entity.current_revision())
                .unwrap_or_default();
            if session.delete(&key.entity_type, &key.id, revision).await? == 0 {
                return Err(EngineError::conflict(
                    &key.entity_type,
                    &key.id,
                    format!("delete expected revision {}", revision),
                ));
            }
            summary.deleted += 1;
        }

        // Every write succeeded; bring the cache in line with the store.
        for key in &inserts {
            if let Some(cached) = self.entries.get_mut(key) {
                cached.original = Some(cached.entity.snapshot()?);
                cached.state = EntityState::Loaded;
            }
        }
        for (key, record) in written {
            if let Some(cached) = self.entries.get_mut(key) {
                cached.entity.assign_revision(record.revision);
                cached.original = Some(record.data);
            }
        }
        for key in &deletes {
            self.entries.remove(key);
        }

        if summary.writes() > 0 {
            debug!(
                inserted = summary.inserted,
                updated = summary.updated,
                deleted = summary.deleted,
                skipped = summary.skipped,
                "Entity cache flushed"
            );
        }
        Ok(summary)
    }

    fn record_of(&self, key: &EntityKey) -> EngineResult<crate::store::EntityRecord> {
        self.entries
            .get(key)
            .ok_or_else(|| EngineError::Internal(format!("entity {} vanished from cache", key)))?
            .entity
            .to_record()
    }
}

impl fmt::Debug for EntityCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityCache")
            .field("entries", &self.entries.len())
            .field("results", &self.results.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::test_support::Counter;
    use crate::entity::{decode, TypedEntity};
    use crate::store::{InMemoryStore, Storage};

    fn ordering() -> FlushOrdering {
        FlushOrdering::new(["counter"])
    }

    #[test]
    fn test_put_loaded_keeps_first_instance() {
        let mut cache = EntityCache::new();
        cache.put_loaded(Counter::new("c1", 1)).unwrap().value = 10;

        // A second load of the same identity returns the cached object.
        let again = cache.put_loaded(Counter::new("c1", 1)).unwrap();
        assert_eq!(again.value, 10);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_same_reference_for_repeated_lookups() {
        let mut cache = EntityCache::new();
        cache.put_loaded(Counter::new("c1", 1)).unwrap();
        let a = cache.find::<Counter>("counter", "c1").unwrap() as *const Counter;
        let b = cache.find::<Counter>("counter", "c1").unwrap() as *const Counter;
        assert_eq!(a, b);
    }

    #[test]
    fn test_insert_duplicate_rejected() {
        let mut cache = EntityCache::new();
        cache.insert(Counter::new("c1", 1)).unwrap();
        assert!(cache.insert(Counter::new("c1", 2)).is_err());
        assert_eq!(cache.find::<Counter>("counter", "c1").unwrap().revision, 1);
    }

    #[test]
    fn test_delete_inserted_removes_entry() {
        let mut cache = EntityCache::new();
        cache.insert(Counter::new("c1", 1)).unwrap();
        let key = EntityKey::new("counter", "c1");
        assert!(cache.delete(&key));
        assert!(!cache.contains(&key));
        assert!(!cache.delete(&key));
    }

    #[tokio::test]
    async fn test_flush_twice_writes_nothing_second_time() {
        let store = InMemoryStore::new();
        let mut session = store.open_session().await.unwrap();
        let mut cache = EntityCache::new();
        cache.insert(Counter::new("c1", 1)).unwrap();

        let first = cache.flush(session.as_mut(), &ordering()).await.unwrap();
        assert_eq!(first.inserted, 1);

        let writes = store.write_count();
        let second = cache.flush(session.as_mut(), &ordering()).await.unwrap();
        assert_eq!(second.writes(), 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn test_flush_update_bumps_revision() {
        let store = InMemoryStore::new();
        let mut session = store.open_session().await.unwrap();
        let mut cache = EntityCache::new();
        cache.insert(Counter::new("c1", 1)).unwrap();
        cache.flush(session.as_mut(), &ordering()).await.unwrap();

        cache.find_mut::<Counter>("counter", "c1").unwrap().value = 2;
        let summary = cache.flush(session.as_mut(), &ordering()).await.unwrap();
        assert_eq!(summary.updated, 1);
        assert_eq!(cache.find::<Counter>("counter", "c1").unwrap().revision, 2);

        let stored = session.find("counter", "c1").await.unwrap().unwrap();
        assert_eq!(stored.revision, 2);
        assert_eq!(decode::<Counter>(&stored).unwrap().value, 2);
    }

    #[tokio::test]
    async fn test_unchanged_write_is_skipped() {
        let store = InMemoryStore::new();
        let mut session = store.open_session().await.unwrap();
        let mut cache = EntityCache::new();
        cache.insert(Counter::new("c1", 1)).unwrap();
        cache.flush(session.as_mut(), &ordering()).await.unwrap();

        // Assigning the same value is not a change.
        cache.find_mut::<Counter>("counter", "c1").unwrap().value = 1;
        let summary = cache.flush(session.as_mut(), &ordering()).await.unwrap();
        assert_eq!(summary.writes(), 0);
    }

    #[tokio::test]
    async fn test_stale_revision_is_conflict() {
        let store = InMemoryStore::new();
        let mut setup = store.open_session().await.unwrap();
        let mut seed = EntityCache::new();
        seed.insert(Counter::new("c1", 1)).unwrap();
        seed.flush(setup.as_mut(), &ordering()).await.unwrap();
        setup.commit().await.unwrap();

        let record = store.get("counter", "c1").unwrap();
        let mut first = EntityCache::new();
        let mut second = EntityCache::new();
        first.put_loaded(decode::<Counter>(&record).unwrap()).unwrap().value = 5;
        second.put_loaded(decode::<Counter>(&record).unwrap()).unwrap().value = 6;

        let mut s1 = store.open_session().await.unwrap();
        first.flush(s1.as_mut(), &ordering()).await.unwrap();
        s1.commit().await.unwrap();

        let mut s2 = store.open_session().await.unwrap();
        let err = second.flush(s2.as_mut(), &ordering()).await.unwrap_err();
        assert!(err.is_concurrency_conflict());
    }

    #[tokio::test]
    async fn test_delete_flushes_and_evicts() {
        let store = InMemoryStore::new();
        let mut session = store.open_session().await.unwrap();
        let mut cache = EntityCache::new();
        cache.insert(Counter::new("c1", 1)).unwrap();
        cache.flush(session.as_mut(), &ordering()).await.unwrap();

        let key = EntityKey::new(Counter::TYPE, "c1");
        cache.delete(&key);
        assert!(cache.find::<Counter>("counter", "c1").is_none());
        let summary = cache.flush(session.as_mut(), &ordering()).await.unwrap();
        assert_eq!(summary.deleted, 1);
        assert!(!cache.contains(&key));
        assert!(session.find("counter", "c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reinsert_after_delete_updates_row() {
        let store = InMemoryStore::new();
        let mut session = store.open_session().await.unwrap();
        let mut cache = EntityCache::new();
        cache.insert(Counter::new("c1", 1)).unwrap();
        cache.flush(session.as_mut(), &ordering()).await.unwrap();

        let key = EntityKey::new("counter", "c1");
        assert!(cache.delete(&key));
        assert!(cache.find::<Counter>("counter", "c1").is_none());
        cache.insert(Counter::new("c1", 9)).unwrap();
        assert_eq!(cache.state(&key), Some(EntityState::Loaded));

        let summary = cache.flush(session.as_mut(), &ordering()).await.unwrap();
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.deleted, 0);
        let row = session.find("counter", "c1").await.unwrap().unwrap();
        assert_eq!(row.revision, 2);
        assert_eq!(decode::<Counter>(&row).unwrap().value, 9);
    }

    #[test]
    fn test_has_retained_uses_matcher() {
        let mut cache = EntityCache::new();
        cache.put_loaded(Counter::new("c1", 1)).unwrap();
        cache.insert(Counter::new("c2", 7)).unwrap();

        let matcher = |_: &[EntityKey], _: &EntityCache, candidate: &dyn DynEntity| {
            candidate
                .downcast_ref::<Counter>()
                .is_some_and(|c| c.value > 5)
        };
        cache.cache_result_list(
            "big-counters",
            "counter",
            vec![EntityKey::new("counter", "c1")],
            Arc::new(matcher),
        );

        let c1 = cache.find_dyn(&EntityKey::new("counter", "c1")).unwrap();
        let c2 = cache.find_dyn(&EntityKey::new("counter", "c2")).unwrap();
        assert!(!cache.has_retained("big-counters", c1));
        assert!(cache.has_retained("big-counters", c2));
        assert!(!cache.has_retained("unknown", c2));
        assert_eq!(cache.result_list("big-counters").unwrap().len(), 1);
    }
}
