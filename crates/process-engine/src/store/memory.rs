//! In-memory reference store.
//!
//! Committed rows live in per-type ordered maps behind one mutex. A session
//! keeps its writes in a private overlay until commit, so other sessions
//! only ever see committed rows. Writing a row claims it for the session;
//! a row claimed by another session is treated like a revision mismatch
//! (zero rows affected), the same answer a row-locking database gives once
//! the other transaction commits. Commit applies the overlay and releases
//! the claims in one step under the mutex; rollback or drop just releases
//! them.

use super::{EntityRecord, RecordQuery, Storage, StorageSession};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type RowKey = (String, String);

#[derive(Debug, Default)]
struct Tables {
    rows: HashMap<String, BTreeMap<String, EntityRecord>>,
    /// Rows with uncommitted writes, by owning session.
    claims: HashMap<RowKey, u64>,
    next_session: u64,
    writes: u64,
}

impl Tables {
    fn table(&mut self, entity_type: &str) -> &mut BTreeMap<String, EntityRecord> {
        self.rows.entry(entity_type.to_string()).or_default()
    }

    fn committed(&self, entity_type: &str, id: &str) -> Option<&EntityRecord> {
        self.rows.get(entity_type).and_then(|t| t.get(id))
    }

    fn claimed_by_other(&self, key: &RowKey, session: u64) -> bool {
        self.claims.get(key).is_some_and(|owner| *owner != session)
    }

    fn release(&mut self, session: u64) {
        self.claims.retain(|_, owner| *owner != session);
    }
}

/// Shared in-memory store. Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of committed row writes since the store was created.
    pub fn write_count(&self) -> u64 {
        self.lock().writes
    }

    /// Current committed rows of one type, ordered by id.
    pub fn rows(&self, entity_type: &str) -> Vec<EntityRecord> {
        self.lock()
            .rows
            .get(entity_type)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, entity_type: &str, id: &str) -> Option<EntityRecord> {
        self.lock().committed(entity_type, id).cloned()
    }
}

#[async_trait]
impl Storage for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn open_session(&self) -> EngineResult<Box<dyn StorageSession>> {
        let id = {
            let mut tables = self.lock();
            tables.next_session += 1;
            tables.next_session
        };
        Ok(Box::new(InMemorySession {
            id,
            tables: self.tables.clone(),
            pending: BTreeMap::new(),
        }))
    }
}

struct InMemorySession {
    id: u64,
    tables: Arc<Mutex<Tables>>,
    /// Uncommitted writes; `None` marks a delete.
    pending: BTreeMap<RowKey, Option<EntityRecord>>,
}

impl InMemorySession {
    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key(entity_type: &str, id: &str) -> RowKey {
        (entity_type.to_string(), id.to_string())
    }

    /// The row as this session sees it.
    fn visible(&self, tables: &Tables, key: &RowKey) -> Option<EntityRecord> {
        match self.pending.get(key) {
            Some(pending) => pending.clone(),
            None => tables.committed(&key.0, &key.1).cloned(),
        }
    }

    /// Stage a write if the visible revision matches and no other session
    /// holds the row.
    fn write_if(
        &mut self,
        key: RowKey,
        expected_revision: i64,
        value: Option<EntityRecord>,
    ) -> u64 {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        if tables.claimed_by_other(&key, self.id) {
            return 0;
        }
        let current = match self.pending.get(&key) {
            Some(pending) => pending.as_ref().map(|r| r.revision),
            None => tables.committed(&key.0, &key.1).map(|r| r.revision),
        };
        if current != Some(expected_revision) {
            return 0;
        }
        tables.claims.insert(key.clone(), self.id);
        drop(tables);
        self.pending.insert(key, value);
        1
    }

    fn discard(&mut self) {
        self.pending.clear();
        let id = self.id;
        self.lock().release(id);
    }
}

#[async_trait]
impl StorageSession for InMemorySession {
    async fn find(&mut self, entity_type: &str, id: &str) -> EngineResult<Option<EntityRecord>> {
        let tables = self.lock();
        Ok(self.visible(&tables, &Self::key(entity_type, id)))
    }

    async fn query(&mut self, query: &RecordQuery) -> EngineResult<Vec<EntityRecord>> {
        let mut visible: BTreeMap<String, EntityRecord> = self
            .lock()
            .rows
            .get(&query.entity_type)
            .cloned()
            .unwrap_or_default();
        for ((entity_type, id), pending) in &self.pending {
            if entity_type != &query.entity_type {
                continue;
            }
            match pending {
                Some(record) => {
                    visible.insert(id.clone(), record.clone());
                }
                None => {
                    visible.remove(id);
                }
            }
        }

        let mut records: Vec<EntityRecord> = visible
            .into_values()
            .filter(|r| query.matches(&r.data))
            .collect();
        query.sort(&mut records);
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn insert(&mut self, record: &EntityRecord) -> EngineResult<()> {
        let key = Self::key(&record.entity_type, &record.id);
        {
            let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
            let exists = match self.pending.get(&key) {
                Some(pending) => pending.is_some(),
                None => tables.committed(&key.0, &key.1).is_some(),
            };
            if exists || tables.claimed_by_other(&key, self.id) {
                return Err(EngineError::conflict(
                    &record.entity_type,
                    &record.id,
                    "row already exists",
                ));
            }
            tables.claims.insert(key.clone(), self.id);
        }
        self.pending.insert(key, Some(record.clone()));
        Ok(())
    }

    async fn update(&mut self, record: &EntityRecord, expected_revision: i64) -> EngineResult<u64> {
        let key = Self::key(&record.entity_type, &record.id);
        Ok(self.write_if(key, expected_revision, Some(record.clone())))
    }

    async fn delete(
        &mut self,
        entity_type: &str,
        id: &str,
        expected_revision: i64,
    ) -> EngineResult<u64> {
        Ok(self.write_if(Self::key(entity_type, id), expected_revision, None))
    }

    async fn commit(&mut self) -> EngineResult<()> {
        let pending = std::mem::take(&mut self.pending);
        let mut tables = self.lock();
        for ((entity_type, id), value) in pending {
            match value {
                Some(record) => {
                    tables.table(&entity_type).insert(id, record);
                }
                None => {
                    tables.table(&entity_type).remove(&id);
                }
            }
            tables.writes += 1;
        }
        tables.release(self.id);
        Ok(())
    }

    async fn rollback(&mut self) -> EngineResult<()> {
        self.discard();
        Ok(())
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        self.discard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Condition;
    use serde_json::json;

    fn record(id: &str, revision: i64, data: serde_json::Value) -> EntityRecord {
        EntityRecord {
            entity_type: "job".into(),
            id: id.into(),
            revision,
            data,
        }
    }

    #[tokio::test]
    async fn test_insert_and_commit() {
        let store = InMemoryStore::new();
        let mut session = store.open_session().await.unwrap();
        session.insert(&record("j1", 1, json!({"due": 5}))).await.unwrap();
        session.commit().await.unwrap();
        drop(session);

        assert_eq!(store.get("job", "j1").unwrap().revision, 1);
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_insert_conflicts() {
        let store = InMemoryStore::new();
        let mut session = store.open_session().await.unwrap();
        session.insert(&record("j1", 1, json!({}))).await.unwrap();
        let err = session.insert(&record("j1", 1, json!({}))).await.unwrap_err();
        assert!(err.is_concurrency_conflict());
    }

    #[tokio::test]
    async fn test_conditional_update_and_delete() {
        let store = InMemoryStore::new();
        let mut session = store.open_session().await.unwrap();
        session.insert(&record("j1", 1, json!({"n": 1}))).await.unwrap();

        assert_eq!(session.update(&record("j1", 2, json!({"n": 2})), 1).await.unwrap(), 1);
        assert_eq!(session.update(&record("j1", 2, json!({"n": 3})), 1).await.unwrap(), 0);
        assert_eq!(session.delete("job", "j1", 1).await.unwrap(), 0);
        assert_eq!(session.delete("job", "j1", 2).await.unwrap(), 1);
        assert!(session.find("job", "j1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rollback_restores_rows() {
        let store = InMemoryStore::new();
        let mut setup = store.open_session().await.unwrap();
        setup.insert(&record("j1", 1, json!({"n": 1}))).await.unwrap();
        setup.commit().await.unwrap();

        let mut session = store.open_session().await.unwrap();
        session.update(&record("j1", 2, json!({"n": 2})), 1).await.unwrap();
        session.insert(&record("j2", 1, json!({}))).await.unwrap();
        session.delete("job", "j1", 2).await.unwrap();
        session.rollback().await.unwrap();

        let j1 = store.get("job", "j1").unwrap();
        assert_eq!(j1.revision, 1);
        assert_eq!(j1.data, json!({"n": 1}));
        assert!(store.get("job", "j2").is_none());
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_private() {
        let store = InMemoryStore::new();
        let mut setup = store.open_session().await.unwrap();
        setup.insert(&record("j1", 1, json!({"owner": null}))).await.unwrap();
        setup.commit().await.unwrap();

        let mut a = store.open_session().await.unwrap();
        let mut b = store.open_session().await.unwrap();
        assert_eq!(a.update(&record("j1", 2, json!({"owner": "a"})), 1).await.unwrap(), 1);
        assert_eq!(a.find("job", "j1").await.unwrap().unwrap().revision, 2);

        // B still sees the committed row and cannot write over A's claim.
        let seen = b.find("job", "j1").await.unwrap().unwrap();
        assert_eq!(seen.revision, 1);
        assert_eq!(b.update(&record("j1", 2, json!({"owner": "b"})), 1).await.unwrap(), 0);
        assert_eq!(b.update(&record("j1", 3, json!({"owner": "b"})), 2).await.unwrap(), 0);
        assert_eq!(b.delete("job", "j1", 1).await.unwrap(), 0);
        assert!(b.insert(&record("j1", 1, json!({}))).await.unwrap_err().is_concurrency_conflict());
        assert_eq!(store.get("job", "j1").unwrap().revision, 1);
        b.commit().await.unwrap();

        a.commit().await.unwrap();
        let j1 = store.get("job", "j1").unwrap();
        assert_eq!(j1.revision, 2);
        assert_eq!(j1.data, json!({"owner": "a"}));
    }

    #[tokio::test]
    async fn test_rollback_keeps_other_sessions_commits() {
        let store = InMemoryStore::new();
        let mut setup = store.open_session().await.unwrap();
        setup.insert(&record("j1", 1, json!({"owner": null}))).await.unwrap();
        setup.commit().await.unwrap();

        let mut a = store.open_session().await.unwrap();
        let mut b = store.open_session().await.unwrap();
        assert_eq!(a.update(&record("j1", 2, json!({"owner": "a"})), 1).await.unwrap(), 1);
        // Lost race: B cannot build on A's uncommitted revision.
        assert_eq!(b.update(&record("j1", 3, json!({"owner": "b"})), 2).await.unwrap(), 0);
        a.rollback().await.unwrap();

        // Once A is gone B wins against the committed revision and keeps it.
        assert_eq!(b.update(&record("j1", 2, json!({"owner": "b"})), 1).await.unwrap(), 1);
        b.commit().await.unwrap();
        drop(a);

        let j1 = store.get("job", "j1").unwrap();
        assert_eq!(j1.revision, 2);
        assert_eq!(j1.data, json!({"owner": "b"}));
    }

    #[tokio::test]
    async fn test_query_sees_own_pending_writes_only() {
        let store = InMemoryStore::new();
        let mut a = store.open_session().await.unwrap();
        let mut b = store.open_session().await.unwrap();
        a.insert(&record("j1", 1, json!({"due": 1}))).await.unwrap();

        let query = RecordQuery::new("job");
        assert_eq!(a.query(&query).await.unwrap().len(), 1);
        assert!(b.query(&query).await.unwrap().is_empty());
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_without_commit_discards() {
        let store = InMemoryStore::new();
        {
            let mut session = store.open_session().await.unwrap();
            session.insert(&record("j1", 1, json!({}))).await.unwrap();
        }
        assert!(store.rows("job").is_empty());
    }

    #[tokio::test]
    async fn test_query_filters_orders_and_limits() {
        let store = InMemoryStore::new();
        let mut session = store.open_session().await.unwrap();
        session.insert(&record("a", 1, json!({"due": 30}))).await.unwrap();
        session.insert(&record("b", 1, json!({"due": 10}))).await.unwrap();
        session.insert(&record("c", 1, json!({"due": 99}))).await.unwrap();
        session.insert(&record("d", 1, json!({"due": 20}))).await.unwrap();

        let query = RecordQuery::new("job")
            .filter(Condition::at_most("due", 50))
            .order_by("due")
            .limit(2);
        let ids: Vec<_> = session
            .query(&query)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["b", "d"]);
    }
}
