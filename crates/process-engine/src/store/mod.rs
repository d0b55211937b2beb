//! Storage façade.
//!
//! The engine persists every entity as an [`EntityRecord`]: a type name, an
//! id, an optimistic-lock revision and a JSON payload. Backends implement
//! [`Storage`] (a session factory) and [`StorageSession`] (one transaction).
//!
//! Updates and deletes are conditional on the expected revision and report
//! the number of affected rows. Zero affected rows means another writer got
//! there first; the caller decides whether that is a conflict or a lost
//! race to be skipped.

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

use crate::error::EngineResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt::Debug;

/// One persisted row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_type: String,
    pub id: String,
    pub revision: i64,
    pub data: Value,
}

impl EntityRecord {
    /// Top-level field of the payload, `None` when absent.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }
}

/// Filter over top-level payload fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Field equals the value. A missing field equals `null`.
    Eq { field: String, value: Value },
    /// Field is missing or `null`.
    IsNull { field: String },
    /// Field is a number not greater than `value`.
    AtMost { field: String, value: i64 },
    /// At least one of the nested conditions holds.
    Any(Vec<Condition>),
}

impl Condition {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self::IsNull {
            field: field.into(),
        }
    }

    pub fn at_most(field: impl Into<String>, value: i64) -> Self {
        Self::AtMost {
            field: field.into(),
            value,
        }
    }

    /// Evaluate the condition against a record payload.
    pub fn matches(&self, data: &Value) -> bool {
        match self {
            Condition::Eq { field, value } => {
                data.get(field).unwrap_or(&Value::Null) == value
            }
            Condition::IsNull { field } => data.get(field).map_or(true, Value::is_null),
            Condition::AtMost { field, value } => data
                .get(field)
                .and_then(Value::as_i64)
                .is_some_and(|v| v <= *value),
            Condition::Any(conditions) => conditions.iter().any(|c| c.matches(data)),
        }
    }
}

/// Query against one entity type.
///
/// Results are ordered by `order_by` (a numeric payload field, ascending,
/// nulls first) and then by id, so acquisition batches are deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordQuery {
    pub entity_type: String,
    pub conditions: Vec<Condition>,
    pub order_by: Option<String>,
    pub limit: Option<usize>,
}

impl RecordQuery {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            conditions: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Condition::eq(field, value))
    }

    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(field.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// True when every condition holds for the payload.
    pub fn matches(&self, data: &Value) -> bool {
        self.conditions.iter().all(|c| c.matches(data))
    }

    /// Sort records the way every backend must return them.
    pub fn sort(&self, records: &mut [EntityRecord]) {
        let field = self.order_by.as_deref();
        records.sort_by(|a, b| compare_by(field, &a.data, &a.id, &b.data, &b.id));
    }
}

/// Ordering shared by backends and cache-aware queries.
pub(crate) fn compare_by(
    field: Option<&str>,
    a_data: &Value,
    a_id: &str,
    b_data: &Value,
    b_id: &str,
) -> Ordering {
    let by_field = match field {
        Some(field) => {
            let a = a_data.get(field).and_then(Value::as_i64);
            let b = b_data.get(field).and_then(Value::as_i64);
            // None sorts before Some, which gives nulls first.
            a.cmp(&b)
        }
        None => Ordering::Equal,
    };
    by_field.then_with(|| a_id.cmp(b_id))
}

/// A backing store able to open transactional sessions.
#[async_trait]
pub trait Storage: Send + Sync + Debug {
    /// Backend name for logs.
    fn name(&self) -> &str;

    async fn open_session(&self) -> EngineResult<Box<dyn StorageSession>>;
}

/// One open transaction against a store.
///
/// Every write is visible to later reads of the same session and to no
/// other session. Nothing is durable until [`commit`](StorageSession::commit);
/// dropping a session without committing discards its writes. A conditional
/// write against a row another open session has already written affects
/// zero rows.
#[async_trait]
pub trait StorageSession: Send + Sync {
    async fn find(&mut self, entity_type: &str, id: &str) -> EngineResult<Option<EntityRecord>>;

    async fn query(&mut self, query: &RecordQuery) -> EngineResult<Vec<EntityRecord>>;

    /// Insert a new row. A duplicate (type, id) is a concurrency conflict.
    async fn insert(&mut self, record: &EntityRecord) -> EngineResult<()>;

    /// Replace the row if its stored revision equals `expected_revision`.
    /// Returns the number of rows written (0 or 1).
    async fn update(&mut self, record: &EntityRecord, expected_revision: i64) -> EngineResult<u64>;

    /// Delete the row if its stored revision equals `expected_revision`.
    async fn delete(&mut self, entity_type: &str, id: &str, expected_revision: i64)
        -> EngineResult<u64>;

    async fn commit(&mut self) -> EngineResult<()>;

    async fn rollback(&mut self) -> EngineResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, data: Value) -> EntityRecord {
        EntityRecord {
            entity_type: "job".into(),
            id: id.into(),
            revision: 1,
            data,
        }
    }

    #[test]
    fn test_condition_matches() {
        let data = json!({"owner": null, "due": 100, "state": "open"});
        assert!(Condition::is_null("owner").matches(&data));
        assert!(Condition::is_null("missing").matches(&data));
        assert!(Condition::at_most("due", 100).matches(&data));
        assert!(!Condition::at_most("due", 99).matches(&data));
        assert!(!Condition::at_most("state", 1000).matches(&data));
        assert!(Condition::eq("state", "open").matches(&data));
        assert!(Condition::eq("missing", Value::Null).matches(&data));
        assert!(Condition::Any(vec![
            Condition::eq("state", "closed"),
            Condition::at_most("due", 200),
        ])
        .matches(&data));
    }

    #[test]
    fn test_sort_nulls_first_then_id() {
        let query = RecordQuery::new("job").order_by("due");
        let mut records = vec![
            record("c", json!({"due": 5})),
            record("b", json!({"due": null})),
            record("a", json!({"due": 5})),
            record("d", json!({"due": 1})),
        ];
        query.sort(&mut records);
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "d", "a", "c"]);
    }
}
