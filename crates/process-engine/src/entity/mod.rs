//! Persistent entities and the per-unit-of-work entity cache.
//!
//! User entity types implement [`PersistentEntity`] (plain serde structs
//! with an id and a revision). The cache works with the object-safe
//! [`DynEntity`] view, which every persistent entity gets for free.

pub mod cache;
pub mod ordering;

pub use cache::{CachedEntity, EntityCache, EntityMatcher, EntityState, FlushSummary};
pub use ordering::FlushOrdering;

use crate::error::{EngineError, EngineResult};
use crate::store::EntityRecord;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::fmt;

const REVISION_FIELD: &str = "revision";

/// Identity of a persistent record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub entity_type: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

/// A record the engine persists.
///
/// The serialized form (minus the `revision` field) is the persistent-state
/// snapshot used for dirty checking. Implementors must serialize to a JSON
/// object and keep their revision in a field named `revision`.
pub trait PersistentEntity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Storage type name. May depend on state (jobs move between buckets).
    fn entity_type(&self) -> &str;

    fn id(&self) -> &str;

    fn revision(&self) -> i64;

    fn set_revision(&mut self, revision: i64);
}

/// Entities whose storage type never changes.
pub trait TypedEntity: PersistentEntity {
    const TYPE: &'static str;
}

/// Object-safe view of a persistent entity used by the cache.
pub trait DynEntity: Send + Sync + 'static {
    fn key(&self) -> EntityKey;

    fn current_revision(&self) -> i64;

    fn assign_revision(&mut self, revision: i64);

    /// Persistent state without the revision.
    fn snapshot(&self) -> EngineResult<Value>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<E: PersistentEntity> DynEntity for E {
    fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type(), self.id())
    }

    fn current_revision(&self) -> i64 {
        self.revision()
    }

    fn assign_revision(&mut self, revision: i64) {
        self.set_revision(revision);
    }

    fn snapshot(&self) -> EngineResult<Value> {
        let mut value = serde_json::to_value(self)?;
        match value.as_object_mut() {
            Some(object) => {
                object.remove(REVISION_FIELD);
            }
            None => {
                return Err(EngineError::Validation(format!(
                    "entity {} does not serialize to an object",
                    self.key()
                )))
            }
        }
        Ok(value)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl dyn DynEntity {
    /// Current state as a storable record.
    pub fn to_record(&self) -> EngineResult<EntityRecord> {
        let key = self.key();
        Ok(EntityRecord {
            entity_type: key.entity_type,
            id: key.id,
            revision: self.current_revision(),
            data: self.snapshot()?,
        })
    }

    pub fn downcast_ref<E: PersistentEntity>(&self) -> Option<&E> {
        self.as_any().downcast_ref::<E>()
    }

    pub fn downcast_mut<E: PersistentEntity>(&mut self) -> Option<&mut E> {
        self.as_any_mut().downcast_mut::<E>()
    }
}

/// Rebuild a typed entity from a stored record.
pub fn decode<E: PersistentEntity>(record: &EntityRecord) -> EngineResult<E> {
    let mut data = record.data.clone();
    if let Some(object) = data.as_object_mut() {
        object.insert(REVISION_FIELD.to_string(), Value::from(record.revision));
    }
    let mut entity: E = serde_json::from_value(data)?;
    entity.set_revision(record.revision);
    Ok(entity)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use serde::Deserialize;

    /// Minimal entity for cache and context tests.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Counter {
        pub id: String,
        pub revision: i64,
        pub value: i64,
        #[serde(default)]
        pub parent: Option<String>,
    }

    impl Counter {
        pub fn new(id: &str, value: i64) -> Self {
            Self {
                id: id.to_string(),
                revision: 0,
                value,
                parent: None,
            }
        }
    }

    impl PersistentEntity for Counter {
        fn entity_type(&self) -> &str {
            Self::TYPE
        }

        fn id(&self) -> &str {
            &self.id
        }

        fn revision(&self) -> i64 {
            self.revision
        }

        fn set_revision(&mut self, revision: i64) {
            self.revision = revision;
        }
    }

    impl TypedEntity for Counter {
        const TYPE: &'static str = "counter";
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::Counter;
    use super::*;

    #[test]
    fn test_snapshot_excludes_revision() {
        let mut counter = Counter::new("c1", 3);
        let before = counter.snapshot().unwrap();
        counter.revision = 9;
        assert_eq!(before, counter.snapshot().unwrap());
        assert!(before.get("revision").is_none());
    }

    #[test]
    fn test_record_round_trip_keeps_revision() {
        let mut counter = Counter::new("c1", 3);
        counter.revision = 4;
        let boxed: Box<dyn DynEntity> = Box::new(counter.clone());
        let record = boxed.to_record().unwrap();
        assert_eq!(record.revision, 4);
        assert_eq!(record.entity_type, "counter");

        let decoded: Counter = decode(&record).unwrap();
        assert_eq!(decoded, counter);
    }
}
