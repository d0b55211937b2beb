//! Runtime state of process instances.
//!
//! A process instance is a root [`ExecutionEntity`] (its id is the process
//! instance id). Tokens moving through the graph are child executions of
//! that root. Variables live on the root only.

use crate::entity::{PersistentEntity, TypedEntity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub mod fields {
    pub const PROCESS_INSTANCE_ID: &str = "process_instance_id";
    pub const CURRENT_NODE: &str = "current_node";
    pub const IS_ACTIVE: &str = "is_active";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEntity {
    pub id: String,
    pub revision: i64,
    pub process_instance_id: String,
    /// `None` for the process instance itself.
    #[serde(default)]
    pub parent_id: Option<String>,
    pub definition_key: String,
    pub definition_version: u32,
    #[serde(default)]
    pub business_key: Option<String>,
    #[serde(default)]
    pub current_node: Option<String>,
    /// False while waiting (user task, timer, external work, join).
    pub is_active: bool,
    #[serde(default)]
    pub is_suspended: bool,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl ExecutionEntity {
    /// A new process instance (root execution).
    pub fn new_process_instance(
        definition_key: &str,
        definition_version: u32,
        business_key: Option<String>,
        variables: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            process_instance_id: id.clone(),
            id,
            revision: 0,
            parent_id: None,
            definition_key: definition_key.to_string(),
            definition_version,
            business_key,
            current_node: None,
            is_active: true,
            is_suspended: false,
            variables,
            started_at: now,
            ended_at: None,
        }
    }

    /// A new token of this process instance positioned at `node_id`.
    pub fn new_child(&self, node_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            revision: 0,
            process_instance_id: self.process_instance_id.clone(),
            parent_id: Some(self.process_instance_id.clone()),
            definition_key: self.definition_key.clone(),
            definition_version: self.definition_version,
            business_key: None,
            current_node: Some(node_id.to_string()),
            is_active: true,
            is_suspended: self.is_suspended,
            variables: Map::new(),
            started_at: now,
            ended_at: None,
        }
    }

    pub fn is_process_instance(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Overwrite variables with the given values.
    pub fn merge_variables(&mut self, values: &Map<String, Value>) {
        for (name, value) in values {
            self.variables.insert(name.clone(), value.clone());
        }
    }
}

impl PersistentEntity for ExecutionEntity {
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

impl TypedEntity for ExecutionEntity {
    const TYPE: &'static str = "execution";
}

/// An open user task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEntity {
    pub id: String,
    pub revision: i64,
    pub execution_id: String,
    pub process_instance_id: String,
    pub element_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl TaskEntity {
    pub fn new(execution: &ExecutionEntity, element_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            revision: 0,
            execution_id: execution.id.clone(),
            process_instance_id: execution.process_instance_id.clone(),
            element_id: element_id.to_string(),
            name: None,
            assignee: None,
            created_at: now,
        }
    }
}

impl PersistentEntity for TaskEntity {
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

impl TypedEntity for TaskEntity {
    const TYPE: &'static str = "task";
}
