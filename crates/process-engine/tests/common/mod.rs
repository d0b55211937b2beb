#![allow(dead_code)]

use std::sync::Arc;

use process_engine::entity::{PersistentEntity, TypedEntity};
use process_engine::runtime::InMemoryDefinitionRepository;
use process_engine::{EngineConfig, InMemoryStore, ProcessEngine, ProcessEngineBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub id: String,
    pub revision: i64,
    pub value: i64,
}

impl Counter {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            revision: 0,
            value: 0,
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

pub fn test_config(node_id: &str) -> EngineConfig {
    EngineConfig {
        node_id: node_id.to_string(),
        async_poll_interval_ms: 20,
        timer_poll_interval_ms: 20,
        conflict_retry_wait_ms: 1,
        shutdown_grace_secs: 5,
        ..EngineConfig::default()
    }
}

/// Engine over `store` with the given definitions deployed.
pub fn build_engine(
    store: &Arc<InMemoryStore>,
    definitions: &[&str],
    config: EngineConfig,
    configure: impl FnOnce(ProcessEngineBuilder) -> ProcessEngineBuilder,
) -> ProcessEngine {
    let repository = Arc::new(InMemoryDefinitionRepository::new());
    for source in definitions {
        repository.deploy_yaml(source).expect("definition deploys");
    }
    configure(
        ProcessEngine::builder(config)
            .store(store.clone())
            .definitions(repository),
    )
    .build()
    .expect("engine builds")
}

pub fn vars(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
