//! Process definitions and the repository they are loaded from.
//!
//! Definitions are plain data deployed as YAML:
//!
//! ```yaml
//! key: order
//! nodes:
//!   - id: start
//!     kind: { type: start_event }
//!   - id: charge
//!     kind:
//!       type: service_task
//!       delegate: charge-card
//!       error_boundary: { error_code: DECLINED, target: declined }
//!   - id: done
//!     kind: { type: end_event }
//! flows:
//!   - { id: f1, source: start, target: charge }
//!   - { id: f2, source: charge, target: done }
//! ```

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Debug;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

/// Where a business fault raised by a service task continues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBoundary {
    /// Fault code to catch; `None` catches every business fault.
    #[serde(default)]
    pub error_code: Option<String>,
    /// Node the execution continues at.
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    StartEvent,
    EndEvent,
    UserTask {
        #[serde(default)]
        assignee: Option<String>,
    },
    ServiceTask {
        delegate: String,
        #[serde(default)]
        error_boundary: Option<ErrorBoundary>,
    },
    ExclusiveGateway {
        /// Flow taken when no condition holds.
        #[serde(default)]
        default_flow: Option<String>,
    },
    ParallelGateway,
    TimerCatchEvent {
        duration_ms: u64,
    },
    ExternalWorkerTask {
        topic: String,
    },
}

impl NodeKind {
    /// Nodes where an execution stops until something external happens.
    pub fn is_wait_state(&self) -> bool {
        matches!(
            self,
            NodeKind::UserTask { .. }
                | NodeKind::TimerCatchEvent { .. }
                | NodeKind::ExternalWorkerTask { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub kind: NodeKind,
    /// Continue through an async job instead of inline.
    #[serde(default)]
    pub async_before: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: String,
    pub source: String,
    pub target: String,
    /// Jinja expression evaluated against the process variables.
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub key: String,
    /// Assigned at deployment.
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub name: Option<String>,
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub flows: Vec<SequenceFlow>,
}

impl ProcessDefinition {
    pub fn from_yaml(source: &str) -> EngineResult<Self> {
        let definition: ProcessDefinition = serde_yaml::from_str(source)?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn node(&self, id: &str) -> EngineResult<&FlowNode> {
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .ok_or_else(|| EngineError::NotFound(format!("node '{}' in '{}'", id, self.key)))
    }

    pub fn start_node(&self) -> EngineResult<&FlowNode> {
        self.nodes
            .iter()
            .find(|n| n.kind == NodeKind::StartEvent)
            .ok_or_else(|| EngineError::Validation(format!("'{}' has no start event", self.key)))
    }

    pub fn outgoing(&self, node_id: &str) -> Vec<&SequenceFlow> {
        self.flows.iter().filter(|f| f.source == node_id).collect()
    }

    pub fn incoming_count(&self, node_id: &str) -> usize {
        self.flows.iter().filter(|f| f.target == node_id).count()
    }

    /// Structural checks: unique ids, one start event, flows and error
    /// boundaries pointing at existing nodes.
    pub fn validate(&self) -> EngineResult<()> {
        if self.key.trim().is_empty() {
            return Err(EngineError::Validation("definition key is empty".to_string()));
        }

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate node id '{}' in '{}'",
                    node.id, self.key
                )));
            }
        }

        let starts = self
            .nodes
            .iter()
            .filter(|n| n.kind == NodeKind::StartEvent)
            .count();
        if starts != 1 {
            return Err(EngineError::Validation(format!(
                "'{}' must have exactly one start event, found {}",
                self.key, starts
            )));
        }

        for flow in &self.flows {
            for end in [&flow.source, &flow.target] {
                if !ids.contains(end.as_str()) {
                    return Err(EngineError::Validation(format!(
                        "flow '{}' references unknown node '{}'",
                        flow.id, end
                    )));
                }
            }
        }

        for node in &self.nodes {
            match &node.kind {
                NodeKind::ServiceTask {
                    error_boundary: Some(boundary),
                    ..
                } if !ids.contains(boundary.target.as_str()) => {
                    return Err(EngineError::Validation(format!(
                        "error boundary of '{}' targets unknown node '{}'",
                        node.id, boundary.target
                    )));
                }
                NodeKind::ExclusiveGateway {
                    default_flow: Some(flow_id),
                } if !self.outgoing(&node.id).iter().any(|f| &f.id == flow_id) => {
                    return Err(EngineError::Validation(format!(
                        "default flow '{}' of '{}' is not an outgoing flow",
                        flow_id, node.id
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Source of versioned process definitions.
pub trait DefinitionRepository: Send + Sync + Debug {
    /// Highest deployed version of `key`.
    fn latest(&self, key: &str) -> EngineResult<Arc<ProcessDefinition>>;

    fn get(&self, key: &str, version: u32) -> EngineResult<Arc<ProcessDefinition>>;
}

/// In-process repository; every deployment gets the next version.
#[derive(Debug, Default)]
pub struct InMemoryDefinitionRepository {
    definitions: RwLock<HashMap<String, BTreeMap<u32, Arc<ProcessDefinition>>>>,
}

impl InMemoryDefinitionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a definition. Returns the assigned version.
    pub fn deploy(&self, mut definition: ProcessDefinition) -> EngineResult<u32> {
        definition.validate()?;
        let mut definitions = self
            .definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let versions = definitions.entry(definition.key.clone()).or_default();
        let version = versions.keys().next_back().copied().unwrap_or(0) + 1;
        definition.version = version;
        info!(key = %definition.key, version, "Process definition deployed");
        versions.insert(version, Arc::new(definition));
        Ok(version)
    }

    pub fn deploy_yaml(&self, source: &str) -> EngineResult<u32> {
        self.deploy(ProcessDefinition::from_yaml(source)?)
    }

    pub fn deploy_file(&self, path: &Path) -> EngineResult<u32> {
        let source = std::fs::read_to_string(path)?;
        self.deploy_yaml(&source).map_err(|e| match e {
            EngineError::Validation(msg) => {
                EngineError::Validation(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Deploy every `*.yaml` / `*.yml` file of a directory, in name order.
    pub fn deploy_dir(&self, dir: &Path) -> EngineResult<usize> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext == "yaml" || ext == "yml")
            })
            .collect();
        paths.sort();
        for path in &paths {
            self.deploy_file(path)?;
        }
        Ok(paths.len())
    }

    pub fn keys(&self) -> Vec<String> {
        let definitions = self
            .definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = definitions.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl DefinitionRepository for InMemoryDefinitionRepository {
    fn latest(&self, key: &str) -> EngineResult<Arc<ProcessDefinition>> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .and_then(|versions| versions.values().next_back().cloned())
            .ok_or_else(|| EngineError::NotFound(format!("process definition '{}'", key)))
    }

    fn get(&self, key: &str, version: u32) -> EngineResult<Arc<ProcessDefinition>> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .and_then(|versions| versions.get(&version).cloned())
            .ok_or_else(|| {
                EngineError::NotFound(format!("process definition '{}' v{}", key, version))
            })
    }
}
