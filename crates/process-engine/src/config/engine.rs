//! Engine and job scheduler settings.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Which backing store a node runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Postgres,
}

/// Engine configuration loaded from environment variables.
///
/// Environment variables are prefixed with `ENGINE_`:
/// - `ENGINE_NODE_ID`: Lock owner id of this node (default: random)
/// - `ENGINE_LOCK_DURATION_SECS`: How long an acquired job stays locked (default: 300)
/// - `ENGINE_ASYNC_POLL_INTERVAL_MS`: Async continuation acquisition cadence (default: 1000)
/// - `ENGINE_TIMER_POLL_INTERVAL_MS`: Timer acquisition cadence (default: 1000)
/// - `ENGINE_MAX_JOBS_PER_ACQUISITION`: Acquisition batch size (default: 10)
/// - `ENGINE_MAX_CONCURRENT_JOBS`: Worker pool size (default: 4)
/// - `ENGINE_DEFAULT_JOB_RETRIES`: Retry budget of new jobs (default: 3)
/// - `ENGINE_BACKOFF_*`: Retry backoff (1s initial, x2, capped at 5 minutes)
/// - `ENGINE_STORAGE`: `memory` or `postgres` (default: memory)
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,

    #[serde(default = "default_lock_duration_secs")]
    pub lock_duration_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub async_poll_interval_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub timer_poll_interval_ms: u64,

    #[serde(default = "default_max_jobs_per_acquisition")]
    pub max_jobs_per_acquisition: usize,

    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    #[serde(default = "default_job_retries")]
    pub default_job_retries: u32,

    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Bounded wait for in-flight jobs on shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Attempts for commands that opt into retry on concurrency conflicts
    #[serde(default = "default_conflict_retry_attempts")]
    pub conflict_retry_attempts: u32,

    #[serde(default = "default_conflict_retry_wait_ms")]
    pub conflict_retry_wait_ms: u64,

    /// Directory of YAML process definitions deployed at startup
    #[serde(default)]
    pub definitions_dir: Option<PathBuf>,

    #[serde(default)]
    pub storage: StorageBackend,
}

fn default_node_id() -> String {
    format!("engine-{}", uuid::Uuid::new_v4().simple())
}

fn default_lock_duration_secs() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_jobs_per_acquisition() -> usize {
    10
}

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_job_retries() -> u32 {
    3
}

fn default_backoff_initial_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    300_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_conflict_retry_attempts() -> u32 {
    3
}

fn default_conflict_retry_wait_ms() -> u64 {
    50
}

impl EngineConfig {
    /// Load configuration from `ENGINE_*` environment variables.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("ENGINE_").from_env::<EngineConfig>()
    }

    pub fn lock_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lock_duration_secs as i64)
    }

    pub fn async_poll_interval(&self) -> Duration {
        Duration::from_millis(self.async_poll_interval_ms)
    }

    pub fn timer_poll_interval(&self) -> Duration {
        Duration::from_millis(self.timer_poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn conflict_retry_wait(&self) -> Duration {
        Duration::from_millis(self.conflict_retry_wait_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            lock_duration_secs: default_lock_duration_secs(),
            async_poll_interval_ms: default_poll_interval_ms(),
            timer_poll_interval_ms: default_poll_interval_ms(),
            max_jobs_per_acquisition: default_max_jobs_per_acquisition(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            default_job_retries: default_job_retries(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            conflict_retry_attempts: default_conflict_retry_attempts(),
            conflict_retry_wait_ms: default_conflict_retry_wait_ms(),
            definitions_dir: None,
            storage: StorageBackend::Memory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.node_id.starts_with("engine-"));
        assert_eq!(config.lock_duration(), chrono::Duration::seconds(300));
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.default_job_retries, 3);
        assert_eq!(config.storage, StorageBackend::Memory);
    }

    #[test]
    fn test_node_ids_are_unique() {
        assert_ne!(EngineConfig::default().node_id, EngineConfig::default().node_id);
    }

    #[test]
    fn test_storage_backend_names() {
        let backend: StorageBackend = serde_json::from_str("\"postgres\"").unwrap();
        assert_eq!(backend, StorageBackend::Postgres);
    }
}
