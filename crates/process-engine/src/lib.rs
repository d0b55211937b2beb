//! Process Engine
//!
//! Execution core for long-running processes.
//!
//! This crate provides:
//! - Entity cache with identity map, dirty tracking and optimistic locking
//! - Unit-of-work command context with close listeners
//! - Command executor with an interceptor chain and nested propagation
//! - Operation agenda with breakpoints and business fault guards
//! - Async job scheduler with retries, backoff and dead-lettering
//! - In-memory and PostgreSQL storage backends
//! - A small process runtime (YAML definitions, user/service tasks,
//!   gateways, timers, external workers)

pub mod agenda;
pub mod clock;
pub mod command;
pub mod config;
pub mod context;
pub mod engine;
pub mod entity;
pub mod error;
pub mod job;
pub mod result_ext;
pub mod runtime;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{Command, CommandConfig, Propagation};
pub use config::{DatabaseConfig, EngineConfig, StorageBackend};
pub use context::{CloseListener, CommandContext};
pub use engine::{EngineServices, ProcessEngine, ProcessEngineBuilder, DEFAULT_STORE};
pub use error::{EngineError, EngineResult};
pub use store::{InMemoryStore, PgStore};
