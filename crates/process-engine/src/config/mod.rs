//! Configuration for the process engine.
//!
//! Configuration is read from environment variables with the `envy` crate;
//! every field has a default so an empty environment yields a usable
//! single-node setup backed by the in-memory store.

mod database;
mod engine;

pub use database::DatabaseConfig;
pub use engine::{EngineConfig, StorageBackend};
