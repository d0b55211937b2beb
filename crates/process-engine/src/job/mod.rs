//! Asynchronous jobs: records, buckets, handlers, lifecycle commands and
//! the background scheduler.

pub mod backoff;
pub mod commands;
pub mod entity;
pub mod handler;
pub mod manager;
pub mod scheduler;

pub use backoff::{BackoffStrategy, ExponentialBackoff, FixedBackoff};
pub use commands::{
    AcquireJobs, CompleteExternalJob, DeleteDeadLetterJob, ExecuteJob, FetchAndLockExternalJobs,
    HandleJobFailure, JobRunOutcome, ListJobs, MoveDeadLetterJobToExecutable,
    MoveTimerToExecutable, UnacquireJob,
};
pub use entity::{JobBucket, JobEntity, JobRepeat};
pub use handler::{create_default_registry, JobHandler, JobHandlerRegistry};
pub use manager::JobScope;
pub use scheduler::JobScheduler;
