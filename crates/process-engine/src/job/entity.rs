//! Job records and their buckets.

use crate::entity::PersistentEntity;
use chrono::serde::{ts_milliseconds, ts_milliseconds_option};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Payload field names used in job queries.
pub mod fields {
    pub const DUE_DATE: &str = "due_date";
    pub const LOCK_OWNER: &str = "lock_owner";
    pub const LOCK_EXPIRATION: &str = "lock_expiration";
    pub const SCOPE_ID: &str = "scope_id";
    pub const PROCESS_INSTANCE_ID: &str = "process_instance_id";
    pub const TOPIC: &str = "topic";
}

/// Storage bucket of a job. Each bucket is its own entity type, so moving a
/// job between buckets is a delete plus an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobBucket {
    Timer,
    Executable,
    ExternalWorker,
    Suspended,
    DeadLetter,
}

impl JobBucket {
    pub const ALL: [JobBucket; 5] = [
        JobBucket::Timer,
        JobBucket::Executable,
        JobBucket::ExternalWorker,
        JobBucket::Suspended,
        JobBucket::DeadLetter,
    ];

    pub fn entity_type(&self) -> &'static str {
        match self {
            JobBucket::Timer => "timer_job",
            JobBucket::Executable => "executable_job",
            JobBucket::ExternalWorker => "external_worker_job",
            JobBucket::Suspended => "suspended_job",
            JobBucket::DeadLetter => "dead_letter_job",
        }
    }

    /// Buckets the schedulers acquire from.
    pub fn is_acquirable(&self) -> bool {
        matches!(self, JobBucket::Timer | JobBucket::Executable)
    }
}

impl fmt::Display for JobBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entity_type())
    }
}

/// Recurrence of a timer job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRepeat {
    pub interval_ms: u64,
    /// Further occurrences after this one; `None` repeats forever.
    pub remaining: Option<u32>,
}

impl JobRepeat {
    /// Recurrence for the next occurrence, or `None` when exhausted.
    pub fn next(&self) -> Option<JobRepeat> {
        match self.remaining {
            None => Some(*self),
            Some(0) => None,
            Some(n) => Some(JobRepeat {
                interval_ms: self.interval_ms,
                remaining: Some(n - 1),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::milliseconds(self.interval_ms as i64)
    }
}

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEntity {
    pub id: String,
    pub revision: i64,
    pub bucket: JobBucket,
    pub handler_type: String,
    #[serde(default)]
    pub handler_config: Value,
    /// Owning scope (an execution for every built-in handler).
    pub scope_id: Option<String>,
    pub scope_type: Option<String>,
    pub process_instance_id: Option<String>,
    pub element_id: Option<String>,
    #[serde(with = "ts_milliseconds_option")]
    pub due_date: Option<DateTime<Utc>>,
    pub lock_owner: Option<String>,
    #[serde(with = "ts_milliseconds_option")]
    pub lock_expiration: Option<DateTime<Utc>>,
    pub retries: u32,
    /// Failed executions so far.
    pub attempts: u32,
    pub exception_message: Option<String>,
    pub exception_detail: Option<String>,
    pub repeat: Option<JobRepeat>,
    /// Bucket to return to when a suspended job is activated.
    pub suspended_from: Option<JobBucket>,
    pub topic: Option<String>,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl JobEntity {
    pub fn new(
        bucket: JobBucket,
        handler_type: impl Into<String>,
        retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            revision: 0,
            bucket,
            handler_type: handler_type.into(),
            handler_config: Value::Null,
            scope_id: None,
            scope_type: None,
            process_instance_id: None,
            element_id: None,
            due_date: None,
            lock_owner: None,
            lock_expiration: None,
            retries,
            attempts: 0,
            exception_message: None,
            exception_detail: None,
            repeat: None,
            suspended_from: None,
            topic: None,
            created_at: now,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.handler_config = config;
        self
    }

    pub fn with_scope(
        mut self,
        execution_id: impl Into<String>,
        process_instance_id: impl Into<String>,
        element_id: impl Into<String>,
    ) -> Self {
        self.scope_id = Some(execution_id.into());
        self.scope_type = Some("execution".to_string());
        self.process_instance_id = Some(process_instance_id.into());
        self.element_id = Some(element_id.into());
        self
    }

    pub fn with_due_date(mut self, due: Option<DateTime<Utc>>) -> Self {
        self.due_date = due;
        self
    }

    pub fn with_repeat(mut self, repeat: Option<JobRepeat>) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// True when the job has no due date or it has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_date.map_or(true, |due| due <= now)
    }

    /// True when `owner` holds an unexpired lock.
    pub fn is_locked_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.lock_owner.as_deref() == Some(owner)
            && self.lock_expiration.is_some_and(|exp| exp > now)
    }

    pub fn lock(&mut self, owner: &str, until: DateTime<Utc>) {
        self.lock_owner = Some(owner.to_string());
        self.lock_expiration = Some(until);
    }

    pub fn unlock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration = None;
    }
}

impl PersistentEntity for JobEntity {
    fn entity_type(&self) -> &str {
        self.bucket.entity_type()
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{decode, DynEntity};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_due_dates_persist_as_millis() {
        let job = JobEntity::new(JobBucket::Timer, "trigger-timer", 3, now())
            .with_due_date(Some(now()));
        let snapshot = job.snapshot().unwrap();
        assert_eq!(
            snapshot[fields::DUE_DATE].as_i64(),
            Some(now().timestamp_millis())
        );
        assert!(snapshot[fields::LOCK_OWNER].is_null());
    }

    #[test]
    fn test_decode_restores_job() {
        let mut job = JobEntity::new(JobBucket::Executable, "async-continuation", 2, now())
            .with_scope("e1", "p1", "task");
        job.revision = 3;
        let boxed: Box<dyn DynEntity> = Box::new(job.clone());
        let record = boxed.to_record().unwrap();
        assert_eq!(record.entity_type, "executable_job");
        assert_eq!(decode::<JobEntity>(&record).unwrap(), job);
    }

    #[test]
    fn test_lock_ownership() {
        let mut job = JobEntity::new(JobBucket::Executable, "noop", 0, now());
        assert!(job.is_due(now()));
        job.lock("node-a", now() + Duration::seconds(10));
        assert!(job.is_locked_by("node-a", now()));
        assert!(!job.is_locked_by("node-b", now()));
        assert!(!job.is_locked_by("node-a", now() + Duration::seconds(10)));
        job.unlock();
        assert!(job.lock_owner.is_none());
    }

    #[test]
    fn test_repeat_countdown() {
        let repeat = JobRepeat {
            interval_ms: 1000,
            remaining: Some(1),
        };
        let next = repeat.next().unwrap();
        assert_eq!(next.remaining, Some(0));
        assert!(next.next().is_none());
        let forever = JobRepeat {
            interval_ms: 1000,
            remaining: None,
        };
        assert_eq!(forever.next(), Some(forever));
    }
}
