//! Commands of the job lifecycle: acquisition, execution, failure
//! handling and the manual dead-letter and external-worker actions.

use super::manager::{load_job, move_job};
use super::{JobBucket, JobEntity};
use crate::command::{Command, CommandConfig};
use crate::context::{CloseListener, CommandContext};
use crate::entity::{decode, DynEntity};
use crate::error::{EngineError, EngineResult};
use crate::job::entity::fields;
use crate::runtime::entities::ExecutionEntity;
use crate::runtime::operations::TriggerExecution;
use crate::store::{Condition, RecordQuery};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What happened to one acquired job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobRunOutcome {
    /// Handler succeeded; the job is gone (or rescheduled as a new timer).
    Completed,
    /// Handler failed; retried later.
    Rescheduled {
        retries_left: u32,
        due: DateTime<Utc>,
    },
    /// Handler failed with no retries left.
    DeadLettered,
    /// Another node owns the job now; the result was discarded.
    LockLost,
    /// Concurrency conflict; the lock was released without using a retry.
    Conflict,
    /// A breakpoint parked the job's unit of work.
    Suspended,
    /// The job no longer exists.
    Skipped,
    /// The failure could not be recorded; the lock is left to expire.
    Aborted,
}

/// Lock up to `limit` of the rows returned by `query` with conditional
/// updates. Rows another node locked first are skipped.
async fn lock_candidates(
    ctx: &mut CommandContext,
    query: RecordQuery,
    owner: &str,
    until: DateTime<Utc>,
) -> EngineResult<Vec<JobEntity>> {
    let session = ctx.main_session().await?;
    let candidates = session.query(&query).await?;
    let mut acquired = Vec::with_capacity(candidates.len());

    for record in candidates {
        let mut job: JobEntity = decode(&record)?;
        let expected = job.revision;
        job.lock(owner, until);
        job.revision = expected + 1;
        let updated = (&job as &dyn DynEntity).to_record()?;

        if session.update(&updated, expected).await? == 0 {
            debug!(job_id = %job.id, owner = %owner, "Job locked by another node, skipping");
            continue;
        }
        acquired.push(job);
    }
    Ok(acquired)
}

fn not_locked_query(lock_now: DateTime<Utc>) -> Condition {
    Condition::Any(vec![
        Condition::is_null(fields::LOCK_OWNER),
        Condition::at_most(fields::LOCK_EXPIRATION, lock_now.timestamp_millis()),
    ])
}

/// Lock due, unlocked jobs of one acquirable bucket.
///
/// Due dates are compared against the engine clock, lock expiry against
/// the lock clock.
#[derive(Debug, Clone)]
pub struct AcquireJobs {
    pub bucket: JobBucket,
    pub owner: String,
    pub limit: usize,
}

#[async_trait]
impl Command for AcquireJobs {
    type Output = Vec<JobEntity>;

    fn name(&self) -> &'static str {
        "acquire-jobs"
    }

    fn config(&self) -> CommandConfig {
        CommandConfig::requires_new()
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Self::Output> {
        if !self.bucket.is_acquirable() {
            return Err(EngineError::Validation(format!(
                "jobs in {} are not acquired by the scheduler",
                self.bucket
            )));
        }
        if self.limit == 0 {
            return Ok(Vec::new());
        }

        let now = ctx.now();
        let lock_now = ctx.services().lock_clock().now();
        let until = lock_now + ctx.services().config().lock_duration();
        let query = RecordQuery::new(self.bucket.entity_type())
            .filter(Condition::Any(vec![
                Condition::is_null(fields::DUE_DATE),
                Condition::at_most(fields::DUE_DATE, now.timestamp_millis()),
            ]))
            .filter(not_locked_query(lock_now))
            .order_by(fields::DUE_DATE)
            .limit(self.limit);

        let acquired = lock_candidates(ctx, query, &self.owner, until).await?;
        if !acquired.is_empty() {
            debug!(
                bucket = %self.bucket,
                owner = %self.owner,
                count = acquired.len(),
                "Jobs acquired"
            );
        }
        Ok(acquired)
    }
}

/// Move a locked, due timer into the executable bucket.
#[derive(Debug, Clone)]
pub struct MoveTimerToExecutable {
    pub job_id: String,
    pub owner: String,
}

#[async_trait]
impl Command for MoveTimerToExecutable {
    type Output = ();

    fn name(&self) -> &'static str {
        "move-timer-to-executable"
    }

    fn config(&self) -> CommandConfig {
        CommandConfig::requires_new()
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let lock_now = ctx.services().lock_clock().now();
        let job = load_job(ctx, JobBucket::Timer, &self.job_id).await?;
        if !job.is_locked_by(&self.owner, lock_now) {
            return Err(EngineError::LockLost {
                job_id: self.job_id.clone(),
                owner: self.owner.clone(),
            });
        }
        move_job(
            ctx,
            JobBucket::Timer,
            &self.job_id,
            JobBucket::Executable,
            JobEntity::unlock,
        )
        .await?;
        Ok(())
    }
}

/// Re-validates job ownership right before the executing unit of work
/// flushes, so a result computed after the lock was lost is discarded.
struct JobLockGuard {
    job_id: String,
    owner: String,
    revision: i64,
}

#[async_trait]
impl CloseListener for JobLockGuard {
    fn name(&self) -> &str {
        "job-lock-guard"
    }

    async fn closing(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let lock_now = ctx.services().lock_clock().now();
        let record = ctx
            .find_fresh(JobBucket::Executable.entity_type(), &self.job_id)
            .await?;
        let still_owned = match record {
            Some(record) if record.revision == self.revision => {
                decode::<JobEntity>(&record)?.is_locked_by(&self.owner, lock_now)
            }
            _ => false,
        };
        if still_owned {
            Ok(())
        } else {
            Err(EngineError::LockLost {
                job_id: self.job_id.clone(),
                owner: self.owner.clone(),
            })
        }
    }
}

/// Run one acquired executable job through its handler.
#[derive(Debug, Clone)]
pub struct ExecuteJob {
    pub job_id: String,
    pub owner: String,
}

#[async_trait]
impl Command for ExecuteJob {
    type Output = JobRunOutcome;

    fn name(&self) -> &'static str {
        "execute-job"
    }

    fn config(&self) -> CommandConfig {
        CommandConfig::requires_new()
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<JobRunOutcome> {
        let executable = JobBucket::Executable.entity_type();
        let lock_now = ctx.services().lock_clock().now();
        let job = match ctx.find_as::<JobEntity>(executable, &self.job_id).await? {
            Some(job) => job.clone(),
            None => return Ok(JobRunOutcome::Skipped),
        };
        if !job.is_locked_by(&self.owner, lock_now) {
            return Err(EngineError::LockLost {
                job_id: self.job_id.clone(),
                owner: self.owner.clone(),
            });
        }
        ctx.add_close_listener(Arc::new(JobLockGuard {
            job_id: job.id.clone(),
            owner: self.owner.clone(),
            revision: job.revision,
        }));

        let handler = ctx
            .services()
            .job_handlers()
            .get(&job.handler_type)
            .ok_or_else(|| EngineError::JobFailed {
                job_id: job.id.clone(),
                message: format!("no handler registered for '{}'", job.handler_type),
            })?;

        debug!(job_id = %job.id, handler_type = %job.handler_type, "Executing job");
        handler.execute(&job, ctx).await?;

        // The handler may already have removed the job with its execution.
        ctx.delete_as::<JobEntity>(executable, &job.id).await?;

        if let Some(next_repeat) = job.repeat.and_then(|r| r.next()) {
            let interval = job.repeat.map(|r| r.interval()).unwrap_or_else(Duration::zero);
            let previous_due = job.due_date.unwrap_or_else(|| ctx.now());
            let mut next = JobEntity::new(
                JobBucket::Timer,
                job.handler_type.clone(),
                ctx.services().config().default_job_retries,
                ctx.now(),
            )
            .with_config(job.handler_config.clone())
            .with_due_date(Some(previous_due + interval))
            .with_repeat(Some(next_repeat));
            next.scope_id = job.scope_id.clone();
            next.scope_type = job.scope_type.clone();
            next.process_instance_id = job.process_instance_id.clone();
            next.element_id = job.element_id.clone();
            debug!(job_id = %next.id, due = ?next.due_date, "Recurring timer rescheduled");
            ctx.insert(next)?;
        }
        Ok(JobRunOutcome::Completed)
    }
}

/// Record a failed execution: back off and retry, or dead-letter.
#[derive(Debug, Clone)]
pub struct HandleJobFailure {
    pub job_id: String,
    pub owner: String,
    pub message: String,
    pub detail: String,
}

#[async_trait]
impl Command for HandleJobFailure {
    type Output = JobRunOutcome;

    fn name(&self) -> &'static str {
        "handle-job-failure"
    }

    fn config(&self) -> CommandConfig {
        CommandConfig::requires_new().with_retry_on_conflict()
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<JobRunOutcome> {
        let executable = JobBucket::Executable;
        let job = match ctx.find_as::<JobEntity>(executable.entity_type(), &self.job_id).await? {
            Some(job) => job.clone(),
            None => return Ok(JobRunOutcome::Skipped),
        };
        if job.lock_owner.as_deref() != Some(self.owner.as_str()) {
            return Err(EngineError::LockLost {
                job_id: self.job_id.clone(),
                owner: self.owner.clone(),
            });
        }

        let attempts = job.attempts + 1;
        if job.retries > 0 {
            let delay = ctx.services().backoff().delay(attempts);
            let due = ctx.now() + Duration::milliseconds(delay.as_millis() as i64);
            let retries_left = job.retries - 1;
            if let Some(stored) = ctx
                .find_as::<JobEntity>(executable.entity_type(), &self.job_id)
                .await?
            {
                stored.retries = retries_left;
                stored.attempts = attempts;
                stored.exception_message = Some(self.message.clone());
                stored.exception_detail = Some(self.detail.clone());
                stored.due_date = Some(due);
                stored.unlock();
            }
            warn!(
                job_id = %self.job_id,
                attempts,
                retries_left,
                due = %due,
                error = %self.message,
                "Job failed, retry scheduled"
            );
            return Ok(JobRunOutcome::Rescheduled { retries_left, due });
        }

        let message = self.message.clone();
        let detail = self.detail.clone();
        move_job(
            ctx,
            executable,
            &self.job_id,
            JobBucket::DeadLetter,
            move |dead| {
                dead.attempts = attempts;
                dead.exception_message = Some(message);
                dead.exception_detail = Some(detail);
                dead.due_date = None;
                dead.unlock();
            },
        )
        .await?;
        info!(
            job_id = %self.job_id,
            attempts,
            error = %self.message,
            "Job retries exhausted, moved to dead-letter bucket"
        );
        Ok(JobRunOutcome::DeadLettered)
    }
}

/// Release a lock without consuming a retry.
#[derive(Debug, Clone)]
pub struct UnacquireJob {
    pub job_id: String,
    pub owner: String,
}

#[async_trait]
impl Command for UnacquireJob {
    type Output = bool;

    fn name(&self) -> &'static str {
        "unacquire-job"
    }

    fn config(&self) -> CommandConfig {
        CommandConfig::requires_new().with_retry_on_conflict()
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<bool> {
        let executable = JobBucket::Executable.entity_type();
        match ctx.find_as::<JobEntity>(executable, &self.job_id).await? {
            Some(job) if job.lock_owner.as_deref() == Some(self.owner.as_str()) => {
                job.unlock();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Give a dead-letter job a new retry budget.
#[derive(Debug, Clone)]
pub struct MoveDeadLetterJobToExecutable {
    pub job_id: String,
    pub retries: u32,
}

#[async_trait]
impl Command for MoveDeadLetterJobToExecutable {
    type Output = JobEntity;

    fn name(&self) -> &'static str {
        "move-dead-letter-job-to-executable"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<JobEntity> {
        let retries = self.retries;
        move_job(
            ctx,
            JobBucket::DeadLetter,
            &self.job_id,
            JobBucket::Executable,
            move |job| {
                job.retries = retries;
                job.due_date = None;
                job.unlock();
            },
        )
        .await
    }
}

/// Drop a dead-letter job for good.
#[derive(Debug, Clone)]
pub struct DeleteDeadLetterJob {
    pub job_id: String,
}

#[async_trait]
impl Command for DeleteDeadLetterJob {
    type Output = bool;

    fn name(&self) -> &'static str {
        "delete-dead-letter-job"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<bool> {
        ctx.delete_as::<JobEntity>(JobBucket::DeadLetter.entity_type(), &self.job_id)
            .await
    }
}

/// Lock external-worker jobs of one topic for a worker.
#[derive(Debug, Clone)]
pub struct FetchAndLockExternalJobs {
    pub worker_id: String,
    pub topic: String,
    pub limit: usize,
    pub lock_duration: Duration,
}

#[async_trait]
impl Command for FetchAndLockExternalJobs {
    type Output = Vec<JobEntity>;

    fn name(&self) -> &'static str {
        "fetch-and-lock-external-jobs"
    }

    fn config(&self) -> CommandConfig {
        CommandConfig::requires_new()
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Vec<JobEntity>> {
        let lock_now = ctx.services().lock_clock().now();
        let query = RecordQuery::new(JobBucket::ExternalWorker.entity_type())
            .eq(fields::TOPIC, self.topic.as_str())
            .filter(not_locked_query(lock_now))
            .order_by(fields::DUE_DATE)
            .limit(self.limit);
        lock_candidates(ctx, query, &self.worker_id, lock_now + self.lock_duration).await
    }
}

/// Complete an external-worker job and continue its execution.
#[derive(Debug, Clone)]
pub struct CompleteExternalJob {
    pub job_id: String,
    pub worker_id: String,
    pub variables: Map<String, Value>,
}

#[async_trait]
impl Command for CompleteExternalJob {
    type Output = ();

    fn name(&self) -> &'static str {
        "complete-external-job"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let bucket = JobBucket::ExternalWorker;
        let lock_now = ctx.services().lock_clock().now();
        let job = load_job(ctx, bucket, &self.job_id).await?;
        if !job.is_locked_by(&self.worker_id, lock_now) {
            return Err(EngineError::LockLost {
                job_id: self.job_id.clone(),
                owner: self.worker_id.clone(),
            });
        }
        ctx.delete_as::<JobEntity>(bucket.entity_type(), &self.job_id)
            .await?;

        let execution_id = job.scope_id.ok_or_else(|| {
            EngineError::Validation(format!("external job '{}' has no execution", self.job_id))
        })?;
        let process_instance_id = ctx
            .get::<ExecutionEntity>(&execution_id)
            .await?
            .process_instance_id
            .clone();
        ctx.get::<ExecutionEntity>(&process_instance_id)
            .await?
            .merge_variables(&self.variables);
        ctx.plan(Box::new(TriggerExecution::new(execution_id)));
        Ok(())
    }
}

/// Jobs of one bucket, optionally restricted to a process instance.
#[derive(Debug, Clone)]
pub struct ListJobs {
    pub bucket: JobBucket,
    pub process_instance_id: Option<String>,
}

#[async_trait]
impl Command for ListJobs {
    type Output = Vec<JobEntity>;

    fn name(&self) -> &'static str {
        "list-jobs"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Vec<JobEntity>> {
        let entity_type = self.bucket.entity_type();
        let mut query = RecordQuery::new(entity_type).order_by(fields::DUE_DATE);
        let mut cache_key = format!("jobs:list:{}", self.bucket);
        if let Some(pi) = &self.process_instance_id {
            query = query.eq(fields::PROCESS_INSTANCE_ID, pi.as_str());
            cache_key.push_str(pi);
        }
        let ids = ctx.query_cached::<JobEntity>(&cache_key, query, None).await?;
        Ok(ids
            .iter()
            .filter_map(|id| ctx.cache().find::<JobEntity>(entity_type, id).cloned())
            .collect())
    }
}
