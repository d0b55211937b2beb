//! Job creation and bucket moves inside a unit of work.

use super::{JobBucket, JobEntity, JobRepeat};
use crate::context::{CloseListener, CommandContext};
use crate::error::{EngineError, EngineResult};
use crate::job::entity::fields;
use crate::runtime::jobs::{ASYNC_CONTINUATION, EXTERNAL_WORKER, TRIGGER_TIMER};
use crate::store::RecordQuery;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

/// Wakes the async acquisition loop once the unit of work that created an
/// executable job has committed.
pub(crate) struct JobAddedListener;

pub(crate) const JOB_ADDED_LISTENER: &str = "job-added-hint";

#[async_trait]
impl CloseListener for JobAddedListener {
    fn name(&self) -> &str {
        JOB_ADDED_LISTENER
    }

    async fn closed(&self, ctx: &CommandContext) {
        ctx.services().job_added.notify_one();
    }
}

fn hint_job_added(ctx: &mut CommandContext) {
    ctx.add_close_listener_once(Arc::new(JobAddedListener));
}

/// Execution data every built-in job refers to.
#[derive(Debug, Clone)]
pub struct JobScope {
    pub execution_id: String,
    pub process_instance_id: String,
    pub element_id: String,
}

/// Queue an async continuation of `scope` at its element.
pub fn create_async_continuation(ctx: &mut CommandContext, scope: &JobScope) -> EngineResult<String> {
    let retries = ctx.services().config().default_job_retries;
    let job = JobEntity::new(JobBucket::Executable, ASYNC_CONTINUATION, retries, ctx.now())
        .with_scope(&scope.execution_id, &scope.process_instance_id, &scope.element_id);
    let id = job.id.clone();
    debug!(job_id = %id, execution_id = %scope.execution_id, "Async continuation created");
    ctx.insert(job)?;
    hint_job_added(ctx);
    Ok(id)
}

/// Schedule a timer that triggers `scope` at `due`.
pub fn create_timer(
    ctx: &mut CommandContext,
    scope: &JobScope,
    due: DateTime<Utc>,
    repeat: Option<JobRepeat>,
) -> EngineResult<String> {
    let retries = ctx.services().config().default_job_retries;
    let job = JobEntity::new(JobBucket::Timer, TRIGGER_TIMER, retries, ctx.now())
        .with_scope(&scope.execution_id, &scope.process_instance_id, &scope.element_id)
        .with_due_date(Some(due))
        .with_repeat(repeat);
    let id = job.id.clone();
    debug!(job_id = %id, due = %due, "Timer job created");
    ctx.insert(job)?;
    Ok(id)
}

/// Publish work for external workers subscribed to `topic`.
pub fn create_external(ctx: &mut CommandContext, scope: &JobScope, topic: &str) -> EngineResult<String> {
    let retries = ctx.services().config().default_job_retries;
    let job = JobEntity::new(JobBucket::ExternalWorker, EXTERNAL_WORKER, retries, ctx.now())
        .with_scope(&scope.execution_id, &scope.process_instance_id, &scope.element_id)
        .with_topic(topic);
    let id = job.id.clone();
    ctx.insert(job)?;
    Ok(id)
}

/// Load a job from a bucket; absence is an error.
pub async fn load_job(
    ctx: &mut CommandContext,
    bucket: JobBucket,
    job_id: &str,
) -> EngineResult<JobEntity> {
    ctx.find_as::<JobEntity>(bucket.entity_type(), job_id)
        .await?
        .cloned()
        .ok_or_else(|| EngineError::NotFound(format!("{} '{}'", bucket, job_id)))
}

/// Move a job to another bucket, applying `change` to the moved copy.
///
/// The source row is deleted and a new row inserted into the destination,
/// both as part of the current unit of work.
pub async fn move_job<F>(
    ctx: &mut CommandContext,
    from: JobBucket,
    job_id: &str,
    to: JobBucket,
    change: F,
) -> EngineResult<JobEntity>
where
    F: FnOnce(&mut JobEntity),
{
    let mut job = load_job(ctx, from, job_id).await?;
    ctx.delete_as::<JobEntity>(from.entity_type(), job_id).await?;
    job.bucket = to;
    change(&mut job);
    ctx.insert(job.clone())?;
    if to == JobBucket::Executable {
        hint_job_added(ctx);
    }
    debug!(job_id = %job_id, from = %from, to = %to, "Job moved");
    Ok(job)
}

/// Ids of the jobs in `bucket` matching one payload field.
pub async fn find_job_ids(
    ctx: &mut CommandContext,
    bucket: JobBucket,
    field: &str,
    value: &str,
) -> EngineResult<Vec<String>> {
    let cache_key = format!("jobs:{}:{}={}", bucket, field, value);
    let query = RecordQuery::new(bucket.entity_type()).eq(field, value);
    ctx.query_cached::<JobEntity>(&cache_key, query, None).await
}

/// Delete every job owned by an execution, in any bucket.
pub async fn delete_jobs_for_execution(ctx: &mut CommandContext, execution_id: &str) -> EngineResult<usize> {
    let mut deleted = 0;
    for bucket in JobBucket::ALL {
        for job_id in find_job_ids(ctx, bucket, fields::SCOPE_ID, execution_id).await? {
            if ctx.delete_as::<JobEntity>(bucket.entity_type(), &job_id).await? {
                deleted += 1;
            }
        }
    }
    if deleted > 0 {
        debug!(execution_id = %execution_id, deleted, "Jobs of execution deleted");
    }
    Ok(deleted)
}
