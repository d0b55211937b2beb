//! Background job acquisition and execution.
//!
//! Two acquisition loops run per node: one moves due timers into the
//! executable bucket, the other locks executable jobs and hands them to a
//! bounded worker pool. The pool is a semaphore; when every permit is taken
//! the async loop stops acquiring until a worker finishes, so locked jobs
//! never pile up in memory.
//!
//! Each job runs as its own command. Failures are recorded in a separate
//! unit of work so the handler's partial effects are rolled back while the
//! retry bookkeeping is kept.

use super::commands::{
    AcquireJobs, ExecuteJob, HandleJobFailure, JobRunOutcome, MoveTimerToExecutable, UnacquireJob,
};
use super::{JobBucket, JobEntity};
use crate::engine::EngineServices;
use crate::error::{EngineError, EngineResult};
use crate::result_ext::ResultExt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct Running {
    shutdown: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
}

/// Per-node job scheduler.
pub struct JobScheduler {
    services: Arc<EngineServices>,
    permits: Arc<Semaphore>,
    running: Mutex<Option<Running>>,
}

impl JobScheduler {
    pub fn new(services: Arc<EngineServices>) -> Self {
        let workers = services.config().max_concurrent_jobs.max(1);
        Self {
            services,
            permits: Arc::new(Semaphore::new(workers)),
            running: Mutex::new(None),
        }
    }

    /// Lock owner id of this node.
    pub fn owner(&self) -> &str {
        &self.services.config().node_id
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Idle worker slots.
    pub fn available_workers(&self) -> usize {
        self.permits.available_permits()
    }

    /// Spawn the timer and async acquisition loops. No-op when running.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return;
        }

        let (shutdown, rx) = watch::channel(false);
        let timer_loop = tokio::spawn(timer_loop(self.services.clone(), rx.clone()));
        let async_loop = tokio::spawn(async_loop(
            self.services.clone(),
            self.permits.clone(),
            rx,
        ));

        info!(
            node_id = %self.owner(),
            max_concurrent_jobs = self.services.config().max_concurrent_jobs,
            "Job scheduler started"
        );
        *running = Some(Running {
            shutdown,
            loops: vec![timer_loop, async_loop],
        });
    }

    /// Stop acquiring and wait (bounded) for in-flight jobs.
    ///
    /// Jobs still running after the grace period keep their locks and are
    /// picked up by another node once the locks expire.
    pub async fn shutdown(&self) -> EngineResult<()> {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(running) = running else {
            return Ok(());
        };

        let _ = running.shutdown.send(true);
        for handle in running.loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "Acquisition loop ended abnormally");
            }
        }

        let workers = self.services.config().max_concurrent_jobs.max(1) as u32;
        let grace = self.services.config().shutdown_grace();
        match tokio::time::timeout(grace, self.permits.acquire_many(workers)).await {
            Ok(Ok(_all_idle)) => info!(node_id = %self.owner(), "Job scheduler stopped"),
            Ok(Err(e)) => return Err(EngineError::Internal(e.to_string())),
            Err(_) => warn!(
                node_id = %self.owner(),
                in_flight = workers as usize - self.permits.available_permits(),
                "Shutdown grace period elapsed, leaving in-flight jobs to lock expiry"
            ),
        }
        Ok(())
    }

    /// One synchronous acquisition pass: move due timers, then acquire and
    /// run executable jobs inline. Returns the outcome of every job run.
    pub async fn run_once(&self) -> EngineResult<Vec<(String, JobRunOutcome)>> {
        move_due_timers(&self.services).await?;

        let limit = self.services.config().max_jobs_per_acquisition;
        let jobs = acquire(&self.services, JobBucket::Executable, limit).await?;
        let mut outcomes = Vec::with_capacity(jobs.len());
        for job in jobs {
            let outcome = run_job(&self.services, &job.id).await;
            outcomes.push((job.id, outcome));
        }
        Ok(outcomes)
    }
}

async fn acquire(
    services: &Arc<EngineServices>,
    bucket: JobBucket,
    limit: usize,
) -> EngineResult<Vec<JobEntity>> {
    services
        .execute(AcquireJobs {
            bucket,
            owner: services.config().node_id.clone(),
            limit,
        })
        .await
}

/// Move every due timer this node manages to lock into the executable
/// bucket. Returns how many were moved.
async fn move_due_timers(services: &Arc<EngineServices>) -> EngineResult<usize> {
    let limit = services.config().max_jobs_per_acquisition;
    let owner = services.config().node_id.clone();
    let timers = acquire(services, JobBucket::Timer, limit).await?;

    let mut moved = 0;
    for timer in timers {
        let result = services
            .execute(MoveTimerToExecutable {
                job_id: timer.id.clone(),
                owner: owner.clone(),
            })
            .await;
        match result {
            Ok(()) => moved += 1,
            Err(e) => {
                warn!(job_id = %timer.id, error = %e, "Timer could not be moved to executable")
            }
        }
    }
    if moved > 0 {
        debug!(moved, "Due timers moved to executable bucket");
    }
    Ok(moved)
}

/// Execute one locked job and record the outcome.
pub(crate) async fn run_job(services: &Arc<EngineServices>, job_id: &str) -> JobRunOutcome {
    let owner = services.config().node_id.clone();
    let result = services
        .execute(ExecuteJob {
            job_id: job_id.to_string(),
            owner: owner.clone(),
        })
        .await;

    match result {
        Ok(outcome) => outcome,
        Err(EngineError::LockLost { .. }) => {
            warn!(job_id = %job_id, owner = %owner, "Job lock lost, result discarded");
            JobRunOutcome::LockLost
        }
        Err(EngineError::Suspended { context_id, node }) => {
            info!(job_id = %job_id, context_id = %context_id, node = %node, "Job parked at breakpoint");
            JobRunOutcome::Suspended
        }
        Err(e) if e.is_concurrency_conflict() => {
            debug!(job_id = %job_id, error = %e, "Job hit a concurrency conflict, releasing lock");
            let _ = services
                .execute(UnacquireJob {
                    job_id: job_id.to_string(),
                    owner,
                })
                .await
                .log_warn("releasing job lock after conflict");
            JobRunOutcome::Conflict
        }
        Err(e) => {
            let failure = HandleJobFailure {
                job_id: job_id.to_string(),
                owner,
                message: e.to_string(),
                detail: format!("{}: {:?}", e.kind(), e),
            };
            match services.execute(failure).await {
                Ok(outcome) => outcome,
                Err(EngineError::LockLost { .. }) => JobRunOutcome::LockLost,
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "Job failure could not be recorded");
                    JobRunOutcome::Aborted
                }
            }
        }
    }
}

async fn timer_loop(services: Arc<EngineServices>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(services.config().timer_poll_interval());
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        match move_due_timers(&services).await.log("timer acquisition") {
            Ok(moved) if moved > 0 => services.job_added.notify_one(),
            _ => {}
        }
    }
    debug!("Timer acquisition loop stopped");
}

async fn async_loop(
    services: Arc<EngineServices>,
    permits: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(services.config().async_poll_interval());
    let batch = services.config().max_jobs_per_acquisition.max(1);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = services.job_added.notified() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        // Wait for at least one free worker, then take whatever else is idle.
        let first = tokio::select! {
            permit = permits.clone().acquire_owned() => permit,
            _ = shutdown.changed() => break,
        };
        let mut slots: Vec<OwnedSemaphorePermit> = match first {
            Ok(permit) => vec![permit],
            Err(_) => break,
        };
        while slots.len() < batch {
            match permits.clone().try_acquire_owned() {
                Ok(permit) => slots.push(permit),
                Err(_) => break,
            }
        }

        let jobs = match acquire(&services, JobBucket::Executable, slots.len())
            .await
            .log("job acquisition")
        {
            Ok(jobs) => jobs,
            Err(_) => continue,
        };

        let full_batch = jobs.len() == slots.len();
        for (job, permit) in jobs.into_iter().zip(slots) {
            let services = services.clone();
            tokio::spawn(async move {
                // Keep permit until done
                let _permit = permit;
                let outcome = run_job(&services, &job.id).await;
                debug!(job_id = %job.id, outcome = ?outcome, "Job finished");
            });
        }

        // More work is probably waiting; poll again without sleeping.
        if full_batch {
            services.job_added.notify_one();
        }
    }
    debug!("Async acquisition loop stopped");
}
