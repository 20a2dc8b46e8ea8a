//! AI queue dispatcher: polls due jobs and drives them through their lifecycle.
//!
//! Each poll cycle:
//! 1. (optional) Reclaim jobs stuck in `processing` past `reclaim_after`
//! 2. Fetch up to `batch_size` due `pending` jobs, highest priority first
//! 3. For each job: reserve rate-limit capacity, claim it (`processing`),
//!    run its handler, then finalize as `completed`, re-armed `pending`,
//!    or `failed`
//!
//! Every transition is persisted before the next job is looked at. A store
//! error aborts the rest of the cycle; the next cycle starts from scratch.
//!
//! Without `reclaim_after`, jobs left in `processing` by a crash stay there
//! until something outside the dispatcher reconciles them.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::DispatcherConfig;
use crate::error::{DatabaseError, Error, HandlerError, JobError, Result};
use crate::limiter::TokenBucket;
use crate::queue::model::JobRecord;
use crate::queue::registry::HandlerRegistry;
use crate::store::{JobFilter, JobOrder, JobStore, JobUpdate};

/// Message stored on jobs reclaimed from a stale `processing` state.
const ABANDONED_MESSAGE: &str = "Abandoned while processing";

/// Summary of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Another cycle held the lock; nothing was done.
    pub skipped: bool,
    /// Due jobs returned by the store.
    pub fetched: usize,
    /// Jobs claimed and handed to a handler.
    pub started: usize,
    pub completed: usize,
    /// Failed attempts re-armed for a later cycle.
    pub retried: usize,
    pub failed: usize,
    /// Jobs left pending because the bucket was short.
    pub deferred: usize,
    /// Stale `processing` jobs returned to the queue or failed.
    pub reclaimed: usize,
}

/// What happened to one fetched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    NotDue,
    Deferred,
    Completed,
    Retried,
    /// Handler ran and the job ended `failed`.
    Failed,
    /// Failed without reaching a handler.
    Rejected,
}

/// Polls the job store and runs due jobs under the rate limit.
pub struct Dispatcher {
    config: DispatcherConfig,
    store: Arc<dyn JobStore>,
    limiter: Arc<TokenBucket>,
    handlers: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    /// Held for the duration of a cycle; cycles never overlap.
    cycle_lock: Mutex<()>,
}

impl Dispatcher {
    /// Create a dispatcher driven by the wall clock.
    ///
    /// Fails with [`Error::Config`] if `config` does not validate.
    pub fn new(
        config: DispatcherConfig,
        store: Arc<dyn JobStore>,
        limiter: Arc<TokenBucket>,
        handlers: Arc<HandlerRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            limiter,
            handlers,
            clock: Arc::new(SystemClock),
            cycle_lock: Mutex::new(()),
        })
    }

    /// Builder: use `clock` for due-time checks and timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn limiter(&self) -> &Arc<TokenBucket> {
        &self.limiter
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Run a single poll cycle.
    ///
    /// Returns a skipped report if another cycle is in progress. A store
    /// error ends the cycle early and is returned; jobs keep the state of
    /// their last successful write.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            debug!("Previous poll cycle still running, skipping");
            return Ok(CycleReport {
                skipped: true,
                ..Default::default()
            });
        };

        let mut report = CycleReport::default();

        if let Some(after) = self.config.reclaim_after {
            report.reclaimed = self.reclaim_stale(after).await?;
        }

        let now = self.clock.now();
        let jobs = self
            .store
            .query_jobs(
                &JobFilter::due(now),
                JobOrder::PriorityThenSchedule,
                self.config.batch_size,
            )
            .await?;

        report.fetched = jobs.len();
        if jobs.is_empty() {
            return Ok(report);
        }

        info!(count = jobs.len(), "Found pending AI jobs");

        for job in jobs {
            let job_id = job.id;
            let outcome = match self.process_job(job).await {
                Ok(outcome) => outcome,
                Err(Error::Job(e)) => {
                    warn!(job_id = %job_id, error = %e, "Skipping job");
                    continue;
                }
                Err(e) => return Err(e),
            };

            match outcome {
                Outcome::NotDue => {}
                Outcome::Deferred => report.deferred += 1,
                Outcome::Completed => {
                    report.started += 1;
                    report.completed += 1;
                }
                Outcome::Retried => {
                    report.started += 1;
                    report.retried += 1;
                }
                Outcome::Failed => {
                    report.started += 1;
                    report.failed += 1;
                }
                Outcome::Rejected => report.failed += 1,
            }
        }

        debug!(?report, "Poll cycle finished");
        Ok(report)
    }

    /// Treat `processing` jobs claimed more than `older_than` ago as failed
    /// attempts: re-arm them immediately, or fail them if out of attempts.
    ///
    /// Returns the number of jobs touched.
    pub async fn reclaim_stale(&self, older_than: Duration) -> Result<usize> {
        let now = self.clock.now();
        let cutoff = before(now, older_than);
        let stale = self
            .store
            .query_jobs(
                &JobFilter::stale_processing(cutoff),
                JobOrder::Created,
                self.config.batch_size,
            )
            .await?;

        let mut reclaimed = 0;
        for mut job in stale {
            let attempts = job.attempts + 1;
            let update = if attempts >= self.config.max_attempts {
                JobUpdate::fail(Some(attempts), ABANDONED_MESSAGE, now)
            } else {
                JobUpdate::retry(attempts, now)
            };
            match self.persist(&mut job, update).await {
                Ok(()) => {}
                Err(Error::Job(e)) => {
                    warn!(job_id = %job.id, error = %e, "Skipping stale job");
                    continue;
                }
                Err(e) => return Err(e),
            }
            warn!(
                job_id = %job.id,
                attempts,
                status = %job.status,
                "Reclaimed job stuck in processing"
            );
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    /// Start the background polling loop.
    ///
    /// The first cycle runs one `poll_interval` after start. Stopping takes
    /// effect between cycles; an in-flight cycle is allowed to finish.
    pub fn spawn(self: Arc<Self>) -> DispatcherHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = self.config.poll_interval;

        let handle = tokio::spawn(async move {
            info!(interval = ?interval, "AI queue dispatcher started");

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip immediate first tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }

                if let Err(e) = self.run_cycle().await {
                    warn!(error = %e, "Poll cycle aborted");
                }
            }

            info!("AI queue dispatcher stopped");
        });

        DispatcherHandle {
            shutdown_tx,
            handle,
        }
    }

    // ── Per-job processing ──────────────────────────────────────────

    async fn process_job(&self, mut job: JobRecord) -> Result<Outcome> {
        let now = self.clock.now();

        let Some(scheduled_at) = job.scheduled_at else {
            self.fail(&mut job, None, "Invalid scheduled_at time").await?;
            return Ok(Outcome::Rejected);
        };
        if scheduled_at > now {
            return Ok(Outcome::NotDue);
        }

        let Some(handler) = self.handlers.get(&job.job_type).await else {
            let reason = JobError::UnknownType {
                job_type: job.job_type.to_string(),
            };
            self.fail(&mut job, None, reason.to_string()).await?;
            return Ok(Outcome::Rejected);
        };

        let cost = job.cost(self.config.default_cost);
        match self.limiter.try_consume(cost) {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %job.id, cost, "Rate limit reached, job will wait");
                return Ok(Outcome::Deferred);
            }
            Err(e) => {
                // Waiting cannot make an oversized or invalid cost fit.
                self.fail(&mut job, None, e.to_string()).await?;
                return Ok(Outcome::Rejected);
            }
        }

        self.persist(&mut job, JobUpdate::start(now)).await?;
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts + 1,
            "Processing job"
        );

        let result = AssertUnwindSafe(handler.handle(&job))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HandlerError::Transient(panic_message(&*panic))));

        let finished = self.clock.now();
        match result {
            Ok(()) => {
                self.persist(&mut job, JobUpdate::complete(finished)).await?;
                info!(job_id = %job.id, "Job completed");
                Ok(Outcome::Completed)
            }
            Err(err) => {
                let attempts = job.attempts + 1;
                if !err.is_retryable() || attempts >= self.config.max_attempts {
                    self.persist(
                        &mut job,
                        JobUpdate::fail(Some(attempts), err.to_string(), finished),
                    )
                    .await?;
                    error!(job_id = %job.id, attempts, error = %err, "Job failed");
                    Ok(Outcome::Failed)
                } else {
                    let next_run = after(finished, self.config.retry_backoff);
                    self.persist(&mut job, JobUpdate::retry(attempts, next_run))
                        .await?;
                    warn!(
                        job_id = %job.id,
                        attempts,
                        error = %err,
                        retry_at = %next_run,
                        "Job attempt failed, will retry"
                    );
                    Ok(Outcome::Retried)
                }
            }
        }
    }

    /// Terminal failure that did not come from running a handler.
    async fn fail(
        &self,
        job: &mut JobRecord,
        attempts: Option<u32>,
        message: impl Into<String>,
    ) -> Result<()> {
        let message = message.into();
        self.persist(job, JobUpdate::fail(attempts, message.clone(), self.clock.now()))
            .await?;
        error!(job_id = %job.id, job_type = %job.job_type, error = %message, "Job failed");
        Ok(())
    }

    /// Validate and write a transition, then mirror it on the local copy.
    ///
    /// The write only lands if the stored status still matches the local
    /// copy; losing that race surfaces as `JobError::InvalidTransition`.
    async fn persist(&self, job: &mut JobRecord, update: JobUpdate) -> Result<()> {
        let update = update.expecting(job.status);
        if let Some(target) = update.status
            && !job.status.can_transition_to(target)
        {
            return Err(JobError::InvalidTransition {
                id: job.id,
                state: job.status.to_string(),
                target: target.to_string(),
            }
            .into());
        }
        if let Some(attempts) = update.attempts
            && attempts < job.attempts
        {
            return Err(JobError::InvalidTransition {
                id: job.id,
                state: format!("attempts={}", job.attempts),
                target: format!("attempts={attempts}"),
            }
            .into());
        }

        match self.store.update_job(job.id, &update).await {
            Ok(()) => {}
            Err(DatabaseError::Conflict { actual, .. }) => {
                return Err(JobError::InvalidTransition {
                    id: job.id,
                    state: actual,
                    target: update
                        .status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "updated".to_string()),
                }
                .into());
            }
            Err(e) => return Err(e.into()),
        }
        update.apply_to(job, self.clock.now());
        Ok(())
    }
}

/// Control handle for a spawned dispatcher loop.
///
/// Dropping the handle also stops the loop after its current cycle.
pub struct DispatcherHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Signal the loop to stop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Dispatcher task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

fn after(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn before(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("Handler panicked: {detail}")
}
