//! Background job queue.
//!
//! Handlers hand slow work (sending email, building exports) to a single
//! worker task through a bounded channel and return immediately. The worker
//! runs each job on its own task, with at most `workers` jobs in flight.
//!
//! A failing job is run again after an exponential backoff until it has been
//! tried [`RetryPolicy::max_attempts`] times. A job waiting for its retry
//! does not hold a worker slot.
//!
//! Dropping every [`JobQueue`] handle closes the channel; the worker then
//! waits for running jobs, including their pending retries, and exits.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::email::{EmailMessage, Mailer};
use crate::export::{ExportJob, ExportRunner};

/// Jobs that can wait in the queue before enqueueing fails.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Runs per job, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Backoff before the first retry; doubled for every further one.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for a single backoff.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Errors returned when enqueueing.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum JobError {
    /// Too many jobs are waiting.
    #[error("job queue is full")]
    QueueFull,

    /// The worker has stopped.
    #[error("job queue is closed")]
    Closed,
}

/// A unit of background work.
#[derive(Debug, Clone)]
pub enum Job {
    SendEmail(EmailMessage),
    DataExport(ExportJob),
}

impl Job {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SendEmail(_) => "send_email",
            Self::DataExport(_) => "data_export",
        }
    }
}

/// How often, and how patiently, failed jobs are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Runs per job, including the first. Zero is treated as one.
    pub max_attempts: u32,

    /// Backoff after the first failure.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Backoff after `attempt` (1-based) failed: `base_delay * 2^(attempt - 1)`,
    /// capped at [`MAX_RETRY_DELAY`].
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .map_or(MAX_RETRY_DELAY, |delay| delay.min(MAX_RETRY_DELAY))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY)
    }
}

/// Everything a job needs to run.
#[derive(Clone)]
pub struct JobContext {
    pub mailer: Arc<dyn Mailer>,
    pub exports: ExportRunner,
}

/// Handle used to enqueue jobs. Cheap to clone.
#[derive(Debug, Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<Job>,
}

impl JobQueue {
    /// Starts the worker and returns the queue handle plus the worker's
    /// join handle.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn start(context: JobContext, workers: usize) -> (Self, JoinHandle<()>) {
        Self::start_with(
            context,
            workers,
            DEFAULT_QUEUE_CAPACITY,
            RetryPolicy::default(),
        )
    }

    /// Like [`JobQueue::start`] with an explicit queue capacity and retry
    /// policy.
    pub fn start_with(
        context: JobContext,
        workers: usize,
        capacity: usize,
        retry: RetryPolicy,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let retry = RetryPolicy {
            max_attempts: retry.max_attempts.max(1),
            ..retry
        };
        let worker = tokio::spawn(run_worker(receiver, context, workers.max(1), retry));
        info!(
            workers,
            capacity,
            max_attempts = retry.max_attempts,
            "Job queue started"
        );
        (Self { sender }, worker)
    }

    /// Queues a job without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::QueueFull`] when the queue is at capacity and
    /// [`JobError::Closed`] when the worker is gone.
    pub fn enqueue(&self, job: Job) -> Result<(), JobError> {
        let kind = job.kind();
        self.sender.try_send(job).map_err(|err| match err {
            TrySendError::Full(_) => JobError::QueueFull,
            TrySendError::Closed(_) => JobError::Closed,
        })?;
        debug!(kind, "Job enqueued");
        Ok(())
    }
}

async fn run_worker(
    mut receiver: mpsc::Receiver<Job>,
    context: JobContext,
    workers: usize,
    retry: RetryPolicy,
) {
    let permits = Arc::new(Semaphore::new(workers));
    let mut running = JoinSet::new();

    while let Some(job) = receiver.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };

        running.spawn(run_job(
            context.clone(),
            job,
            permits.clone(),
            permit,
            retry,
        ));

        while let Some(finished) = running.try_join_next() {
            if let Err(err) = finished {
                error!(error = %err, "Job task panicked");
            }
        }
    }

    while let Some(finished) = running.join_next().await {
        if let Err(err) = finished {
            error!(error = %err, "Job task panicked");
        }
    }
    info!("Job queue stopped");
}

/// Runs one job, retrying failures. The worker slot is given back while
/// waiting out a backoff.
async fn run_job(
    context: JobContext,
    job: Job,
    permits: Arc<Semaphore>,
    mut permit: OwnedSemaphorePermit,
    retry: RetryPolicy,
) {
    let kind = job.kind();
    let mut attempt = 1;

    loop {
        match execute(&context, &job).await {
            Ok(()) => {
                debug!(kind, attempt, "Job finished");
                return;
            }
            Err(err) if attempt < retry.max_attempts => {
                let delay = retry.delay_after(attempt);
                warn!(
                    kind,
                    attempt,
                    max_attempts = retry.max_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = ?err,
                    "Job failed, retrying"
                );
                drop(permit);
                tokio::time::sleep(delay).await;
                permit = match permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                attempt += 1;
            }
            Err(err) => {
                error!(kind, attempts = attempt, error = ?err, "Job failed permanently");
                return;
            }
        }
    }
}

async fn execute(context: &JobContext, job: &Job) -> anyhow::Result<()> {
    match job {
        Job::SendEmail(message) => context
            .mailer
            .send(message)
            .await
            .with_context(|| format!("sending '{}' to {}", message.subject, message.to)),
        Job::DataExport(export) => context
            .exports
            .run(export)
            .await
            .map(|_| ())
            .with_context(|| format!("export {}", export.job_id)),
    }
}
