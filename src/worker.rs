//! Poll loop that claims jobs, runs them and reports the outcome.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::backoff::{self, DEFAULT_BACKOFF_BASE};
use crate::error::{ExecutionError, QueueError};
use crate::executor::{run_shell, CommandOutput};
use crate::store::JobStore;
use crate::types::{FailureOutcome, Job, LeasePolicy};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerOptions {
    pub poll_interval: Duration,
    pub backoff_base: f64,
    pub lease: LeasePolicy,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(300),
            backoff_base: DEFAULT_BACKOFF_BASE,
            lease: LeasePolicy::default(),
        }
    }
}

/// What a single poll tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    Completed {
        job_id: String,
    },
    Rescheduled {
        job_id: String,
        attempts: u32,
        next_retry: DateTime<Utc>,
    },
    Dead {
        job_id: String,
        attempts: u32,
    },
    /// Shutdown killed the command. The job keeps its lease until the reaper
    /// returns it to the queue.
    Abandoned {
        job_id: String,
    },
}

pub struct Worker<S: ?Sized> {
    name: String,
    store: Arc<S>,
    options: WorkerOptions,
    cancel: CancellationToken,
}

impl<S: JobStore + ?Sized> Worker<S> {
    pub fn new(
        name: impl Into<String>,
        store: Arc<S>,
        options: WorkerOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            options,
            cancel,
        }
    }

    /// Poll until the cancellation token fires.
    pub async fn run(self) {
        info!(worker = %self.name, "worker started");
        let mut ticker = tokio::time::interval(self.options.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.tick().await {
                error!(worker = %self.name, error = %e, "worker tick failed");
            }
        }
        info!(worker = %self.name, "worker stopped");
    }

    /// Claim and process at most one job.
    pub async fn tick(&self) -> Result<TickOutcome, QueueError> {
        match self.store.acquire_job(&self.options.lease).await? {
            Some(job) => self.process(job).await,
            None => Ok(TickOutcome::Idle),
        }
    }

    #[instrument(skip_all, fields(worker = %self.name, job_id = %job.id))]
    async fn process(&self, job: Job) -> Result<TickOutcome, QueueError> {
        let timeout = job.timeout(self.options.lease.default_timeout);
        info!(command = %job.command, attempts = job.attempts, ?timeout, "processing job");

        let result = match run_shell(&job.command, timeout, &self.cancel).await {
            Ok(output) => {
                self.record_output(&job.id, &output).await;
                output.check()
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.store.set_completed(&job.id).await?;
                info!("job completed");
                Ok(TickOutcome::Completed { job_id: job.id })
            }
            Err(ExecutionError::Cancelled) => {
                warn!("shutdown interrupted job, leaving it for the reaper");
                Ok(TickOutcome::Abandoned { job_id: job.id })
            }
            Err(e) => self.record_failure(job, e).await,
        }
    }

    async fn record_failure(
        &self,
        job: Job,
        failure: ExecutionError,
    ) -> Result<TickOutcome, QueueError> {
        let delay = backoff::delay(job.attempts.saturating_add(1), self.options.backoff_base);
        let message = failure.to_string();
        let outcome = self
            .store
            .fail_or_schedule_backoff(&job, delay, &message)
            .await?;

        let attempts = outcome.attempts();
        Ok(match outcome {
            FailureOutcome::Dead { .. } => {
                warn!(attempts, error = %message, "job moved to dead-letter queue");
                TickOutcome::Dead {
                    job_id: job.id,
                    attempts,
                }
            }
            FailureOutcome::Rescheduled { next_retry, .. } => {
                warn!(
                    attempts,
                    max_retries = job.max_retries,
                    ?delay,
                    error = %message,
                    "job failed, retry scheduled"
                );
                TickOutcome::Rescheduled {
                    job_id: job.id,
                    attempts,
                    next_retry,
                }
            }
        })
    }

    // Best effort: losing output must not stop the outcome from being recorded.
    async fn record_output(&self, job_id: &str, output: &CommandOutput) {
        for (stream, chunk) in output.streams() {
            if let Err(e) = self.store.append_log(job_id, stream, chunk).await {
                warn!(stream, error = %e, "failed to append job output");
            }
        }
    }
}
