use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::types::{
    FailureOutcome, Job, JobState, JobStats, LeasePolicy, LogLine, NewJob, QueueConfig,
};

/// Rows returned by [`JobStore::list_jobs`] when the caller passes `0`.
pub const DEFAULT_LIST_LIMIT: usize = 50;
/// Lines returned by [`JobStore::get_logs`] when the caller passes `0`.
pub const DEFAULT_LOG_LIMIT: usize = 200;

/// Durable storage for the queue. The store is the single source of truth:
/// workers and the reaper never keep jobs in memory between calls.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Persist a new `pending` job with a generated id.
    ///
    /// `max_retries` falls back to the stored [`QueueConfig`], `timeout_seconds`
    /// to [`DEFAULT_TIMEOUT_SECS`](crate::types::DEFAULT_TIMEOUT_SECS).
    async fn enqueue(&self, job: NewJob) -> Result<Job, QueueError>;

    async fn get_job(&self, id: &str) -> Result<Job, QueueError>;

    /// Newest-first listing, optionally restricted to one state.
    async fn list_jobs(&self, state: Option<JobState>, limit: usize)
        -> Result<Vec<Job>, QueueError>;

    async fn list_dlq_jobs(&self, limit: usize) -> Result<Vec<Job>, QueueError> {
        self.list_jobs(Some(JobState::Dead), limit).await
    }

    async fn job_stats(&self) -> Result<JobStats, QueueError>;

    /// Claim the oldest claimable job and move it to `processing`.
    ///
    /// The candidate is re-checked with a conditional update on
    /// `state = 'pending'` inside one isolated transaction. `Ok(None)` means the
    /// queue had nothing due, or another claimer won the row.
    async fn acquire_job(&self, lease: &LeasePolicy) -> Result<Option<Job>, QueueError>;

    /// Mark a job `completed`. Calling it again is a no-op.
    async fn set_completed(&self, id: &str) -> Result<(), QueueError>;

    /// Record a failed attempt: bump `attempts`, then either dead-letter the job
    /// (once `attempts > max_retries`) or return it to `pending` until `now + delay`.
    async fn fail_or_schedule_backoff(
        &self,
        job: &Job,
        delay: Duration,
        error: &str,
    ) -> Result<FailureOutcome, QueueError>;

    /// Return every `processing` job whose lease has expired to `pending`.
    /// Returns how many jobs were reclaimed.
    async fn requeue_expired_leases(&self) -> Result<u64, QueueError>;

    /// Move a `dead` job back to `pending` with its attempts and error reset.
    async fn retry_dlq_job(&self, id: &str) -> Result<(), QueueError>;

    async fn append_log(&self, job_id: &str, stream: &str, chunk: &str) -> Result<(), QueueError>;

    /// Oldest-first log lines for one job.
    async fn get_logs(&self, job_id: &str, limit: usize) -> Result<Vec<LogLine>, QueueError>;

    /// Built-in defaults overlaid with stored overrides.
    async fn get_config(&self) -> Result<QueueConfig, QueueError>;

    /// Validate and upsert a single config key.
    async fn set_config(&self, key: &str, value: &str) -> Result<(), QueueError>;
}
