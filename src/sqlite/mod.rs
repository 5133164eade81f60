//! SQLite engine for [`JobStore`].
//!
//! One connection guarded by an async mutex serializes access inside a
//! process. Claims additionally run under `BEGIN IMMEDIATE`, which takes the
//! database write lock before the candidate is read, so several processes
//! pointing at the same file still never hand out the same job twice.

mod schema;


use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::sync::Mutex;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::QueueError;
use crate::store::{JobStore, DEFAULT_LIST_LIMIT, DEFAULT_LOG_LIMIT};
use crate::types::{
    FailureOutcome, Job, JobState, JobStats, LeasePolicy, LogLine, NewJob, QueueConfig,
    DEFAULT_TIMEOUT_SECS,
};

use schema::{job_from_row, timestamp, JOB_COLUMNS, SCHEMA};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// An implementation of [`JobStore`] backed by SQLite
#[derive(Clone)]
pub struct SqliteStore<C = SystemClock> {
    conn: Arc<Mutex<Connection>>,
    clock: C,
}

impl SqliteStore<SystemClock> {
    /// Open (or create) the database at `path`, creating parent directories as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, QueueError> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))
            .context("Failed to enable WAL journal")?;
        conn.execute_batch(SCHEMA)
            .context("Failed to run migrations")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: SystemClock,
        })
    }
}

impl<C: Clock> SqliteStore<C> {
    /// Swap the time source, keeping the same connection.
    pub fn with_clock<C2: Clock>(self, clock: C2) -> SqliteStore<C2> {
        SqliteStore {
            conn: self.conn,
            clock,
        }
    }

    // Stored timestamps have millisecond precision; keep returned values equal to stored ones.
    fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(3)
    }
}

#[async_trait]
impl<C: Clock> JobStore for SqliteStore<C> {
    #[instrument(skip_all, err, fields(job_id))]
    async fn enqueue(&self, job: NewJob) -> Result<Job, QueueError> {
        if job.command.trim().is_empty() {
            return Err(QueueError::EmptyCommand);
        }
        let now = self.now().timestamp_millis();
        let id = Uuid::new_v4().to_string();
        tracing::Span::current().record("job_id", id.as_str());

        let conn = self.conn.lock().await;
        let max_retries = match job.max_retries {
            Some(max_retries) => max_retries,
            None => load_config(&conn)?.max_retries,
        };
        let timeout_seconds = job.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS);
        conn.execute(
            "INSERT INTO jobs (id, command, state, attempts, max_retries, timeout_seconds, error, created_at, updated_at)
             VALUES (?1, ?2, 'pending', 0, ?3, ?4, '', ?5, ?5)",
            params![id, job.command, max_retries, timeout_seconds, now],
        )
        .context("Failed to add job to the queue")?;
        fetch_job(&conn, &id)
    }

    #[instrument(skip_all, err, fields(job_id = id))]
    async fn get_job(&self, id: &str) -> Result<Job, QueueError> {
        let conn = self.conn.lock().await;
        fetch_job(&conn, id)
    }

    #[instrument(skip(self), err)]
    async fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        let limit = effective_limit(limit, DEFAULT_LIST_LIMIT);
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE (?1 IS NULL OR state = ?1)
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2"
            ))
            .context("Failed to prepare job listing")?;
        let rows = stmt
            .query_map(params![state.map(|s| s.as_str()), limit], job_from_row)
            .context("Failed to list jobs")?;
        let jobs = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read job row")?;
        Ok(jobs)
    }

    #[instrument(skip_all, err)]
    async fn job_stats(&self) -> Result<JobStats, QueueError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")
            .context("Failed to prepare stats query")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .context("Failed to count jobs")?;

        let mut stats = JobStats::default();
        for row in rows {
            let (state, count) = row.context("Failed to read stats row")?;
            match state.parse::<JobState>() {
                Ok(state) => stats.set(state, u64::try_from(count).unwrap_or_default()),
                Err(e) => warn!(error = %e, "skipping jobs with unknown state"),
            }
        }
        Ok(stats)
    }

    #[instrument(skip_all, err, fields(job_id))]
    async fn acquire_job(&self, lease: &LeasePolicy) -> Result<Option<Job>, QueueError> {
        let now = self.now();
        let mut conn = self.conn.lock().await;
        let claimed = claim_next(&mut conn, now, lease)?;
        if let Some(job) = &claimed {
            tracing::Span::current().record("job_id", job.id.as_str());
        }
        Ok(claimed)
    }

    #[instrument(skip_all, err, fields(job_id = id))]
    async fn set_completed(&self, id: &str) -> Result<(), QueueError> {
        let now = self.now().timestamp_millis();
        let conn = self.conn.lock().await;
        let updated = conn
            .execute(
                "UPDATE jobs
                 SET state = 'completed', error = '', next_retry = NULL,
                     worker_id = NULL, lease_until = NULL, updated_at = ?1
                 WHERE id = ?2 AND state != 'completed'",
                params![now, id],
            )
            .context("Failed to mark job as completed")?;
        if updated == 0 {
            // Already completed, or missing.
            fetch_job(&conn, id)?;
        }
        Ok(())
    }

    #[instrument(skip_all, err, fields(job_id = %job.id, delay = ?delay))]
    async fn fail_or_schedule_backoff(
        &self,
        job: &Job,
        delay: Duration,
        error: &str,
    ) -> Result<FailureOutcome, QueueError> {
        let now = self.now();
        let mut conn = self.conn.lock().await;
        record_failure(&mut conn, &job.id, now, delay, error)
    }

    #[instrument(skip_all, err)]
    async fn requeue_expired_leases(&self) -> Result<u64, QueueError> {
        let now = self.now().timestamp_millis();
        let conn = self.conn.lock().await;
        let reclaimed = conn
            .execute(
                "UPDATE jobs
                 SET state = 'pending', worker_id = NULL, lease_until = NULL, updated_at = ?1
                 WHERE state = 'processing' AND lease_until IS NOT NULL AND lease_until <= ?1",
                params![now],
            )
            .context("Failed to requeue expired leases")?;
        Ok(reclaimed as u64)
    }

    #[instrument(skip_all, err, fields(job_id = id))]
    async fn retry_dlq_job(&self, id: &str) -> Result<(), QueueError> {
        let now = self.now().timestamp_millis();
        let conn = self.conn.lock().await;
        let updated = conn
            .execute(
                "UPDATE jobs
                 SET state = 'pending', attempts = 0, error = '', next_retry = NULL, updated_at = ?1
                 WHERE id = ?2 AND state = 'dead'",
                params![now, id],
            )
            .context("Failed to retry dead job")?;
        if updated == 0 {
            let job = fetch_job(&conn, id)?;
            return Err(QueueError::InvalidState {
                id: job.id,
                actual: job.state,
                expected: JobState::Dead,
            });
        }
        Ok(())
    }

    #[instrument(skip(self, chunk), err)]
    async fn append_log(&self, job_id: &str, stream: &str, chunk: &str) -> Result<(), QueueError> {
        let now = self.now().timestamp_millis();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO job_logs (job_id, ts, stream, chunk) VALUES (?1, ?2, ?3, ?4)",
            params![job_id, now, stream, chunk],
        )
        .context("Failed to append job log")?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_logs(&self, job_id: &str, limit: usize) -> Result<Vec<LogLine>, QueueError> {
        let limit = effective_limit(limit, DEFAULT_LOG_LIMIT);
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT job_id, ts, stream, chunk FROM job_logs
                 WHERE job_id = ?1
                 ORDER BY ts ASC, id ASC
                 LIMIT ?2",
            )
            .context("Failed to prepare log query")?;
        let rows = stmt
            .query_map(params![job_id, limit], |row| {
                Ok(LogLine {
                    job_id: row.get(0)?,
                    ts: timestamp(row, 1)?,
                    stream: row.get(2)?,
                    chunk: row.get(3)?,
                })
            })
            .context("Failed to read job logs")?;
        let lines = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read log row")?;
        Ok(lines)
    }

    #[instrument(skip_all, err)]
    async fn get_config(&self) -> Result<QueueConfig, QueueError> {
        let conn = self.conn.lock().await;
        load_config(&conn)
    }

    #[instrument(skip(self), err)]
    async fn set_config(&self, key: &str, value: &str) -> Result<(), QueueError> {
        QueueConfig::default().apply(key, value)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value.trim()],
        )
        .context("Failed to store config value")?;
        Ok(())
    }
}

/// Read the oldest due candidate, then flip it to `processing` only if it is
/// still `pending`. Both steps share one IMMEDIATE transaction.
fn claim_next(
    conn: &mut Connection,
    now: DateTime<Utc>,
    lease: &LeasePolicy,
) -> Result<Option<Job>, QueueError> {
    let now_ms = now.timestamp_millis();
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("Failed to begin claim transaction")?;

    let candidate = tx
        .query_row(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE state = 'pending' AND (next_retry IS NULL OR next_retry <= ?1)
                 ORDER BY created_at ASC, rowid ASC
                 LIMIT 1"
            ),
            params![now_ms],
            job_from_row,
        )
        .optional()
        .context("Failed to check out a job from the queue")?;
    let Some(candidate) = candidate else {
        return Ok(None);
    };

    let worker_id = Uuid::new_v4().to_string();
    let lease_until = after(now, lease.lease_for(&candidate)).timestamp_millis();
    let updated = tx
        .execute(
            "UPDATE jobs
             SET state = 'processing', worker_id = ?1, lease_until = ?2, next_retry = NULL, updated_at = ?3
             WHERE id = ?4 AND state = 'pending'",
            params![worker_id, lease_until, now_ms, candidate.id],
        )
        .context("Failed to claim job")?;
    if updated != 1 {
        return Ok(None);
    }

    let claimed = tx
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![candidate.id],
            job_from_row,
        )
        .context("Failed to reload claimed job")?;
    tx.commit().context("Failed to commit claim")?;
    Ok(Some(claimed))
}

fn record_failure(
    conn: &mut Connection,
    id: &str,
    now: DateTime<Utc>,
    delay: Duration,
    error: &str,
) -> Result<FailureOutcome, QueueError> {
    let now_ms = now.timestamp_millis();
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("Failed to begin failure transaction")?;

    let (attempts, max_retries): (u32, u32) = tx
        .query_row(
            "SELECT attempts, max_retries FROM jobs WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .context("Failed to load job attempts")?
        .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;

    let attempts = attempts.saturating_add(1);
    let outcome = if attempts > max_retries {
        tx.execute(
            "UPDATE jobs
             SET state = 'dead', attempts = ?1, error = ?2, next_retry = NULL,
                 worker_id = NULL, lease_until = NULL, updated_at = ?3
             WHERE id = ?4",
            params![attempts, error, now_ms, id],
        )
        .context("Failed to mark job as dead")?;
        FailureOutcome::Dead { attempts }
    } else {
        let next_retry = after(now, delay);
        tx.execute(
            "UPDATE jobs
             SET state = 'pending', attempts = ?1, error = ?2, next_retry = ?3,
                 worker_id = NULL, lease_until = NULL, updated_at = ?4
             WHERE id = ?5",
            params![attempts, error, next_retry.timestamp_millis(), now_ms, id],
        )
        .context("Failed to reschedule job")?;
        FailureOutcome::Rescheduled {
            attempts,
            next_retry,
        }
    };
    tx.commit().context("Failed to commit job failure")?;
    Ok(outcome)
}

fn fetch_job(conn: &Connection, id: &str) -> Result<Job, QueueError> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
        params![id],
        job_from_row,
    )
    .optional()
    .context("Failed to load job")?
    .ok_or_else(|| QueueError::JobNotFound(id.to_string()))
}

fn load_config(conn: &Connection) -> Result<QueueConfig, QueueError> {
    let mut stmt = conn
        .prepare("SELECT key, value FROM config")
        .context("Failed to prepare config query")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .context("Failed to read config")?;

    let mut config = QueueConfig::default();
    for row in rows {
        let (key, value) = row.context("Failed to read config row")?;
        if let Err(e) = config.apply(&key, &value) {
            warn!(%key, %value, error = %e, "ignoring stored config override");
        }
    }
    Ok(config)
}

fn effective_limit(limit: usize, default: usize) -> i64 {
    let limit = if limit == 0 { default } else { limit };
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
