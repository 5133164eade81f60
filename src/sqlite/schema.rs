use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::Row;

use crate::types::Job;

/// Timestamps are stored as Unix milliseconds so ordering and lease
/// comparisons happen on integers.
pub(crate) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id              TEXT PRIMARY KEY,
    command         TEXT NOT NULL,
    state           TEXT NOT NULL,
    attempts        INTEGER NOT NULL DEFAULT 0,
    max_retries     INTEGER NOT NULL DEFAULT 3,
    timeout_seconds INTEGER NOT NULL DEFAULT 30,
    error           TEXT NOT NULL DEFAULT '',
    next_retry      INTEGER,
    worker_id       TEXT,
    lease_until     INTEGER,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_state_next ON jobs(state, next_retry, created_at);
CREATE INDEX IF NOT EXISTS idx_jobs_lease ON jobs(state, lease_until);

CREATE TABLE IF NOT EXISTS config (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS job_logs (
    id     INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    ts     INTEGER NOT NULL,
    stream TEXT NOT NULL,
    chunk  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_job_logs_job_ts ON job_logs(job_id, ts);
";

pub(crate) const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, timeout_seconds, \
     error, next_retry, worker_id, lease_until, created_at, updated_at";

pub(crate) fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let state: String = row.get(2)?;
    Ok(Job {
        id: row.get(0)?,
        command: row.get(1)?,
        state: state
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?,
        attempts: row.get(3)?,
        max_retries: row.get(4)?,
        timeout_seconds: row.get(5)?,
        error: row.get(6)?,
        next_retry: optional_timestamp(row, 7)?,
        worker_id: row.get(8)?,
        lease_until: optional_timestamp(row, 9)?,
        created_at: timestamp(row, 10)?,
        updated_at: timestamp(row, 11)?,
    })
}

pub(crate) fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    from_millis(millis).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

fn optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let millis: Option<i64> = row.get(idx)?;
    millis
        .map(|millis| from_millis(millis).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis)))
        .transpose()
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}
