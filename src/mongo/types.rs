use anyhow::Context;
use bson::DateTime;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::types::{Job, JobState, LogLine};

/// Document layout of the `queuectl_jobs` collection. `_id` is left to the
/// server so that ties on `created_at` still sort by insertion order.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct JobRow {
    pub jid: String,
    pub command: String,
    pub state: JobState,
    pub attempts: i64,
    pub max_retries: i64,
    pub timeout_seconds: i64,
    pub error: String,
    pub next_retry: Option<DateTime>,
    pub worker_id: Option<String>,
    pub lease_until: Option<DateTime>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            attempts: u32::try_from(row.attempts).context("attempts out of range")?,
            max_retries: u32::try_from(row.max_retries).context("max_retries out of range")?,
            timeout_seconds: u32::try_from(row.timeout_seconds)
                .context("timeout_seconds out of range")?,
            next_retry: row.next_retry.map(to_chrono),
            lease_until: row.lease_until.map(to_chrono),
            created_at: to_chrono(row.created_at),
            updated_at: to_chrono(row.updated_at),
            id: row.jid,
            command: row.command,
            state: row.state,
            error: row.error,
            worker_id: row.worker_id,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct LogRow {
    pub job_id: String,
    pub ts: DateTime,
    pub stream: String,
    pub chunk: String,
}

impl From<LogRow> for LogLine {
    fn from(row: LogRow) -> Self {
        LogLine {
            job_id: row.job_id,
            ts: to_chrono(row.ts),
            stream: row.stream,
            chunk: row.chunk,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ConfigRow {
    pub key: String,
    pub value: String,
}

pub(crate) fn to_bson(at: chrono::DateTime<Utc>) -> DateTime {
    DateTime::from_millis(at.timestamp_millis())
}

// BSON dates cover a wider range than chrono; clamp instead of failing the read.
pub(crate) fn to_chrono(at: DateTime) -> chrono::DateTime<Utc> {
    Utc.timestamp_millis_opt(at.timestamp_millis())
        .single()
        .unwrap_or(if at.timestamp_millis() < 0 {
            chrono::DateTime::<Utc>::MIN_UTC
        } else {
            chrono::DateTime::<Utc>::MAX_UTC
        })
}
