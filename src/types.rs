use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Timeout applied to jobs submitted without one, and to jobs stored with `0`.
pub const DEFAULT_TIMEOUT_SECS: u32 = 30;
/// Headroom added on top of a job's timeout before its lease is considered expired.
pub const DEFAULT_LEASE_GRACE: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    /// Reserved. No transition produces it; it only shows up in stats.
    Failed,
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown job state: {0}")]
pub struct ParseJobStateError(String);

impl FromStr for JobState {
    type Err = ParseJobStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseJobStateError(s.to_string()))
    }
}

/// A shell-command job as persisted by a [`JobStore`](crate::JobStore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_retries: u32,
    pub timeout_seconds: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Per-attempt execution limit, falling back to `default` when the job stores `0`.
    pub fn timeout(&self, default: Duration) -> Duration {
        match self.timeout_seconds {
            0 => default,
            secs => Duration::from_secs(u64::from(secs)),
        }
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.next_retry.map_or(true, |at| at <= now)
    }
}

/// Submission request for [`JobStore::enqueue`](crate::JobStore::enqueue).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub command: String,
    pub max_retries: Option<u32>,
    pub timeout_seconds: Option<u32>,
}

impl NewJob {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn timeout_seconds(mut self, timeout_seconds: u32) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }
}

/// How long a claim stays valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    /// Used for jobs stored with `timeout_seconds = 0`.
    pub default_timeout: Duration,
    pub grace: Duration,
}

impl LeasePolicy {
    pub fn lease_for(&self, job: &Job) -> Duration {
        job.timeout(self.default_timeout) + self.grace
    }
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(u64::from(DEFAULT_TIMEOUT_SECS)),
            grace: DEFAULT_LEASE_GRACE,
        }
    }
}

/// What [`JobStore::fail_or_schedule_backoff`](crate::JobStore::fail_or_schedule_backoff)
/// decided for a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    Rescheduled {
        attempts: u32,
        next_retry: DateTime<Utc>,
    },
    Dead {
        attempts: u32,
    },
}

impl FailureOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            FailureOutcome::Rescheduled { attempts, .. } | FailureOutcome::Dead { attempts } => {
                *attempts
            }
        }
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, FailureOutcome::Dead { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub job_id: String,
    pub ts: DateTime<Utc>,
    pub stream: String,
    pub chunk: String,
}

/// Count of jobs per state. Every state is present, zero by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
}

impl JobStats {
    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Dead => self.dead,
        }
    }

    pub fn set(&mut self, state: JobState, count: u64) {
        let slot = match state {
            JobState::Pending => &mut self.pending,
            JobState::Processing => &mut self.processing,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            JobState::Dead => &mut self.dead,
        };
        *slot = count;
    }

    pub fn total(&self) -> u64 {
        JobState::ALL.iter().map(|state| self.get(*state)).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (JobState, u64)> + '_ {
        JobState::ALL.into_iter().map(|state| (state, self.get(state)))
    }
}

/// Persistent queue settings, stored one key at a time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub backoff_base: f64,
}

impl QueueConfig {
    pub const KEYS: [&'static str; 2] = ["max_retries", "backoff_base"];

    /// Parses `value` for `key` and applies it.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), QueueError> {
        let invalid = || QueueError::InvalidConfigValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        match key {
            "max_retries" => self.max_retries = value.trim().parse().map_err(|_| invalid())?,
            "backoff_base" => {
                let base: f64 = value.trim().parse().map_err(|_| invalid())?;
                if !crate::backoff::is_valid_base(base) {
                    return Err(invalid());
                }
                self.backoff_base = base;
            }
            other => return Err(QueueError::UnknownConfigKey(other.to_string())),
        }
        Ok(())
    }

    pub fn entries(&self) -> [(&'static str, String); 2] {
        [
            ("max_retries", self.max_retries.to_string()),
            ("backoff_base", self.backoff_base.to_string()),
        ]
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: crate::backoff::DEFAULT_BACKOFF_BASE,
        }
    }
}
