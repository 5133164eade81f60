use std::time::Duration;

use crate::types::JobState;

/// Errors surfaced by a [`JobStore`](crate::JobStore).
///
/// Losing a claim race is not an error: `acquire_job` returns `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job {0} not found")]
    JobNotFound(String),
    #[error("job {id} is {actual}, expected {expected}")]
    InvalidState {
        id: String,
        actual: JobState,
        expected: JobState,
    },
    #[error("job command must not be empty")]
    EmptyCommand,
    #[error("unknown config key: {0}")]
    UnknownConfigKey(String),
    #[error("invalid value {value:?} for config key {key}")]
    InvalidConfigValue { key: String, value: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Why a job's command did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("failed to spawn command: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to wait for command: {0}")]
    Wait(#[source] std::io::Error),
    #[error("exit status {0}")]
    Exit(i32),
    #[error("command terminated by signal")]
    Terminated,
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("command cancelled by shutdown")]
    Cancelled,
}

impl ExecutionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecutionError::Timeout(_))
    }
}
