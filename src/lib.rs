//! Durable, single-node background job queue for shell commands.
//!
//! Jobs live in a [`JobStore`] (SQLite by default, MongoDB with the `mongodb`
//! feature). A [`Supervisor`] runs a pool of [`Worker`]s that claim jobs
//! under a time-bounded lease, run them through `sh -c`, and either mark
//! them completed or schedule a retry with exponential backoff. Jobs that
//! exhaust their retries land in the dead-letter queue. A [`Reaper`]
//! returns jobs whose lease expired to the queue, so execution is
//! at-least-once.
//!
//! ```no_run
//! use std::sync::Arc;
//! use queuectl::{JobStore, NewJob, SqliteStore, Supervisor, SupervisorOptions};
//!
//! # async fn demo() -> Result<(), queuectl::QueueError> {
//! let store = Arc::new(SqliteStore::open("queue.db")?);
//! store.enqueue(NewJob::new("echo hello").max_retries(2)).await?;
//! Supervisor::new(store, SupervisorOptions::default()).run().await
//! # }
//! ```

pub mod backoff;
pub mod clock;
pub mod error;
pub mod executor;
#[cfg(feature = "mongodb")]
pub mod mongo;
pub mod reaper;
pub mod sqlite;
pub mod store;
pub mod supervisor;
pub mod types;
pub mod worker;

pub use clock::{Clock, FakeClock, SystemClock};
pub use error::{ExecutionError, QueueError};
#[cfg(feature = "mongodb")]
pub use mongo::MongoStore;
pub use reaper::Reaper;
pub use sqlite::SqliteStore;
pub use store::JobStore;
pub use supervisor::{shutdown_signal, Supervisor, SupervisorOptions};
pub use types::{
    FailureOutcome, Job, JobState, JobStats, LeasePolicy, LogLine, NewJob, QueueConfig,
};
pub use worker::{TickOutcome, Worker, WorkerOptions};
