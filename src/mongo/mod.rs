//! MongoDB engine for [`JobStore`], enabled with the `mongodb` feature.
//!
//! Claims use a find followed by an update filtered on `state: "pending"`, so
//! a document only ever moves to `processing` once. Recording a failure reads
//! and rewrites the job inside a transaction, which needs a replica set.

mod outcome;
mod types;

#[cfg(test)]
mod tests;

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bson::{doc, Document};
use chrono::{DateTime, SubsecRound, Utc};
use futures::TryStreamExt;
use mongodb::{
    options::{
        ClientOptions, ConnectionString, FindOneOptions, FindOptions, IndexOptions, Tls,
        TlsOptions, UpdateOptions,
    },
    Client, Collection, Database, IndexModel,
};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::QueueError;
use crate::store::{JobStore, DEFAULT_LIST_LIMIT, DEFAULT_LOG_LIMIT};
use crate::types::{
    FailureOutcome, Job, JobState, JobStats, LeasePolicy, LogLine, NewJob, QueueConfig,
    DEFAULT_TIMEOUT_SECS,
};

use self::types::{to_bson, ConfigRow, JobRow, LogRow};

const JOBS: &str = "queuectl_jobs";
const LOGS: &str = "queuectl_job_logs";
const CONFIG: &str = "queuectl_config";

/// An implementation of [`JobStore`] backed by MongoDB
#[derive(Clone)]
pub struct MongoStore<C = SystemClock> {
    database: Database,
    clock: C,
}

impl MongoStore<SystemClock> {
    /// Connect to `uri`, optionally trusting the CA in `cert_file`. Uses the
    /// database named in the URI, or `queuectl`.
    pub async fn new(uri: &str, cert_file: Option<String>) -> Result<Self, QueueError> {
        let client = Self::new_client(uri, cert_file)
            .await
            .context("Failed to connect to MongoDB")?;
        let database = client
            .default_database()
            .unwrap_or_else(|| client.database("queuectl"));
        Self::with_database(database).await
    }

    /// Use an already configured database handle.
    pub async fn with_database(database: Database) -> Result<Self, QueueError> {
        let store = Self {
            database,
            clock: SystemClock,
        };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn new_client(
        uri: &str,
        cert_path: Option<String>,
    ) -> Result<Client, mongodb::error::Error> {
        match cert_path {
            Some(cert_path) => {
                let conn_str = ConnectionString::parse(uri)?;
                let mut options = ClientOptions::parse_connection_string(conn_str).await?;
                let mut tls_options = TlsOptions::default();
                tls_options.ca_file_path = Some(cert_path.into());
                tls_options.allow_invalid_hostnames = Some(true);
                options.tls = Some(Tls::Enabled(tls_options));
                Client::with_options(options)
            }
            None => Client::with_uri_str(uri).await,
        }
    }
}

impl<C: Clock> MongoStore<C> {
    pub fn with_clock<C2: Clock>(self, clock: C2) -> MongoStore<C2> {
        MongoStore {
            database: self.database,
            clock,
        }
    }

    #[cfg(test)]
    pub(crate) async fn delete_database(&self) -> Result<(), mongodb::error::Error> {
        self.database.drop(None).await
    }

    // BSON dates carry milliseconds only.
    fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(3)
    }

    fn collection(&self) -> Collection<JobRow> {
        self.database.collection(JOBS)
    }

    fn log_collection(&self) -> Collection<LogRow> {
        self.database.collection(LOGS)
    }

    fn config_collection(&self) -> Collection<ConfigRow> {
        self.database.collection(CONFIG)
    }

    async fn ensure_indexes(&self) -> Result<(), QueueError> {
        let unique = IndexOptions::builder().unique(true).build();
        self.collection()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "jid": 1 })
                    .options(unique.clone())
                    .build(),
                None,
            )
            .await
            .context("Failed to create job id index")?;
        self.collection()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "state": 1, "created_at": 1 })
                    .build(),
                None,
            )
            .await
            .context("Failed to create job state index")?;
        self.log_collection()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "job_id": 1, "ts": 1 })
                    .build(),
                None,
            )
            .await
            .context("Failed to create job log index")?;
        self.config_collection()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "key": 1 })
                    .options(unique)
                    .build(),
                None,
            )
            .await
            .context("Failed to create config index")?;
        Ok(())
    }

    async fn find_job(&self, id: &str) -> Result<Job, QueueError> {
        let row = self
            .collection()
            .find_one(doc! { "jid": id }, None)
            .await
            .context("Failed to find job")?;
        match row {
            Some(row) => Job::try_from(row),
            None => Err(QueueError::JobNotFound(id.to_string())),
        }
    }

    async fn load_config(&self) -> Result<QueueConfig, QueueError> {
        let rows: Vec<ConfigRow> = self
            .config_collection()
            .find(None, None)
            .await
            .context("Failed to read config")?
            .try_collect()
            .await
            .context("Failed to read config")?;

        let mut config = QueueConfig::default();
        for row in rows {
            if let Err(e) = config.apply(&row.key, &row.value) {
                warn!(key = %row.key, error = %e, "ignoring stored config value");
            }
        }
        Ok(config)
    }
}

#[async_trait]
impl<C: Clock> JobStore for MongoStore<C> {
    #[instrument(skip_all, err, fields(job_id))]
    async fn enqueue(&self, job: NewJob) -> Result<Job, QueueError> {
        if job.command.trim().is_empty() {
            return Err(QueueError::EmptyCommand);
        }
        let now = to_bson(self.now());
        let jid = Uuid::new_v4().to_string();
        tracing::Span::current().record("job_id", jid.as_str());

        let max_retries = match job.max_retries {
            Some(max_retries) => max_retries,
            None => self.load_config().await?.max_retries,
        };
        let row = JobRow {
            jid: jid.clone(),
            command: job.command,
            state: JobState::Pending,
            attempts: 0,
            max_retries: i64::from(max_retries),
            timeout_seconds: i64::from(job.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            error: String::new(),
            next_retry: None,
            worker_id: None,
            lease_until: None,
            created_at: now,
            updated_at: now,
        };
        self.collection()
            .insert_one(row, None)
            .await
            .context("Failed to add job to the queue")?;
        self.find_job(&jid).await
    }

    #[instrument(skip_all, err, fields(job_id = id))]
    async fn get_job(&self, id: &str) -> Result<Job, QueueError> {
        self.find_job(id).await
    }

    #[instrument(skip_all, err)]
    async fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        let filter = match state {
            Some(state) => doc! { "state": state.as_str() },
            None => Document::new(),
        };
        let options = FindOptions::builder()
            .sort(doc! { "created_at": -1, "_id": -1 })
            .limit(effective_limit(limit, DEFAULT_LIST_LIMIT))
            .build();
        let rows: Vec<JobRow> = self
            .collection()
            .find(filter, options)
            .await
            .context("Failed to list jobs")?
            .try_collect()
            .await
            .context("Failed to list jobs")?;
        rows.into_iter().map(Job::try_from).collect()
    }

    #[instrument(skip_all, err)]
    async fn job_stats(&self) -> Result<JobStats, QueueError> {
        let mut stats = JobStats::default();
        for state in JobState::ALL {
            let count = self
                .collection()
                .count_documents(doc! { "state": state.as_str() }, None)
                .await
                .context("Failed to count jobs")?;
            stats.set(state, count);
        }
        Ok(stats)
    }

    #[instrument(skip_all, err, fields(job_id))]
    async fn acquire_job(&self, lease: &LeasePolicy) -> Result<Option<Job>, QueueError> {
        let now = self.now();
        let filter = doc! {
            "state": JobState::Pending.as_str(),
            "$or": [
                { "next_retry": None::<bson::DateTime> },
                { "next_retry": { "$lte": to_bson(now) } },
            ],
        };
        let find_options = FindOneOptions::builder()
            .sort(doc! { "created_at": 1, "_id": 1 })
            .build();
        let row = self
            .collection()
            .find_one(filter, find_options)
            .await
            .context("Failed to check out a job from the queue")?;
        let Some(row) = row else {
            return Ok(None);
        };
        let candidate = Job::try_from(row)?;
        tracing::Span::current().record("job_id", candidate.id.as_str());

        let lease_until = outcome::after(now, lease.lease_for(&candidate));
        let update_doc = doc! {
            "$set": {
                "state": JobState::Processing.as_str(),
                "worker_id": Uuid::new_v4().to_string(),
                "lease_until": to_bson(lease_until),
                "next_retry": None::<bson::DateTime>,
                "updated_at": to_bson(now),
            }
        };
        let result = self
            .collection()
            .update_one(
                doc! { "jid": &candidate.id, "state": JobState::Pending.as_str() },
                update_doc,
                UpdateOptions::builder().build(),
            )
            .await
            .context("Failed to claim job")?;
        if result.modified_count != 1 {
            // Another claimer won the document.
            return Ok(None);
        }
        self.find_job(&candidate.id).await.map(Some)
    }

    #[instrument(skip_all, err, fields(job_id = id))]
    async fn set_completed(&self, id: &str) -> Result<(), QueueError> {
        self.complete(id).await
    }

    #[instrument(skip_all, err, fields(job_id = %job.id, delay = ?delay))]
    async fn fail_or_schedule_backoff(
        &self,
        job: &Job,
        delay: Duration,
        error: &str,
    ) -> Result<FailureOutcome, QueueError> {
        self.record_failure(&job.id, delay, error).await
    }

    #[instrument(skip_all, err)]
    async fn requeue_expired_leases(&self) -> Result<u64, QueueError> {
        self.requeue_expired().await
    }

    #[instrument(skip_all, err, fields(job_id = id))]
    async fn retry_dlq_job(&self, id: &str) -> Result<(), QueueError> {
        self.retry_dead(id).await
    }

    #[instrument(skip(self, chunk), err)]
    async fn append_log(&self, job_id: &str, stream: &str, chunk: &str) -> Result<(), QueueError> {
        let row = LogRow {
            job_id: job_id.to_string(),
            ts: to_bson(self.now()),
            stream: stream.to_string(),
            chunk: chunk.to_string(),
        };
        self.log_collection()
            .insert_one(row, None)
            .await
            .context("Failed to append job log")?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_logs(&self, job_id: &str, limit: usize) -> Result<Vec<LogLine>, QueueError> {
        let options = FindOptions::builder()
            .sort(doc! { "ts": 1, "_id": 1 })
            .limit(effective_limit(limit, DEFAULT_LOG_LIMIT))
            .build();
        let rows: Vec<LogRow> = self
            .log_collection()
            .find(doc! { "job_id": job_id }, options)
            .await
            .context("Failed to read job logs")?
            .try_collect()
            .await
            .context("Failed to read job logs")?;
        Ok(rows.into_iter().map(LogLine::from).collect())
    }

    #[instrument(skip_all, err)]
    async fn get_config(&self) -> Result<QueueConfig, QueueError> {
        self.load_config().await
    }

    #[instrument(skip(self), err)]
    async fn set_config(&self, key: &str, value: &str) -> Result<(), QueueError> {
        QueueConfig::default().apply(key, value)?;
        self.config_collection()
            .update_one(
                doc! { "key": key },
                doc! { "$set": { "value": value.trim() } },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await
            .context("Failed to store config value")?;
        Ok(())
    }
}

fn effective_limit(limit: usize, default: usize) -> i64 {
    let limit = if limit == 0 { default } else { limit };
    i64::try_from(limit).unwrap_or(i64::MAX)
}
