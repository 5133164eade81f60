use std::time::Duration;

use anyhow::Context;
use bson::doc;
use chrono::{DateTime, Utc};
use mongodb::options::UpdateOptions;

use super::types::to_bson;
use super::MongoStore;
use crate::clock::Clock;
use crate::error::QueueError;
use crate::types::{FailureOutcome, Job, JobState};

impl<C: Clock> MongoStore<C> {
    pub(super) async fn complete(&self, id: &str) -> Result<(), QueueError> {
        let result = self
            .collection()
            .update_one(
                doc! { "jid": id, "state": { "$ne": JobState::Completed.as_str() } },
                doc! { "$set": {
                    "state": JobState::Completed.as_str(),
                    "error": "",
                    "next_retry": None::<bson::DateTime>,
                    "worker_id": None::<String>,
                    "lease_until": None::<bson::DateTime>,
                    "updated_at": to_bson(self.now()),
                } },
                None,
            )
            .await
            .context("Failed to mark job as completed")?;
        if result.matched_count == 0 {
            // Already completed, or missing.
            self.find_job(id).await?;
        }
        Ok(())
    }

    /// Bump `attempts` and either reschedule or dead-letter, reading and
    /// writing the document in one transaction.
    pub(super) async fn record_failure(
        &self,
        id: &str,
        delay: Duration,
        error: &str,
    ) -> Result<FailureOutcome, QueueError> {
        let now = self.now();
        let collection = self.collection();
        let client = collection.client();

        let mut session = client
            .start_session(None)
            .await
            .context("Failed to start session")?;
        session
            .start_transaction(None)
            .await
            .context("Failed to start transaction")?;

        let row = collection
            .find_one_with_session(doc! { "jid": id }, None, &mut session)
            .await
            .context("Failed to load job attempts")?
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
        let job = Job::try_from(row)?;

        let attempts = job.attempts.saturating_add(1);
        let (outcome, update_doc) = if attempts > job.max_retries {
            (
                FailureOutcome::Dead { attempts },
                doc! { "$set": {
                    "state": JobState::Dead.as_str(),
                    "attempts": i64::from(attempts),
                    "error": error,
                    "next_retry": None::<bson::DateTime>,
                    "worker_id": None::<String>,
                    "lease_until": None::<bson::DateTime>,
                    "updated_at": to_bson(now),
                } },
            )
        } else {
            let next_retry = after(now, delay);
            (
                FailureOutcome::Rescheduled {
                    attempts,
                    next_retry,
                },
                doc! { "$set": {
                    "state": JobState::Pending.as_str(),
                    "attempts": i64::from(attempts),
                    "error": error,
                    "next_retry": to_bson(next_retry),
                    "worker_id": None::<String>,
                    "lease_until": None::<bson::DateTime>,
                    "updated_at": to_bson(now),
                } },
            )
        };

        collection
            .update_one_with_session(doc! { "jid": id }, update_doc, None, &mut session)
            .await
            .context("Failed to record job failure")?;
        session
            .commit_transaction()
            .await
            .context("Failed to commit transaction")?;

        Ok(outcome)
    }

    pub(super) async fn requeue_expired(&self) -> Result<u64, QueueError> {
        let now = to_bson(self.now());
        let result = self
            .collection()
            .update_many(
                doc! {
                    "state": JobState::Processing.as_str(),
                    "lease_until": { "$ne": None::<bson::DateTime>, "$lte": now },
                },
                doc! { "$set": {
                    "state": JobState::Pending.as_str(),
                    "worker_id": None::<String>,
                    "lease_until": None::<bson::DateTime>,
                    "updated_at": now,
                } },
                UpdateOptions::builder().build(),
            )
            .await
            .context("Failed to requeue expired leases")?;
        Ok(result.modified_count)
    }

    pub(super) async fn retry_dead(&self, id: &str) -> Result<(), QueueError> {
        let result = self
            .collection()
            .update_one(
                doc! { "jid": id, "state": JobState::Dead.as_str() },
                doc! { "$set": {
                    "state": JobState::Pending.as_str(),
                    "attempts": 0_i64,
                    "error": "",
                    "next_retry": None::<bson::DateTime>,
                    "updated_at": to_bson(self.now()),
                } },
                None,
            )
            .await
            .context("Failed to retry dead job")?;
        if result.matched_count == 0 {
            let job = self.find_job(id).await?;
            return Err(QueueError::InvalidState {
                id: job.id,
                actual: job.state,
                expected: JobState::Dead,
            });
        }
        Ok(())
    }
}

pub(super) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
