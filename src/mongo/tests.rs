//! These run against a live server named by `QUEUECTL_MONGODB_URI` and are
//! skipped when it is unset. Failure recording needs a replica set.

use std::time::Duration;

use mongodb::Client;

use super::*;
use crate::clock::FakeClock;

async fn store() -> Option<(MongoStore<FakeClock>, FakeClock)> {
    let Ok(uri) = std::env::var("QUEUECTL_MONGODB_URI") else {
        eprintln!("QUEUECTL_MONGODB_URI not set, skipping");
        return None;
    };
    let client = Client::with_uri_str(&uri).await.unwrap();
    let database = client.database(&format!("queuectl_test_{}", Uuid::new_v4().simple()));
    let clock = FakeClock::new();
    let store = MongoStore::with_database(database)
        .await
        .unwrap()
        .with_clock(clock.clone());
    Some((store, clock))
}

#[tokio::test]
async fn claims_oldest_job_once() {
    let Some((store, clock)) = store().await else {
        return;
    };
    let first = store.enqueue(NewJob::new("echo 1")).await.unwrap();
    clock.advance(Duration::from_millis(5));
    let second = store.enqueue(NewJob::new("echo 2")).await.unwrap();

    let lease = LeasePolicy::default();
    let claimed = store.acquire_job(&lease).await.unwrap().unwrap();
    assert_eq!(claimed.id, first.id);
    assert_eq!(claimed.state, JobState::Processing);
    assert!(claimed.worker_id.is_some());
    assert_eq!(
        claimed.lease_until,
        Some(clock.now() + chrono::Duration::seconds(40))
    );

    let next = store.acquire_job(&lease).await.unwrap().unwrap();
    assert_eq!(next.id, second.id);
    assert!(store.acquire_job(&lease).await.unwrap().is_none());

    store.delete_database().await.unwrap();
}

#[tokio::test]
async fn failure_reschedules_then_dead_letters() {
    let Some((store, clock)) = store().await else {
        return;
    };
    let job = store
        .enqueue(NewJob::new("exit 1").max_retries(1))
        .await
        .unwrap();
    let lease = LeasePolicy::default();

    let claimed = store.acquire_job(&lease).await.unwrap().unwrap();
    let outcome = store
        .fail_or_schedule_backoff(&claimed, Duration::from_secs(2), "exit status 1")
        .await
        .unwrap();
    assert_eq!(
        outcome,
        FailureOutcome::Rescheduled {
            attempts: 1,
            next_retry: clock.now() + chrono::Duration::seconds(2),
        }
    );
    assert!(store.acquire_job(&lease).await.unwrap().is_none());

    clock.advance(Duration::from_secs(2));
    let claimed = store.acquire_job(&lease).await.unwrap().unwrap();
    let outcome = store
        .fail_or_schedule_backoff(&claimed, Duration::from_secs(4), "exit status 1")
        .await
        .unwrap();
    assert_eq!(outcome, FailureOutcome::Dead { attempts: 2 });

    let dead = store.list_dlq_jobs(0).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, job.id);
    assert_eq!(dead[0].error, "exit status 1");

    store.retry_dlq_job(&job.id).await.unwrap();
    let retried = store.get_job(&job.id).await.unwrap();
    assert_eq!(retried.state, JobState::Pending);
    assert_eq!(retried.attempts, 0);
    assert!(retried.error.is_empty());

    store.delete_database().await.unwrap();
}

#[tokio::test]
async fn expired_leases_are_requeued() {
    let Some((store, clock)) = store().await else {
        return;
    };
    let job = store
        .enqueue(NewJob::new("sleep 60").timeout_seconds(5))
        .await
        .unwrap();
    store
        .acquire_job(&LeasePolicy::default())
        .await
        .unwrap()
        .unwrap();

    clock.advance(Duration::from_secs(14));
    assert_eq!(store.requeue_expired_leases().await.unwrap(), 0);
    clock.advance(Duration::from_secs(1));
    assert_eq!(store.requeue_expired_leases().await.unwrap(), 1);

    let job = store.get_job(&job.id).await.unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert!(job.worker_id.is_none());
    assert!(job.lease_until.is_none());

    store.delete_database().await.unwrap();
}

#[tokio::test]
async fn stats_logs_and_config() {
    let Some((store, _)) = store().await else {
        return;
    };
    let job = store.enqueue(NewJob::new("echo hi")).await.unwrap();
    store.enqueue(NewJob::new("echo there")).await.unwrap();
    store.set_completed(&job.id).await.unwrap();
    store.set_completed(&job.id).await.unwrap();

    let stats = store.job_stats().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.total(), 2);

    store.append_log(&job.id, "stdout", "hi\n").await.unwrap();
    store.append_log(&job.id, "stderr", "oops\n").await.unwrap();
    let logs = store.get_logs(&job.id, 0).await.unwrap();
    let streams: Vec<_> = logs.iter().map(|l| l.stream.as_str()).collect();
    assert_eq!(streams, ["stdout", "stderr"]);

    store.set_config("max_retries", "7").await.unwrap();
    assert_eq!(store.get_config().await.unwrap().max_retries, 7);
    assert!(matches!(
        store.set_config("colour", "blue").await,
        Err(QueueError::UnknownConfigKey(_))
    ));
    let job = store.enqueue(NewJob::new("true")).await.unwrap();
    assert_eq!(job.max_retries, 7);

    store.delete_database().await.unwrap();
}
