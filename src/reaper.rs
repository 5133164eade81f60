//! Periodic recovery of jobs whose lease ran out.
//!
//! A worker that dies mid-execution never reports back. Once its lease
//! passes, the reaper returns the job to `pending` so another worker picks
//! it up, which means the command may run more than once.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::store::JobStore;

pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(2);

pub struct Reaper<S: ?Sized> {
    store: Arc<S>,
    interval: Duration,
    cancel: CancellationToken,
}

impl<S: JobStore + ?Sized> Reaper<S> {
    pub fn new(store: Arc<S>, interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            store,
            interval,
            cancel,
        }
    }

    pub async fn run(self) {
        debug!(interval = ?self.interval, "reaper started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            // Transient store errors are retried on the next tick.
            if let Err(e) = self.reap_once().await {
                warn!(error = %e, "failed to requeue expired leases");
            }
        }
        debug!("reaper stopped");
    }

    pub async fn reap_once(&self) -> Result<u64, QueueError> {
        let reclaimed = self.store.requeue_expired_leases().await?;
        if reclaimed > 0 {
            info!(reclaimed, "requeued jobs with expired leases");
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::sqlite::SqliteStore;
    use crate::types::{JobState, LeasePolicy, NewJob};

    fn setup() -> (Arc<SqliteStore<FakeClock>>, FakeClock) {
        let clock = FakeClock::new();
        let store = SqliteStore::open_in_memory()
            .unwrap()
            .with_clock(clock.clone());
        (Arc::new(store), clock)
    }

    #[tokio::test]
    async fn reap_once_requeues_only_expired_leases() {
        let (store, clock) = setup();
        let short = store
            .enqueue(NewJob::new("sleep 60").timeout_seconds(1))
            .await
            .unwrap();
        let long = store
            .enqueue(NewJob::new("sleep 60").timeout_seconds(120))
            .await
            .unwrap();
        let lease = LeasePolicy::default();
        store.acquire_job(&lease).await.unwrap();
        store.acquire_job(&lease).await.unwrap();

        let reaper = Reaper::new(store.clone(), DEFAULT_REAP_INTERVAL, CancellationToken::new());
        assert_eq!(reaper.reap_once().await.unwrap(), 0);

        clock.advance(Duration::from_secs(11));
        assert_eq!(reaper.reap_once().await.unwrap(), 1);
        assert_eq!(store.get_job(&short.id).await.unwrap().state, JobState::Pending);
        assert_eq!(store.get_job(&long.id).await.unwrap().state, JobState::Processing);
    }

    #[tokio::test]
    async fn run_loop_recovers_expired_job() {
        let (store, clock) = setup();
        let job = store.enqueue(NewJob::new("sleep 60")).await.unwrap();
        store.acquire_job(&LeasePolicy::default()).await.unwrap();
        clock.advance(Duration::from_secs(60));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            Reaper::new(store.clone(), Duration::from_millis(10), cancel.clone()).run(),
        );

        let recovered = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if store.get_job(&job.id).await.unwrap().state == JobState::Pending {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        cancel.cancel();
        handle.await.unwrap();
        assert!(recovered.is_ok(), "reaper never requeued the job");
    }
}
