//! Runs a pool of workers and the lease reaper under one cancellation token.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backoff;
use crate::error::QueueError;
use crate::reaper::{Reaper, DEFAULT_REAP_INTERVAL};
use crate::store::JobStore;
use crate::types::{LeasePolicy, DEFAULT_LEASE_GRACE, DEFAULT_TIMEOUT_SECS};
use crate::worker::{Worker, WorkerOptions};

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorOptions {
    pub workers: usize,
    pub poll_interval: Duration,
    pub reap_interval: Duration,
    /// Timeout for jobs enqueued with `timeout_seconds = 0`.
    pub default_timeout: Duration,
    pub lease_grace: Duration,
    /// `None` reads `backoff_base` from the store's config at start-up.
    pub backoff_base: Option<f64>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            poll_interval: Duration::from_millis(300),
            reap_interval: DEFAULT_REAP_INTERVAL,
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS.into()),
            lease_grace: DEFAULT_LEASE_GRACE,
            backoff_base: None,
        }
    }
}

pub struct Supervisor<S: ?Sized> {
    store: Arc<S>,
    options: SupervisorOptions,
    cancel: CancellationToken,
}

impl<S: JobStore + ?Sized> Supervisor<S> {
    pub fn new(store: Arc<S>, options: SupervisorOptions) -> Self {
        Self {
            store,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Token shared by every worker and the reaper. Cancelling it stops the
    /// supervisor just like the shutdown future resolving.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<(), QueueError> {
        self.run_with_shutdown(shutdown_signal()).await
    }

    /// Run until `shutdown` resolves, then cancel in-flight commands and wait
    /// for every task to finish.
    pub async fn run_with_shutdown<F>(self, shutdown: F) -> Result<(), QueueError>
    where
        F: Future<Output = ()>,
    {
        let backoff_base = match self.options.backoff_base {
            Some(base) if !backoff::is_valid_base(base) => {
                return Err(QueueError::InvalidConfigValue {
                    key: "backoff_base".to_string(),
                    value: base.to_string(),
                });
            }
            Some(base) => base,
            None => self.store.get_config().await?.backoff_base,
        };
        let worker_options = WorkerOptions {
            poll_interval: self.options.poll_interval,
            backoff_base,
            lease: LeasePolicy {
                default_timeout: self.options.default_timeout,
                grace: self.options.lease_grace,
            },
        };
        let workers = self.options.workers.max(1);

        let mut tasks = JoinSet::new();
        for n in 1..=workers {
            let worker = Worker::new(
                format!("worker-{n}"),
                self.store.clone(),
                worker_options,
                self.cancel.clone(),
            );
            tasks.spawn(worker.run());
        }
        let reaper = Reaper::new(
            self.store.clone(),
            self.options.reap_interval,
            self.cancel.clone(),
        );
        tasks.spawn(reaper.run());
        info!(workers, backoff_base, "supervisor started");

        tokio::select! {
            _ = shutdown => info!("shutdown requested, stopping workers"),
            _ = self.cancel.cancelled() => info!("supervisor cancelled, stopping workers"),
        }
        self.cancel.cancel();

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "supervised task failed");
            }
        }
        info!("supervisor stopped");
        Ok(())
    }
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        // Without a handler the only way out is cancelling the token.
        warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteStore;
    use crate::types::{JobState, NewJob};

    fn fast_options(workers: usize) -> SupervisorOptions {
        SupervisorOptions {
            workers,
            poll_interval: Duration::from_millis(20),
            reap_interval: Duration::from_millis(50),
            ..SupervisorOptions::default()
        }
    }

    async fn wait_for_state(store: &SqliteStore, id: &str, state: JobState) -> bool {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if store.get_job(id).await.unwrap().state == state {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .is_ok()
    }

    #[tokio::test]
    async fn drains_queue_with_several_workers() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut ids = Vec::new();
        for n in 0..6 {
            let job = store.enqueue(NewJob::new(format!("echo {n}"))).await.unwrap();
            ids.push(job.id);
        }

        let supervisor = Supervisor::new(store.clone(), fast_options(3));
        let cancel = supervisor.cancellation_token();
        let handle = tokio::spawn(supervisor.run_with_shutdown(std::future::pending()));

        for id in &ids {
            assert!(wait_for_state(&store, id, JobState::Completed).await);
        }
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(store.job_stats().await.unwrap().completed, 6);
    }

    #[tokio::test]
    async fn shutdown_stops_running_command_promptly() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let job = store.enqueue(NewJob::new("sleep 30")).await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let supervisor = Supervisor::new(store.clone(), fast_options(1));
        let handle = tokio::spawn(supervisor.run_with_shutdown(async {
            let _ = rx.await;
        }));

        assert!(wait_for_state(&store, &job.id, JobState::Processing).await);
        let started = std::time::Instant::now();
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        let job = store.get_job(&job.id).await.unwrap();
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn invalid_backoff_override_is_rejected() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        for base in [0.5, 0.0, -1.0, f64::NAN, f64::INFINITY] {
            let options = SupervisorOptions {
                backoff_base: Some(base),
                ..fast_options(1)
            };
            let err = Supervisor::new(store.clone(), options)
                .run_with_shutdown(std::future::pending())
                .await
                .unwrap_err();
            assert!(
                matches!(err, QueueError::InvalidConfigValue { ref key, .. } if key == "backoff_base"),
                "base {base}: got {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn backoff_base_comes_from_store_config() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.set_config("backoff_base", "1").await.unwrap();
        let job = store
            .enqueue(NewJob::new("exit 1").max_retries(1))
            .await
            .unwrap();

        let supervisor = Supervisor::new(store.clone(), fast_options(1));
        let cancel = supervisor.cancellation_token();
        let handle = tokio::spawn(supervisor.run_with_shutdown(std::future::pending()));

        // A base of 1 means one second between attempts.
        assert!(wait_for_state(&store, &job.id, JobState::Dead).await);
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let job = store.get_job(&job.id).await.unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(job.error, "exit status 1");
    }
}
