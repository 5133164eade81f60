use std::sync::Arc;
use std::time::Duration;

use queuectl::{JobState, JobStore, NewJob, SqliteStore, Supervisor, SupervisorOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let dir = std::env::temp_dir().join("queuectl-demo");
    let store = Arc::new(SqliteStore::open(dir.join("queue.db"))?);

    // One job that succeeds, one that always fails and ends up dead-lettered.
    let ok = store.enqueue(NewJob::new("echo hello from queuectl")).await?;
    let flaky = store.enqueue(NewJob::new("exit 1").max_retries(1)).await?;

    let options = SupervisorOptions {
        workers: 2,
        poll_interval: Duration::from_millis(100),
        backoff_base: Some(1.0),
        ..SupervisorOptions::default()
    };
    // The shutdown future stops the workers once it completes. In a real
    // deployment use `Supervisor::run`, which waits for SIGINT or SIGTERM.
    Supervisor::new(store.clone(), options)
        .run_with_shutdown(tokio::time::sleep(Duration::from_secs(3)))
        .await?;

    for id in [&ok.id, &flaky.id] {
        let job = store.get_job(id).await?;
        println!("{} {:?} attempts={} {}", job.id, job.state, job.attempts, job.command);
    }
    for line in store.get_logs(&ok.id, 0).await? {
        print!("[{}] {}", line.stream, line.chunk);
    }
    println!("dead jobs: {}", store.job_stats().await?.get(JobState::Dead));
    Ok(())
}
