use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::PossibleValuesParser;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use queuectl::store::{DEFAULT_LIST_LIMIT, DEFAULT_LOG_LIMIT};
use queuectl::{
    backoff, Job, JobState, JobStore, NewJob, QueueConfig, SqliteStore, Supervisor,
    SupervisorOptions,
};

#[derive(Parser)]
#[command(name = "queuectl", version, about = "Durable background job queue for shell commands")]
struct Cli {
    /// SQLite database file. Defaults to $QUEUECTL_DB, then the user data directory
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,

    /// MongoDB connection string, used instead of SQLite when given
    #[cfg(feature = "mongodb")]
    #[arg(long, global = true, value_name = "URI")]
    mongodb: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add a shell command to the queue
    Enqueue {
        /// Command line, run with `sh -c`
        command: String,
        /// Failed attempts allowed before dead-lettering (default: stored config)
        #[arg(long)]
        max_retries: Option<u32>,
        /// Per-attempt timeout in seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u32>,
    },
    /// Run workers
    Worker(WorkerArgs),
    /// Show job counts per state
    Status,
    /// List jobs, newest first
    List {
        #[arg(long)]
        state: Option<JobState>,
        #[arg(long, default_value_t = DEFAULT_LIST_LIMIT)]
        limit: usize,
    },
    /// Show captured output of a job
    Logs {
        id: String,
        #[arg(long, default_value_t = DEFAULT_LOG_LIMIT)]
        limit: usize,
    },
    /// Inspect and retry dead-lettered jobs
    Dlq(DlqArgs),
    /// Read or change queue settings
    Config(ConfigArgs),
}

#[derive(Args)]
struct WorkerArgs {
    #[command(subcommand)]
    command: WorkerCommand,
}

#[derive(Subcommand)]
enum WorkerCommand {
    /// Start workers in the foreground until SIGINT or SIGTERM
    Start {
        /// Number of concurrent workers
        #[arg(long, default_value_t = 1)]
        count: usize,
        #[arg(long, default_value_t = 300, value_name = "MS")]
        poll_ms: u64,
        /// Overrides the stored backoff_base (at least 1)
        #[arg(long, value_parser = parse_backoff_base)]
        backoff_base: Option<f64>,
        /// Timeout for jobs stored without one
        #[arg(long, default_value_t = 30, value_name = "SECS")]
        timeout: u64,
    },
}

#[derive(Args)]
struct DlqArgs {
    #[command(subcommand)]
    command: DlqCommand,
}

#[derive(Subcommand)]
enum DlqCommand {
    /// List dead jobs
    List {
        #[arg(long, default_value_t = DEFAULT_LIST_LIMIT)]
        limit: usize,
    },
    /// Move a dead job back to pending
    Retry { id: String },
}

#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommand,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Show effective settings
    Get,
    /// Store a setting
    Set {
        #[arg(value_parser = PossibleValuesParser::new(QueueConfig::KEYS))]
        key: String,
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();

    let store = open_store(&cli).await?;
    let json = cli.json;

    match cli.command {
        Command::Enqueue {
            command,
            max_retries,
            timeout,
        } => {
            let job = store
                .enqueue(NewJob {
                    command,
                    max_retries,
                    timeout_seconds: timeout,
                })
                .await?;
            if json {
                print_json(&job)?;
            } else {
                println!("{}", job.id);
            }
        }
        Command::Worker(WorkerArgs {
            command:
                WorkerCommand::Start {
                    count,
                    poll_ms,
                    backoff_base,
                    timeout,
                },
        }) => {
            let options = SupervisorOptions {
                workers: count,
                poll_interval: Duration::from_millis(poll_ms),
                default_timeout: Duration::from_secs(timeout),
                backoff_base,
                ..SupervisorOptions::default()
            };
            Supervisor::new(store, options).run().await?;
        }
        Command::Status => {
            let stats = store.job_stats().await?;
            if json {
                print_json(&stats)?;
            } else {
                for (state, count) in stats.iter() {
                    println!("{:<12}{count}", state.as_str());
                }
                println!("{:<12}{}", "total", stats.total());
            }
        }
        Command::List { state, limit } => {
            let jobs = store.list_jobs(state, limit).await?;
            print_jobs(&jobs, json)?;
        }
        Command::Logs { id, limit } => {
            // Surface a missing job instead of printing nothing.
            store.get_job(&id).await?;
            let lines = store.get_logs(&id, limit).await?;
            if json {
                print_json(&lines)?;
            } else {
                for line in lines {
                    for text in line.chunk.lines() {
                        println!("{} [{}] {text}", line.ts.to_rfc3339(), line.stream);
                    }
                }
            }
        }
        Command::Dlq(DlqArgs { command }) => match command {
            DlqCommand::List { limit } => {
                let jobs = store.list_dlq_jobs(limit).await?;
                print_jobs(&jobs, json)?;
            }
            DlqCommand::Retry { id } => {
                store.retry_dlq_job(&id).await?;
                if !json {
                    println!("{id} moved back to pending");
                }
            }
        },
        Command::Config(ConfigArgs { command }) => match command {
            ConfigCommand::Get => {
                let config = store.get_config().await?;
                if json {
                    print_json(&config)?;
                } else {
                    for (key, value) in config.entries() {
                        println!("{key} = {value}");
                    }
                }
            }
            ConfigCommand::Set { key, value } => {
                store.set_config(&key, &value).await?;
                if !json {
                    println!("{key} = {}", value.trim());
                }
            }
        },
    }
    Ok(())
}

#[cfg(feature = "mongodb")]
async fn open_store(cli: &Cli) -> Result<Arc<dyn JobStore>> {
    match &cli.mongodb {
        Some(uri) => {
            let store: Arc<dyn JobStore> = Arc::new(queuectl::MongoStore::new(uri, None).await?);
            Ok(store)
        }
        None => open_sqlite(cli.db.clone()),
    }
}

#[cfg(not(feature = "mongodb"))]
async fn open_store(cli: &Cli) -> Result<Arc<dyn JobStore>> {
    open_sqlite(cli.db.clone())
}

fn open_sqlite(flag: Option<PathBuf>) -> Result<Arc<dyn JobStore>> {
    let path = database_path(flag)?;
    debug!(path = %path.display(), "opening database");
    let store: Arc<dyn JobStore> = Arc::new(SqliteStore::open(&path)?);
    Ok(store)
}

fn database_path(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = flag {
        return Ok(path);
    }
    if let Some(path) = std::env::var_os("QUEUECTL_DB").filter(|path| !path.is_empty()) {
        return Ok(path.into());
    }
    let dir = dirs::data_dir().context("Could not determine a data directory, pass --db")?;
    Ok(dir.join("queuectl").join("queue.db"))
}

fn parse_backoff_base(value: &str) -> Result<f64, String> {
    let base: f64 = value.parse().map_err(|e| format!("{e}"))?;
    if backoff::is_valid_base(base) {
        Ok(base)
    } else {
        Err(format!("{value} is not a finite number of at least 1"))
    }
}

fn print_jobs(jobs: &[Job], json: bool) -> Result<()> {
    if json {
        return print_json(&jobs);
    }
    if jobs.is_empty() {
        println!("no jobs");
        return Ok(());
    }
    for job in jobs {
        println!(
            "{}  {:<10}  {}/{}  {}",
            job.id,
            job.state.as_str(),
            job.attempts,
            job.max_retries,
            job.command
        );
        if !job.error.is_empty() {
            println!("    error: {}", job.error);
        }
        if let Some(next_retry) = job.next_retry {
            println!("    next retry: {}", next_retry.to_rfc3339());
        }
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
