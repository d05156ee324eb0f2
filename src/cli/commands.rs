//! CLI command definitions for coderun.
//!
//! One binary runs every role: the submission API, the worker pool, or both
//! in one process, plus small client commands for submitting code and
//! inspecting results.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::{self, AppState, SubmitRequest};
use crate::execution::{PistonClient, DEFAULT_EXECUTOR_URL};
use crate::metrics::init_metrics;
use crate::poller::{PollPolicy, TaskClient};
use crate::scheduler::{
    MemoryQueuePair, QueueClass, QueuePair, RedisQueuePair, ResultStatus, TaskLookup, WorkerPool,
    WorkerPoolConfig,
};
use crate::store::{MemoryResultStore, RedisResultStore, ResultStore, StoreConfig};

/// Default Redis connection string.
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Default listen address for the submission API.
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

/// Default API base URL used by the client commands.
const DEFAULT_API_URL: &str = "http://127.0.0.1:3000";

/// Prioritized remote code execution service.
#[derive(Parser)]
#[command(name = "coderun")]
#[command(about = "Queue user code for remote sandbox execution and serve the results")]
#[command(version)]
#[command(
    long_about = "coderun accepts code submissions over HTTP, queues them on Redis under two priority classes (run before submit), executes them on a Piston-compatible sandbox and keeps the results for polling.\n\nExample usage:\n  coderun all --workers 2\n  coderun submit hello.py --action run"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the submission API only.
    Serve(ServeArgs),

    /// Run the worker pool only.
    Worker(WorkerArgs),

    /// Run the submission API and the worker pool in one process.
    All(AllArgs),

    /// Submit a source file and wait for its result.
    Submit(SubmitArgs),

    /// Show the current status of a task.
    Status(StatusArgs),

    /// Requeue entries left unacknowledged by dead workers, then exit.
    Recover(RecoverArgs),
}

/// Redis connection settings.
#[derive(clap::Args, Debug, Clone)]
pub struct RedisOpts {
    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,
}

/// Result expiry settings.
#[derive(clap::Args, Debug, Clone)]
pub struct StoreOpts {
    /// Seconds a result record stays readable.
    #[arg(long, env = "RESULT_TTL_SECS", default_value = "300")]
    pub result_ttl_secs: u64,

    /// Seconds the per-class results list lives after its last push.
    #[arg(long, env = "RESULTS_LIST_TTL_SECS", default_value = "600")]
    pub results_list_ttl_secs: u64,

    /// Seconds a pending marker lives without a result.
    #[arg(long, env = "PENDING_TTL_SECS", default_value = "3600")]
    pub pending_ttl_secs: u64,
}

impl StoreOpts {
    pub fn to_config(&self) -> StoreConfig {
        StoreConfig::default()
            .with_result_ttl(Duration::from_secs(self.result_ttl_secs))
            .with_results_list_ttl(Duration::from_secs(self.results_list_ttl_secs))
            .with_pending_ttl(Duration::from_secs(self.pending_ttl_secs))
    }
}

/// Worker pool settings.
#[derive(clap::Args, Debug, Clone)]
pub struct WorkerOpts {
    /// Number of worker loops.
    #[arg(short = 'w', long, env = "WORKERS", default_value = "1")]
    pub workers: usize,

    /// Piston-compatible execute endpoint.
    #[arg(long, env = "EXECUTOR_URL", default_value = DEFAULT_EXECUTOR_URL)]
    pub executor_url: String,

    /// Milliseconds to block on each queue per dequeue attempt.
    #[arg(long, env = "QUEUE_WAIT_MS", default_value = "1000")]
    pub queue_wait_ms: u64,

    /// Milliseconds to pause after each task.
    #[arg(long, env = "TASK_PAUSE_MS", default_value = "1000")]
    pub task_pause_ms: u64,

    /// Deadline for one sandbox call in seconds.
    #[arg(
        long,
        env = "EXECUTION_TIMEOUT_SECS",
        default_value = "30",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub execution_timeout_secs: u64,

    /// Seconds shutdown waits for in-flight tasks.
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value = "30")]
    pub shutdown_timeout_secs: u64,

    /// Age in seconds after which an unacknowledged entry is requeued; must
    /// exceed the execution deadline plus the task pause.
    #[arg(long, env = "RECOVERY_GRACE_SECS", default_value = "300")]
    pub recovery_grace_secs: u64,

    /// Seconds between recovery sweeps.
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value = "60")]
    pub sweep_interval_secs: u64,
}

impl WorkerOpts {
    pub fn to_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new(self.workers.max(1))
            .with_queue_wait(Duration::from_millis(self.queue_wait_ms))
            .with_task_pause(Duration::from_millis(self.task_pause_ms))
            .with_execution_timeout(Duration::from_secs(self.execution_timeout_secs))
            .with_shutdown_timeout(Duration::from_secs(self.shutdown_timeout_secs))
            .with_recovery_grace(Duration::from_secs(self.recovery_grace_secs))
            .with_sweep_interval(Duration::from_secs(self.sweep_interval_secs.max(1)))
    }
}

/// Arguments for `coderun serve`.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Address the API listens on.
    #[arg(short, long, env = "BIND_ADDR", default_value = DEFAULT_BIND_ADDR)]
    pub bind: String,

    #[command(flatten)]
    pub redis: RedisOpts,

    #[command(flatten)]
    pub store: StoreOpts,
}

/// Arguments for `coderun worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub redis: RedisOpts,

    #[command(flatten)]
    pub store: StoreOpts,

    #[command(flatten)]
    pub worker: WorkerOpts,
}

/// Arguments for `coderun all`.
#[derive(Parser, Debug)]
pub struct AllArgs {
    /// Address the API listens on.
    #[arg(short, long, env = "BIND_ADDR", default_value = DEFAULT_BIND_ADDR)]
    pub bind: String,

    /// Keep queues and results in process memory instead of Redis.
    #[arg(long)]
    pub in_memory: bool,

    #[command(flatten)]
    pub redis: RedisOpts,

    #[command(flatten)]
    pub store: StoreOpts,

    #[command(flatten)]
    pub worker: WorkerOpts,
}

/// Arguments for `coderun submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Source file to submit.
    pub file: PathBuf,

    /// Language name; inferred from the file extension when omitted.
    #[arg(short = 'L', long)]
    pub language: Option<String>,

    /// Queue class: run (interactive, higher priority) or submit.
    #[arg(short, long, default_value = "run")]
    pub action: QueueClass,

    /// Text passed to the program on stdin.
    #[arg(long)]
    pub stdin: Option<String>,

    /// Runtime version to request; any installed version when omitted.
    #[arg(long)]
    pub version_pin: Option<String>,

    /// Base URL of the submission API.
    #[arg(long, env = "CODERUN_API_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,

    /// Poll interval in milliseconds.
    #[arg(long, default_value = "500")]
    pub interval_ms: u64,

    /// Seconds to wait for a result; 0 waits forever.
    #[arg(long, default_value = "60")]
    pub max_wait_secs: u64,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

impl SubmitArgs {
    pub fn poll_policy(&self) -> PollPolicy {
        let max_wait = match self.max_wait_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        PollPolicy::default()
            .with_interval(Duration::from_millis(self.interval_ms.max(1)))
            .with_max_wait(max_wait)
    }
}

/// Arguments for `coderun status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Task id returned at submission.
    pub task_id: String,

    /// Base URL of the submission API.
    #[arg(long, env = "CODERUN_API_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `coderun recover`.
#[derive(Parser, Debug)]
pub struct RecoverArgs {
    #[command(flatten)]
    pub redis: RedisOpts,

    /// Requeue entries unacknowledged for at least this many seconds.
    #[arg(long, default_value = "300")]
    pub grace_secs: u64,
}

/// Parse CLI arguments without executing any command.
///
/// Use this to access parsed arguments (like log_level) before running.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve(args) => run_serve_command(args).await,
        Commands::Worker(args) => run_worker_command(args).await,
        Commands::All(args) => run_all_command(args).await,
        Commands::Submit(args) => run_submit_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
        Commands::Recover(args) => run_recover_command(args).await,
    }
}

// ============================================================================
// Service commands
// ============================================================================

async fn connect_redis(
    redis: &RedisOpts,
    store: &StoreOpts,
) -> anyhow::Result<(Arc<dyn QueuePair>, Arc<dyn ResultStore>)> {
    let queue = RedisQueuePair::connect(&redis.redis_url)
        .await
        .context("Failed to connect queue to Redis")?;
    let store = RedisResultStore::connect(&redis.redis_url, store.to_config())
        .await
        .context("Failed to connect result store to Redis")?;
    info!(redis_url = %redis.redis_url, "Connected to Redis");
    Ok((Arc::new(queue), Arc::new(store)))
}

fn build_pool(
    opts: &WorkerOpts,
    queue: Arc<dyn QueuePair>,
    store: Arc<dyn ResultStore>,
) -> WorkerPool {
    let executor = Arc::new(PistonClient::new(opts.executor_url.clone()));
    info!(executor_url = %executor.url(), workers = opts.workers, "Configured worker pool");
    WorkerPool::new(opts.to_config(), queue, store, executor)
}

/// Resolves once Ctrl-C is received.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn bind(addr: &str) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))
}

async fn run_serve_command(args: ServeArgs) -> anyhow::Result<()> {
    init_metrics().context("Failed to initialize metrics")?;
    let (queue, store) = connect_redis(&args.redis, &args.store).await?;
    let listener = bind(&args.bind).await?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    api::serve(listener, AppState::new(queue, store), shutdown)
        .await
        .context("Server error")?;
    Ok(())
}

async fn run_worker_command(args: WorkerArgs) -> anyhow::Result<()> {
    init_metrics().context("Failed to initialize metrics")?;
    let (queue, store) = connect_redis(&args.redis, &args.store).await?;

    let mut pool = build_pool(&args.worker, queue, store);
    pool.start().await?;

    shutdown_signal().await;
    stop_pool(&mut pool).await
}

async fn run_all_command(args: AllArgs) -> anyhow::Result<()> {
    init_metrics().context("Failed to initialize metrics")?;

    let (queue, store): (Arc<dyn QueuePair>, Arc<dyn ResultStore>) = if args.in_memory {
        info!("Using in-memory queue and result store");
        (
            Arc::new(MemoryQueuePair::new()),
            Arc::new(MemoryResultStore::new(args.store.to_config())),
        )
    } else {
        connect_redis(&args.redis, &args.store).await?
    };

    let listener = bind(&args.bind).await?;

    let mut pool = build_pool(&args.worker, Arc::clone(&queue), Arc::clone(&store));
    pool.start().await?;

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(api::serve(
        listener,
        AppState::new(queue, store),
        shutdown.clone(),
    ));

    shutdown_signal().await;
    shutdown.cancel();

    let pool_result = stop_pool(&mut pool).await;
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Server exited with error"),
        Err(e) => warn!(error = %e, "Server task panicked"),
    }
    pool_result
}

async fn stop_pool(pool: &mut WorkerPool) -> anyhow::Result<()> {
    pool.shutdown().await?;

    let stats = pool.stats();
    info!(
        completed = stats.tasks_completed,
        failed = stats.tasks_failed,
        success_rate = stats.success_rate(),
        avg_ms = stats.average_task_duration.as_millis() as u64,
        "Worker pool stopped"
    );
    Ok(())
}

async fn run_recover_command(args: RecoverArgs) -> anyhow::Result<()> {
    let queue = RedisQueuePair::connect(&args.redis.redis_url)
        .await
        .context("Failed to connect queue to Redis")?;

    let recovered = queue.recover(Duration::from_secs(args.grace_secs)).await?;
    println!("Requeued {} task(s)", recovered);

    for class in QueueClass::PRIORITY_ORDER {
        println!(
            "  {:<12} pending: {:<6} processing: {}",
            class.queue_key(),
            queue.len(class).await?,
            queue.processing_len(class).await?
        );
    }
    Ok(())
}

// ============================================================================
// Client commands
// ============================================================================

/// Maps a source file extension to a language name.
fn language_from_path(path: &Path) -> Option<&'static str> {
    match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
        "py" => Some("python"),
        "js" | "mjs" => Some("javascript"),
        "java" => Some("java"),
        _ => None,
    }
}

async fn run_submit_command(args: SubmitArgs) -> anyhow::Result<()> {
    let code = tokio::fs::read_to_string(&args.file)
        .await
        .with_context(|| format!("Failed to read {}", args.file.display()))?;

    let language = match &args.language {
        Some(language) => language.clone(),
        None => language_from_path(&args.file)
            .map(str::to_string)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Cannot infer language from {}; pass --language",
                    args.file.display()
                )
            })?,
    };

    let mut request = SubmitRequest::new(language, code).with_action(args.action);
    if let Some(stdin) = &args.stdin {
        request = request.with_stdin(stdin.clone());
    }
    request.version = args.version_pin.clone();

    let client = TaskClient::new(args.api_url.clone());
    let record = client
        .run_to_completion(&request, &args.poll_policy())
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        print!("{}", record.output);
        if !record.output.ends_with('\n') {
            println!();
        }
    }

    if record.status == ResultStatus::Error {
        return Err(anyhow::anyhow!("Task {} failed", record.task_id));
    }
    Ok(())
}

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let client = TaskClient::new(args.api_url.clone());

    match client.status(&args.task_id).await? {
        TaskLookup::Finished(record) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                println!("Task:      {}", record.task_id);
                println!("Status:    {}", record.status);
                println!("Completed: {}", record.completed_at.to_rfc3339());
                println!("Output:\n{}", record.output);
            }
        }
        TaskLookup::Pending => println!("Task {} is pending", args.task_id),
        TaskLookup::Missing => println!("Task {} not found (unknown or expired)", args.task_id),
    }
    Ok(())
}
