use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use renderq::api::client::HttpSchedulerClient;
use renderq::config::{SchedulerConfig, ServerConfig, WorkerConfig};
use renderq::node::ServerNode;
use renderq::plugin::PluginRegistry;
use renderq::shutdown::install_shutdown_handler;
use renderq::worker::WorkerAgent;

#[derive(Parser, Debug)]
#[command(name = "renderq")]
#[command(version)]
#[command(about = "A render farm scheduler with pull-based workers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the scheduler server (scheduler loop + HTTP API)
    Server(ServerArgs),

    /// Start a worker agent that pulls and renders tasks
    Worker(WorkerArgs),
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address the HTTP API listens on
    #[arg(long, default_value = "0.0.0.0:8000")]
    listen: SocketAddr,

    /// Period between two scheduler sweeps, in milliseconds
    #[arg(long, default_value = "1000")]
    poll_interval_ms: u64,

    /// Heartbeat age after which a worker is declared offline, in milliseconds
    #[arg(long, default_value = "60000")]
    worker_timeout_ms: u64,

    /// Attempts a task gets before it is terminally failed
    #[arg(long, default_value = "3")]
    max_task_retries: u32,

    /// Maximum number of jobs kept in memory
    #[arg(long, default_value = "10000")]
    max_jobs: usize,
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Base URL of the scheduler HTTP API
    #[arg(long, short = 's', default_value = "http://127.0.0.1:8000")]
    server_url: String,

    /// Stable worker identifier (defaults to a random UUID)
    #[arg(long)]
    worker_id: Option<String>,

    /// Human readable name (defaults to the worker id)
    #[arg(long)]
    name: Option<String>,

    /// Pools this worker serves (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "default")]
    pools: Vec<String>,

    /// Plugin types this worker can run (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "aftereffects")]
    capabilities: Vec<String>,

    #[arg(long, default_value = "10000")]
    heartbeat_interval_ms: u64,

    #[arg(long, default_value = "2000")]
    task_poll_interval_ms: u64,

    /// Minimum spacing between two progress reports
    #[arg(long, default_value = "1000")]
    progress_report_interval_ms: u64,

    /// Worker timeout configured on the server; the heartbeat must stay below it
    #[arg(long, default_value = "60000")]
    server_worker_timeout_ms: u64,
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let scheduler = SchedulerConfig::default()
        .with_poll_interval_ms(args.poll_interval_ms)
        .with_worker_timeout_ms(args.worker_timeout_ms)
        .with_max_task_retries(args.max_task_retries)
        .with_max_jobs(args.max_jobs);
    scheduler.validate()?;

    let config = ServerConfig {
        listen_addr: args.listen,
        scheduler,
    };

    let shutdown = install_shutdown_handler();
    ServerNode::new(config).run(shutdown).await
}

// =============================================================================
// Worker Implementation
// =============================================================================

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match args.worker_id {
        Some(id) => WorkerConfig::new(id),
        None => WorkerConfig::default(),
    };
    if let Some(name) = args.name {
        config.name = name;
    }
    config.server_url = args.server_url;
    config.pools = args.pools;
    config.capabilities = args.capabilities;
    config.heartbeat_interval_ms = args.heartbeat_interval_ms;
    config.task_poll_interval_ms = args.task_poll_interval_ms;
    config.progress_report_interval_ms = args.progress_report_interval_ms;
    config.validate_against(std::time::Duration::from_millis(
        args.server_worker_timeout_ms,
    ))?;

    tracing::info!(
        worker_id = %config.worker_id,
        server_url = %config.server_url,
        pools = ?config.pools,
        capabilities = ?config.capabilities,
        "Starting renderq worker"
    );

    let client = Arc::new(HttpSchedulerClient::new(config.server_url.clone())?);
    let agent = WorkerAgent::new(client, config, PluginRegistry::with_builtin());
    let shutdown = install_shutdown_handler();
    agent.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Worker(worker_args) => run_worker(worker_args).await?,
    }

    Ok(())
}
