use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use periodic_lite::client::{Client, FuncStatus};
use periodic_lite::config::{Listen, ServerConfig, StorageConfig};
use periodic_lite::scheduler::Job;
use periodic_lite::server::Server;
use periodic_lite::shutdown::install_shutdown_handler;

const DEFAULT_HOST: &str = "unix:///tmp/periodic.sock";

#[derive(Parser, Debug)]
#[command(name = "periodic-lite")]
#[command(version)]
#[command(about = "A periodic job server: clients submit named jobs, workers grab them")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the job server
    Server(ServerArgs),

    /// Show per-function worker, job and processing counts
    Status {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Submit a job (replaces an existing job with the same func and name)
    Submit {
        #[command(flatten)]
        client: ClientArgs,

        /// Function name
        func: String,

        /// Job name, unique within the function
        name: String,

        /// Opaque job arguments handed to the worker
        #[arg(long, default_value = "")]
        args: String,

        /// Run the job this many seconds from now
        #[arg(long, default_value = "0")]
        sched_later: i64,

        /// Lease timeout in seconds (0 = never reclaim)
        #[arg(long, default_value = "0")]
        timeout: i64,
    },

    /// Remove a job
    Remove {
        #[command(flatten)]
        client: ClientArgs,

        func: String,
        name: String,
    },

    /// Drop a function and all its jobs (ignored while workers advertise it)
    Drop {
        #[command(flatten)]
        client: ClientArgs,

        func: String,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Entry point to listen on: unix:///path or tcp://host:port
    #[arg(long, short = 'H', env = "PERIODIC_PORT", default_value = DEFAULT_HOST)]
    host: String,

    /// Job storage backend
    #[arg(long, default_value = "memory")]
    storage: StorageKind,

    /// SQLite database file (with --storage sqlite)
    #[arg(long, default_value = "periodic.db")]
    db_path: PathBuf,

    /// Socket read timeout in seconds (0 = no timeout)
    #[arg(long, default_value = "0")]
    timeout: u64,

    /// Seconds the dispatcher sleeps when nothing is due
    #[arg(long, default_value = "60")]
    idle_interval: u64,
}

#[derive(Debug, Clone, ValueEnum)]
enum StorageKind {
    Memory,
    Sqlite,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server entry point: unix:///path or tcp://host:port
    #[arg(long, short = 'H', env = "PERIODIC_PORT", default_value = DEFAULT_HOST)]
    host: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct StatusOutput {
    functions: Vec<FuncStatus>,
}

#[derive(Serialize)]
struct AckOutput {
    ok: bool,
    func: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let storage = match args.storage {
        StorageKind::Memory => StorageConfig::Memory,
        StorageKind::Sqlite => StorageConfig::Sqlite { path: args.db_path },
    };

    let mut config = ServerConfig::new(Listen::parse(&args.host)?).with_storage(storage);
    config.socket_timeout = (args.timeout > 0).then(|| Duration::from_secs(args.timeout));
    config.idle_interval = Duration::from_secs(args.idle_interval.max(1));

    tracing::info!(
        listen = %config.listen,
        storage = ?config.storage,
        socket_timeout = ?config.socket_timeout,
        idle_interval = ?config.idle_interval,
        "Starting periodic-lite server"
    );

    let shutdown = install_shutdown_handler()?;
    let server = Server::bind(config).await?;
    server.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn connect(args: &ClientArgs) -> Result<Client, Box<dyn std::error::Error>> {
    let listen = Listen::parse(&args.host)?;
    Ok(Client::connect(&listen).await?)
}

fn print_ack(
    output: &OutputFormat,
    message: &str,
    func: String,
    name: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => {
            let out = AckOutput {
                ok: true,
                func,
                name,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => println!("{}", message),
    }
    Ok(())
}

async fn handle_status(args: ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = connect(&args).await?;
    let functions = client.status().await?;

    match args.output {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&StatusOutput { functions })?
            );
        }
        OutputFormat::Table => {
            if functions.is_empty() {
                println!("No functions registered.");
                return Ok(());
            }
            println!(
                "{:<30} {:>8} {:>8} {:>11}",
                "FUNCTION", "WORKERS", "JOBS", "PROCESSING"
            );
            println!("{}", "-".repeat(60));
            for stat in &functions {
                println!(
                    "{:<30} {:>8} {:>8} {:>11}",
                    stat.func, stat.workers, stat.jobs, stat.processing
                );
            }
        }
    }
    Ok(())
}

async fn handle_submit(
    args: ClientArgs,
    func: String,
    name: String,
    job_args: String,
    sched_later: i64,
    timeout: i64,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = connect(&args).await?;
    let sched_at = if sched_later > 0 {
        chrono::Utc::now().timestamp() + sched_later
    } else {
        0
    };
    let job = Job::new(func.clone(), name.clone())
        .with_args(job_args)
        .with_sched_at(sched_at)
        .with_timeout(timeout.max(0));
    client.submit_job(&job).await?;
    print_ack(&args.output, "Job submitted.", func, Some(name))
}

async fn handle_remove(
    args: ClientArgs,
    func: String,
    name: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = connect(&args).await?;
    client.remove_job(&func, &name).await?;
    print_ack(&args.output, "Job removed.", func, Some(name))
}

async fn handle_drop(args: ClientArgs, func: String) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = connect(&args).await?;
    client.drop_func(&func).await?;
    print_ack(&args.output, "Drop requested.", func, None)
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Status { client } => handle_status(client).await?,
        Commands::Submit {
            client,
            func,
            name,
            args: job_args,
            sched_later,
            timeout,
        } => handle_submit(client, func, name, job_args, sched_later, timeout).await?,
        Commands::Remove { client, func, name } => handle_remove(client, func, name).await?,
        Commands::Drop { client, func } => handle_drop(client, func).await?,
    }

    Ok(())
}
