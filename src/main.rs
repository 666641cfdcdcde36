use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use conductor_lite::api::{ExecutionView, SubmitExecutionRequest};
use conductor_lite::client::ApiClient;
use conductor_lite::config::{
    NodeConfig, OrchestratorConfig, QueueConfig, SandboxConfig, StoreConfig, WorkerConfig,
    WorkerPoolConfig,
};
use conductor_lite::node::Node;
use conductor_lite::shutdown::install_shutdown_handler;
use conductor_lite::worker::{JobExecutor, WorkerRuntime};

#[derive(Parser, Debug)]
#[command(name = "conductor-lite")]
#[command(version)]
#[command(about = "A distributed DAG job orchestrator")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a server node (store, queue, orchestrators, HTTP API)
    Server(ServerArgs),

    /// Start a worker process that pulls jobs from a server
    Worker(WorkerArgs),

    /// Execution management commands
    Execution {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ExecutionCommands,
    },

    /// Job queue commands
    Queue {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Show aggregate health of queue, store and worker pool
    Health {
        #[command(flatten)]
        client: ClientArgs,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address for the HTTP API
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Orchestrator instances sharing this node's store and queue
    #[arg(long, default_value = "1")]
    instances: usize,

    /// Reconciliation loop interval in milliseconds
    #[arg(long, default_value = "10000")]
    reconcile_interval_ms: u64,

    /// Worker heartbeat timeout in milliseconds
    #[arg(long, default_value = "90000")]
    heartbeat_timeout_ms: u64,

    /// Failover scan interval in milliseconds
    #[arg(long, default_value = "30000")]
    failover_scan_interval_ms: u64,

    /// Execution lock TTL in milliseconds
    #[arg(long, default_value = "30000")]
    lock_ttl_ms: u64,

    /// Job queue capacity
    #[arg(long, default_value = "10000")]
    queue_capacity: usize,

    /// Also run a worker inside this process
    #[arg(long)]
    embedded_worker: bool,

    /// Concurrency of the embedded worker
    #[arg(long, default_value = "4")]
    worker_concurrency: u32,

    /// Run shell jobs in Docker containers
    #[arg(long)]
    sandbox: bool,

    /// Docker image for sandboxed shell jobs
    #[arg(long, default_value = "alpine:latest")]
    image: String,
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Worker ID (defaults to a random one)
    #[arg(long)]
    worker_id: Option<String>,

    /// Hostname reported at registration
    #[arg(long, default_value = "localhost")]
    hostname: String,

    /// Capability tag; repeat for several (e.g. --capability gpu)
    #[arg(long = "capability")]
    capabilities: Vec<String>,

    /// Maximum jobs run in parallel
    #[arg(long, default_value = "4")]
    max_concurrency: u32,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value = "30000")]
    heartbeat_interval_ms: u64,

    /// Run shell jobs in Docker containers
    #[arg(long)]
    sandbox: bool,

    /// Docker image for sandboxed shell jobs
    #[arg(long, default_value = "alpine:latest")]
    image: String,
}

// =============================================================================
// Client Arguments (shared by execution, queue and health commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
    addr: String,

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
// Execution Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum ExecutionCommands {
    /// Submit a DAG from a JSON file ({"workflow_id": ..., "nodes": [...]})
    Submit {
        /// Path to the DAG definition
        file: PathBuf,
    },
    /// Show an execution and its nodes
    Status { execution_id: Uuid },
    /// Cancel an execution
    Cancel { execution_id: Uuid },
    /// Pause an execution
    Pause { execution_id: Uuid },
    /// Resume a paused execution
    Resume { execution_id: Uuid },
    /// List executions
    List,
}

#[derive(clap::Subcommand, Debug)]
enum QueueCommands {
    /// Show queue depth, oldest entry age and dead-letter count
    Stats,
    /// List entries that exhausted their retries
    DeadLetters,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct SubmitOutput {
    execution_id: Uuid,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_execution(execution: &ExecutionView) {
    println!("Execution ID: {}", execution.execution_id);
    println!("Workflow:     {}", execution.workflow_id);
    println!("Status:       {}", execution.status);
    println!("Created:      {}", execution.created_at.to_rfc3339());
    println!("Updated:      {}", execution.updated_at.to_rfc3339());
    if let Some(failure) = &execution.failure {
        println!("Failed node:  {} ({})", failure.node_id, failure.error);
    }
    println!();
    println!(
        "{:<20} {:<12} {:<8} {:<20} ERROR",
        "NODE", "STATUS", "ATTEMPT", "WORKER"
    );
    println!("{}", "-".repeat(78));
    for (id, node) in &execution.nodes {
        println!(
            "{:<20} {:<12} {:<8} {:<20} {}",
            id,
            node.status.to_string(),
            node.attempt,
            node.assigned_worker_id.as_deref().unwrap_or("-"),
            node.error.as_deref().unwrap_or("")
        );
    }
}

// =============================================================================
// Server and Worker
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let sandbox = SandboxConfig {
        enabled: args.sandbox,
        image: args.image,
        ..SandboxConfig::default()
    };
    let orchestrator = OrchestratorConfig {
        reconcile_interval_ms: args.reconcile_interval_ms,
        ..OrchestratorConfig::default()
    }
    .with_pool(WorkerPoolConfig {
        heartbeat_timeout_ms: args.heartbeat_timeout_ms,
        failover_scan_interval_ms: args.failover_scan_interval_ms,
        ..WorkerPoolConfig::default()
    })
    .with_store(StoreConfig {
        lock_ttl_ms: args.lock_ttl_ms,
        ..StoreConfig::default()
    })
    .with_queue(QueueConfig {
        capacity: args.queue_capacity,
        ..QueueConfig::default()
    });

    let mut config = NodeConfig {
        orchestrator_instances: args.instances,
        orchestrator,
        ..NodeConfig::new(args.listen)
    };
    if args.embedded_worker {
        let worker = WorkerConfig {
            sandbox,
            ..WorkerConfig::default()
        }
        .with_max_concurrency(args.worker_concurrency);
        config = config.with_embedded_worker(worker);
    }

    tracing::info!(
        listen_addr = %config.listen_addr,
        instances = config.orchestrator_instances,
        embedded_worker = config.embedded_worker.is_some(),
        "Starting conductor-lite node"
    );

    let shutdown = install_shutdown_handler();
    Node::new(config).run(shutdown).await?;
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut config = WorkerConfig {
        hostname: args.hostname,
        capabilities: args.capabilities.into_iter().collect::<BTreeSet<_>>(),
        heartbeat_interval_ms: args.heartbeat_interval_ms,
        sandbox: SandboxConfig {
            enabled: args.sandbox,
            image: args.image,
            ..SandboxConfig::default()
        },
        ..WorkerConfig::default()
    }
    .with_max_concurrency(args.max_concurrency);
    if let Some(worker_id) = args.worker_id {
        config.worker_id = worker_id;
    }

    tracing::info!(
        worker_id = %config.worker_id,
        server = %args.addr,
        capabilities = ?config.capabilities,
        max_concurrency = config.max_concurrency,
        "Starting conductor-lite worker"
    );

    let control = std::sync::Arc::new(ApiClient::new(args.addr));
    let executor = JobExecutor::with_sandbox(config.sandbox.clone());
    let shutdown = install_shutdown_handler();
    WorkerRuntime::new(config, control, executor)
        .run(shutdown)
        .await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_execution(
    client: &ApiClient,
    command: ExecutionCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        ExecutionCommands::Submit { file } => {
            let raw = tokio::fs::read_to_string(&file).await?;
            let request: SubmitExecutionRequest = serde_json::from_str(&raw)?;
            let execution_id = client.submit(&request.workflow_id, request.nodes).await?;
            match output_format {
                OutputFormat::Json => print_json(&SubmitOutput { execution_id })?,
                OutputFormat::Table => {
                    println!("Execution submitted successfully!");
                    println!("Execution ID: {execution_id}");
                }
            }
        }
        ExecutionCommands::Status { execution_id } => {
            let execution = client.get_execution(execution_id).await?;
            match output_format {
                OutputFormat::Json => print_json(&execution)?,
                OutputFormat::Table => print_execution(&execution),
            }
        }
        ExecutionCommands::Cancel { execution_id } => {
            let response = client.cancel(execution_id).await?;
            match output_format {
                OutputFormat::Json => print_json(&response)?,
                OutputFormat::Table => println!("Cancellation requested for {execution_id}"),
            }
        }
        ExecutionCommands::Pause { execution_id } => {
            let response = client.pause(execution_id).await?;
            match output_format {
                OutputFormat::Json => print_json(&response)?,
                OutputFormat::Table => println!("Execution {execution_id} is {}", response.status),
            }
        }
        ExecutionCommands::Resume { execution_id } => {
            let response = client.resume(execution_id).await?;
            match output_format {
                OutputFormat::Json => print_json(&response)?,
                OutputFormat::Table => println!("Execution {execution_id} is {}", response.status),
            }
        }
        ExecutionCommands::List => {
            let executions = client.list_executions().await?;
            match output_format {
                OutputFormat::Json => print_json(&executions)?,
                OutputFormat::Table => {
                    if executions.is_empty() {
                        println!("No executions found.");
                    } else {
                        println!(
                            "{:<38} {:<20} {:<10} {:<6} CREATED",
                            "EXECUTION ID", "WORKFLOW", "STATUS", "NODES"
                        );
                        println!("{}", "-".repeat(100));
                        for execution in &executions {
                            println!(
                                "{:<38} {:<20} {:<10} {:<6} {}",
                                execution.execution_id,
                                execution.workflow_id,
                                execution.status.to_string(),
                                execution.nodes.len(),
                                execution.created_at.to_rfc3339()
                            );
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

async fn handle_queue_stats(
    client: &ApiClient,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let stats = client.queue_stats().await?;
    match output_format {
        OutputFormat::Json => print_json(&stats)?,
        OutputFormat::Table => {
            println!("Queue Stats");
            println!("{}", "=".repeat(40));
            println!("Depth:          {}", stats.depth);
            println!("Delayed:        {}", stats.delayed);
            println!("In flight:      {}", stats.in_flight);
            match stats.oldest_entry_age_ms {
                Some(age) => println!("Oldest entry:   {age} ms"),
                None => println!("Oldest entry:   -"),
            }
            println!("Dead letters:   {}", stats.dead_letter_count);
            println!("Unschedulable:  {}", stats.unschedulable);
        }
    }
    Ok(())
}

async fn handle_dead_letters(
    client: &ApiClient,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let dead = client.dead_letters().await?;
    match output_format {
        OutputFormat::Json => print_json(&dead)?,
        OutputFormat::Table => {
            if dead.is_empty() {
                println!("No dead-lettered entries.");
                return Ok(());
            }
            println!(
                "{:<38} {:<20} {:<8} REASON",
                "EXECUTION ID", "JOB", "ATTEMPT"
            );
            println!("{}", "-".repeat(90));
            for letter in &dead {
                println!(
                    "{:<38} {:<20} {:<8} {}",
                    letter.entry.execution_id,
                    letter.entry.job_id,
                    letter.entry.attempt,
                    letter.reason
                );
            }
        }
    }
    Ok(())
}

async fn handle_health(
    client: &ApiClient,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let report = client.health().await?;
    match output_format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            let mark = |healthy: bool| if healthy { "[+]" } else { "[-]" };
            println!("Instance: {}", report.instance_id);
            println!("Overall:  {} {}", mark(report.healthy), if report.healthy { "healthy" } else { "unhealthy" });
            println!();
            println!("{:<10} {:<5} DETAIL", "COMPONENT", "OK");
            println!("{}", "-".repeat(45));
            println!("{:<10} {:<5} {}", "queue", mark(report.queue.healthy), report.queue.detail);
            println!("{:<10} {:<5} {}", "store", mark(report.store.healthy), report.store.detail);
            println!("{:<10} {:<5} {}", "workers", mark(report.workers.healthy), report.workers.detail);
        }
    }
    if !report.healthy {
        std::process::exit(1);
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Worker(worker_args) => {
            run_worker(worker_args).await?;
        }
        Commands::Execution { client, command } => {
            let api = ApiClient::new(client.addr.clone());
            handle_execution(&api, command, &client.output).await?;
        }
        Commands::Queue { client, command } => {
            let api = ApiClient::new(client.addr.clone());
            match command {
                QueueCommands::Stats => handle_queue_stats(&api, &client.output).await?,
                QueueCommands::DeadLetters => handle_dead_letters(&api, &client.output).await?,
            }
        }
        Commands::Health { client } => {
            let api = ApiClient::new(client.addr.clone());
            handle_health(&api, &client.output).await?;
        }
    }

    Ok(())
}
