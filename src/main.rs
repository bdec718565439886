use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use coregrid::api;
use coregrid::config::OrchestratorConfig;
use coregrid::orchestrator::Orchestrator;

#[derive(Parser, Debug)]
#[command(name = "coregrid")]
#[command(version)]
#[command(about = "Distributed job orchestration for geoscience compute fleets")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the orchestrator server
    Server(ServerArgs),

    /// Data reference commands
    Data {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: DataCommands,
    },

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Node fleet commands
    Node {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: NodeCommands,
    },
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port to listen on
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Directory for shared data-reference copies (must be reachable by all
    /// nodes)
    #[arg(long)]
    shared_dir: Option<PathBuf>,

    /// Expected worker heartbeat interval in seconds
    #[arg(long, default_value = "30")]
    heartbeat_interval_secs: u64,

    /// Missed heartbeats before a node is marked dead
    #[arg(long, default_value = "3")]
    dead_threshold: u32,

    /// Retention of terminal jobs in seconds
    #[arg(long, default_value = "3600")]
    job_retention_secs: u64,

    /// Upper bound on partitions per submission
    #[arg(long, default_value = "64")]
    max_partitions: u32,
}

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Orchestrator address
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

#[derive(clap::Subcommand, Debug)]
enum DataCommands {
    /// Register a dataset and obtain a reference id
    Register {
        /// Path to the dataset file
        file: PathBuf,

        /// Declared data type (e.g. "ct_volume")
        #[arg(long, default_value = "ct_volume")]
        data_type: String,

        #[arg(long, default_value = "0")]
        width: u32,

        #[arg(long, default_value = "0")]
        height: u32,

        #[arg(long, default_value = "0")]
        depth: u32,

        #[arg(long, default_value = "0")]
        steps: u32,

        /// Copy the file into shared storage reachable by all nodes
        #[arg(long)]
        copy_to_shared: bool,
    },
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a job, optionally partitioned
    Submit {
        /// Job type (ct_filter, geomechanics, acoustic_sim, multiphase_sim,
        /// monte_carlo)
        job_type: String,

        /// Job parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,

        #[arg(long)]
        data_ref: Option<String>,

        /// Partition strategy (spatial_z, spatial_xy, spatial_octree,
        /// temporal, random)
        #[arg(long)]
        partition: Option<String>,

        #[arg(long, default_value = "1")]
        partition_count: u32,

        /// Overlap slices for spatial_z
        #[arg(long, default_value = "0")]
        overlap: u32,

        /// Seed for the random strategy
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Aggregation strategy (concatenate, merge, sum, average, custom)
        #[arg(long)]
        aggregation: Option<String>,

        #[arg(long, default_value = "0")]
        priority: u8,
    },
    /// Get status and progress of a job
    Status { job_id: String },
    /// Fetch the result of a finished job
    Result { job_id: String },
    /// Long-poll until a job finishes or the timeout elapses
    Wait {
        job_id: String,

        #[arg(long, default_value = "30")]
        timeout_secs: u64,
    },
    /// Cancel a job and its unstarted children
    Cancel { job_id: String },
}

#[derive(clap::Subcommand, Debug)]
enum NodeCommands {
    /// List registered nodes
    List,
}

/// Cancel `token` when the process receives SIGINT or SIGTERM. The API
/// server and the orchestrator's background loops all watch this token.
fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "SIGTERM handler unavailable");
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupt received, shutting down");
            }
            _ = terminate => {
                tracing::info!("SIGTERM received, shutting down");
            }
        }
        token.cancel();
    });
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = OrchestratorConfig::default()
        .with_heartbeat_interval(std::time::Duration::from_secs(args.heartbeat_interval_secs))
        .with_dead_threshold(args.dead_threshold)
        .with_job_retention(std::time::Duration::from_secs(args.job_retention_secs))
        .with_max_partitions(args.max_partitions);
    if let Some(dir) = args.shared_dir {
        config = config.with_shared_storage_dir(dir);
    }

    let addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    tracing::info!(
        addr = %addr,
        heartbeat_interval_secs = args.heartbeat_interval_secs,
        dead_threshold = args.dead_threshold,
        "Starting coregrid orchestrator"
    );

    let orchestrator = Arc::new(Orchestrator::new(config));
    let token = CancellationToken::new();
    cancel_on_signal(token.clone());
    let handles = orchestrator.spawn_background(token.clone());

    api::serve(addr, orchestrator, token).await?;

    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

fn print_value(format: &OutputFormat, value: &Value) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Table => {
            if let Value::Object(map) = value {
                for (key, val) in map {
                    println!("{key:<22} {val}");
                }
            } else {
                println!("{value}");
            }
        }
    }
    Ok(())
}

async fn expect_json(response: reqwest::Response) -> Result<Value, Box<dyn std::error::Error>> {
    let status = response.status();
    if status == reqwest::StatusCode::ACCEPTED {
        return Ok(json!({ "status": "still running" }));
    }
    let body: Value = response.json().await?;
    if !status.is_success() {
        let message = body
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("request failed");
        return Err(format!("{status}: {message}").into());
    }
    Ok(body)
}

async fn handle_data(
    client: &reqwest::Client,
    args: &ClientArgs,
    command: DataCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        DataCommands::Register {
            file,
            data_type,
            width,
            height,
            depth,
            steps,
            copy_to_shared,
        } => {
            let body = json!({
                "file_path": file,
                "data_type": data_type,
                "width": width,
                "height": height,
                "depth": depth,
                "steps": steps,
                "copy_to_shared_storage": copy_to_shared,
            });
            let response = client
                .post(format!("{}/api/data", args.addr))
                .json(&body)
                .send()
                .await?;
            let value = expect_json(response).await?;
            print_value(&args.output, &value)?;
        }
    }
    Ok(())
}

async fn handle_job(
    client: &reqwest::Client,
    args: &ClientArgs,
    command: JobCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        JobCommands::Submit {
            job_type,
            params,
            data_ref,
            partition,
            partition_count,
            overlap,
            seed,
            aggregation,
            priority,
        } => {
            let params: Value = serde_json::from_str(&params)?;
            let mut body = json!({
                "job_type": job_type,
                "parameters": params,
                "priority": priority,
            });
            if let Some(data_ref) = data_ref {
                body["data_reference_id"] = json!(data_ref);
            }
            if let Some(strategy) = partition {
                let mut spec = json!({
                    "strategy": strategy,
                    "count": partition_count,
                });
                if strategy == "spatial_z" {
                    spec["overlap"] = json!(overlap);
                }
                if strategy == "random" {
                    spec["seed"] = json!(seed);
                }
                body["partition"] = spec;
            }
            if let Some(aggregation) = aggregation {
                body["aggregation_strategy"] = json!(aggregation);
            }
            let response = client
                .post(format!("{}/api/jobs", args.addr))
                .json(&body)
                .send()
                .await?;
            let value = expect_json(response).await?;
            print_value(&args.output, &value)?;
        }
        JobCommands::Status { job_id } => {
            let response = client
                .get(format!("{}/api/jobs/{}/status", args.addr, job_id))
                .send()
                .await?;
            let value = expect_json(response).await?;
            print_value(&args.output, &value)?;
        }
        JobCommands::Result { job_id } => {
            let response = client
                .get(format!("{}/api/jobs/{}/result", args.addr, job_id))
                .send()
                .await?;
            let value = expect_json(response).await?;
            print_value(&args.output, &value)?;
        }
        JobCommands::Wait {
            job_id,
            timeout_secs,
        } => {
            let response = client
                .get(format!(
                    "{}/api/jobs/{}/wait?timeout_secs={}",
                    args.addr, job_id, timeout_secs
                ))
                .send()
                .await?;
            let value = expect_json(response).await?;
            print_value(&args.output, &value)?;
        }
        JobCommands::Cancel { job_id } => {
            let response = client
                .post(format!("{}/api/jobs/{}/cancel", args.addr, job_id))
                .send()
                .await?;
            let value = expect_json(response).await?;
            print_value(&args.output, &value)?;
        }
    }
    Ok(())
}

async fn handle_node(
    client: &reqwest::Client,
    args: &ClientArgs,
    command: NodeCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        NodeCommands::List => {
            let response = client
                .get(format!("{}/api/nodes", args.addr))
                .send()
                .await?;
            let value = expect_json(response).await?;
            match args.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&value)?),
                OutputFormat::Table => {
                    let nodes = value.as_array().cloned().unwrap_or_default();
                    if nodes.is_empty() {
                        println!("No nodes registered.");
                        return Ok(());
                    }
                    println!(
                        "{:<38} {:<16} {:<10} {:<6} {:<8} LOAD",
                        "NODE ID", "NAME", "STATUS", "GPU", "JOBS"
                    );
                    println!("{}", "-".repeat(88));
                    for node in nodes {
                        let available = node
                            .get("available")
                            .and_then(Value::as_bool)
                            .unwrap_or(false);
                        println!(
                            "{:<38} {:<16} {:<10} {:<6} {:<8} {:.2}",
                            node.get("node_id").and_then(Value::as_str).unwrap_or("-"),
                            node.get("name").and_then(Value::as_str).unwrap_or("-"),
                            if available { "available" } else { "dead" },
                            node.get("has_gpu")
                                .and_then(Value::as_bool)
                                .unwrap_or(false),
                            node.get("assigned_jobs")
                                .and_then(Value::as_u64)
                                .unwrap_or(0),
                            node.get("load_score")
                                .and_then(Value::as_f64)
                                .unwrap_or(0.0),
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Data { client, command } => {
            let http = reqwest::Client::new();
            handle_data(&http, &client, command).await?;
        }
        Commands::Job { client, command } => {
            let http = reqwest::Client::new();
            handle_job(&http, &client, command).await?;
        }
        Commands::Node { client, command } => {
            let http = reqwest::Client::new();
            handle_node(&http, &client, command).await?;
        }
    }

    Ok(())
}
