//! Capfleet CLI - coordinator and worker daemons plus batch/control clients.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use capfleet::{
    Coordinator, CoordinatorConfig, HubClient, ModelManager, ModelState, NatsTransport,
    ProcessAdapterFactory, SharedTransport, SubmittedImage, WorkerConfig, WorkerId, WorkerRuntime,
};

mod config;
use config::Config;

#[derive(Parser)]
#[command(name = "capfleet")]
#[command(version = "0.1.0")]
#[command(about = "Distributed image-captioning worker fleet", long_about = None)]
struct Cli {
    /// Path to configuration file (YAML or TOML)
    #[arg(short, long, global = true, env = "CAPFLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Broker URL (overrides config)
    #[arg(long, global = true, env = "CAPFLEET_NATS_URL")]
    nats_url: Option<String>,

    /// Model hub base URL (overrides config)
    #[arg(long, global = true, env = "CAPFLEET_HUB_URL")]
    hub_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator daemon (registry, expiry sweep)
    Coordinator,

    /// Run a worker daemon
    Worker {
        /// Local model cache directory
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Stable worker identity (generated per session when unset)
        #[arg(long, env = "CAPFLEET_WORKER_ID")]
        worker_id: Option<String>,

        /// Maximum concurrent inferences
        #[arg(long)]
        max_concurrent: Option<usize>,
    },

    /// Submit a batch of images to the fleet and print the aggregate result
    Submit {
        /// Image file (repeatable)
        #[arg(short, long = "image", required = true)]
        images: Vec<PathBuf>,

        /// Model name (repeatable)
        #[arg(short, long = "model", required = true)]
        models: Vec<String>,

        /// Job deadline in seconds
        #[arg(long)]
        deadline_secs: Option<u64>,
    },

    /// List the hub's model catalog
    Models,

    /// List live workers and their model inventories
    Workers {
        /// How long to collect heartbeats before printing
        #[arg(long, default_value = "6")]
        wait_secs: u64,
    },

    /// Ask a worker to download a model from the hub
    Download {
        #[arg(long)]
        worker: String,
        #[arg(long)]
        model: String,
    },

    /// Install custom inference code for a model on a worker
    UploadCustom {
        #[arg(long)]
        worker: String,
        #[arg(long)]
        model: String,
        /// Path to the inference code implementing the runner contract
        #[arg(long)]
        code: PathBuf,
    },

    /// Delete a model's cached bytes from a worker
    Delete {
        #[arg(long)]
        worker: String,
        #[arg(long)]
        model: String,
    },

    /// Evict a model from a worker's memory, keeping its cached bytes
    Unload {
        #[arg(long)]
        worker: String,
        #[arg(long)]
        model: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_or_default(cli.config.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let nats_url = cli
        .nats_url
        .clone()
        .or_else(|| config.nats_url.clone())
        .unwrap_or_else(|| "nats://localhost:4222".to_string());
    let hub_url = cli
        .hub_url
        .clone()
        .or_else(|| config.hub_url.clone())
        .unwrap_or_else(|| "http://localhost:8080".to_string());

    match cli.command {
        Commands::Coordinator => run_coordinator(&nats_url, &hub_url, &config).await,
        Commands::Worker {
            cache_dir,
            worker_id,
            max_concurrent,
        } => run_worker(&nats_url, &hub_url, &config, cache_dir, worker_id, max_concurrent).await,
        Commands::Submit {
            images,
            models,
            deadline_secs,
        } => submit(&nats_url, &hub_url, &config, images, models, deadline_secs).await,
        Commands::Models => {
            let hub = HubClient::new(hub_url);
            let models = hub.list_models().await?;
            println!("{}", serde_json::to_string_pretty(&models)?);
            Ok(())
        }
        Commands::Workers { wait_secs } => {
            let coordinator = client_coordinator(&nats_url, &hub_url, &config, None).await?;
            // Heartbeats arrive on a fixed cadence; give the fleet one round.
            tokio::time::sleep(Duration::from_secs(wait_secs)).await;
            println!(
                "{}",
                serde_json::to_string_pretty(&coordinator.list_workers())?
            );
            Ok(())
        }
        Commands::Download { worker, model } => {
            let (coordinator, worker_id) =
                reach_worker(&nats_url, &hub_url, &config, &worker).await?;
            let state = coordinator.request_download(&worker_id, &model).await?;
            print_control_outcome(&worker, &model, state)
        }
        Commands::UploadCustom {
            worker,
            model,
            code,
        } => {
            let code_bytes = tokio::fs::read(&code)
                .await
                .with_context(|| format!("cannot read {}", code.display()))?;
            let (coordinator, worker_id) =
                reach_worker(&nats_url, &hub_url, &config, &worker).await?;
            let state = coordinator
                .request_custom_download(&worker_id, &model, &code_bytes)
                .await?;
            print_control_outcome(&worker, &model, state)
        }
        Commands::Delete { worker, model } => {
            let (coordinator, worker_id) =
                reach_worker(&nats_url, &hub_url, &config, &worker).await?;
            let state = coordinator.request_delete(&worker_id, &model).await?;
            print_control_outcome(&worker, &model, state)
        }
        Commands::Unload { worker, model } => {
            let (coordinator, worker_id) =
                reach_worker(&nats_url, &hub_url, &config, &worker).await?;
            let state = coordinator.request_unload(&worker_id, &model).await?;
            print_control_outcome(&worker, &model, state)
        }
    }
}

async fn connect(nats_url: &str) -> Result<SharedTransport> {
    let transport = NatsTransport::connect(nats_url)
        .await
        .with_context(|| format!("cannot connect to broker at {nats_url}"))?;
    Ok(Arc::new(transport))
}

fn coordinator_config(config: &Config, deadline_secs: Option<u64>) -> CoordinatorConfig {
    CoordinatorConfig {
        job_deadline: Duration::from_secs(
            deadline_secs.unwrap_or(config.coordinator.job_deadline_secs),
        ),
        control_timeout: Duration::from_secs(config.coordinator.control_timeout_secs),
        ..CoordinatorConfig::default()
    }
}

/// Connect and start an in-process coordinator for client commands.
async fn client_coordinator(
    nats_url: &str,
    hub_url: &str,
    config: &Config,
    deadline_secs: Option<u64>,
) -> Result<Arc<Coordinator>> {
    let transport = connect(nats_url).await?;
    let coordinator = Coordinator::new(
        transport,
        HubClient::new(hub_url),
        coordinator_config(config, deadline_secs),
    );
    coordinator.start().await?;
    Ok(coordinator)
}

async fn run_coordinator(nats_url: &str, hub_url: &str, config: &Config) -> Result<()> {
    let coordinator = client_coordinator(nats_url, hub_url, config, None).await?;
    info!("Coordinator running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    drop(coordinator);
    info!("Coordinator stopped");
    Ok(())
}

async fn run_worker(
    nats_url: &str,
    hub_url: &str,
    config: &Config,
    cache_dir: Option<PathBuf>,
    worker_id: Option<String>,
    max_concurrent: Option<usize>,
) -> Result<()> {
    let transport = connect(nats_url).await?;
    let factory = Arc::new(ProcessAdapterFactory::new(
        config.worker.hosted_runner.clone(),
        config.worker.custom_runner.clone(),
    ));
    let manager = Arc::new(ModelManager::new(
        cache_dir.unwrap_or_else(|| config.worker.cache_dir.clone()),
        config.worker.max_loaded,
        HubClient::new(hub_url),
        factory,
    ));
    let runtime = WorkerRuntime::new(
        transport,
        manager,
        WorkerConfig {
            worker_id: worker_id.or_else(|| config.worker.worker_id.clone()),
            max_concurrent: max_concurrent.unwrap_or(config.worker.max_concurrent),
            heartbeat_interval: Duration::from_secs(config.worker.heartbeat_secs),
        },
    );
    info!("Worker {} starting", runtime.id());

    tokio::select! {
        result = Arc::clone(&runtime).run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            runtime.shutdown().await;
        }
    }
    Ok(())
}

async fn submit(
    nats_url: &str,
    hub_url: &str,
    config: &Config,
    images: Vec<PathBuf>,
    models: Vec<String>,
    deadline_secs: Option<u64>,
) -> Result<()> {
    let coordinator = client_coordinator(nats_url, hub_url, config, deadline_secs).await?;

    let mut submitted = Vec::with_capacity(images.len());
    for path in &images {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        submitted.push(SubmittedImage::inline(id, &bytes));
    }

    let job_id = coordinator.submit_job(submitted, models).await?;
    info!("Job {} submitted, awaiting results", job_id);

    coordinator.wait_job_result(&job_id).await?;
    let result = coordinator.take_job_result(&job_id).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Start a client coordinator and wait until the target worker shows up in
/// the heartbeat-fed registry.
async fn reach_worker(
    nats_url: &str,
    hub_url: &str,
    config: &Config,
    worker: &str,
) -> Result<(Arc<Coordinator>, WorkerId)> {
    let coordinator = client_coordinator(nats_url, hub_url, config, None).await?;
    let worker_id = WorkerId(worker.to_string());

    let deadline = tokio::time::Instant::now() + 2 * capfleet::HEARTBEAT_INTERVAL;
    loop {
        if coordinator.list_workers().iter().any(|w| w.id == worker) {
            return Ok((coordinator, worker_id));
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("worker '{worker}' not seen in any heartbeat");
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn print_control_outcome(worker: &str, model: &str, state: ModelState) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "worker": worker,
            "model": model,
            "model_state": state,
        }))?
    );
    Ok(())
}
