use clap::Parser;
use harvester_persistence::JobStore;
use harvester_worker::admin::AdminServer;
use harvester_worker::broker::NatsConnector;
use harvester_worker::{CommandProcessor, Supervisor, WorkerConfig, WorkerContext};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "hv-worker")]
#[command(about = "Harvester worker runtime", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long)]
    config: Option<String>,

    /// NATS server URL (overrides the config file)
    #[arg(short, long)]
    broker: Option<String>,

    /// Id from a previous registration
    #[arg(long)]
    worker_id: Option<u64>,

    /// Display name sent during authentication
    #[arg(long)]
    name: Option<String>,

    /// Directory holding the job store
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        WorkerConfig::from_file(config_path)?
    } else {
        WorkerConfig::default()
    };

    // Override with CLI args
    if let Some(broker) = args.broker {
        config.broker.url = broker;
    }
    if let Some(worker_id) = args.worker_id {
        config.worker.id = Some(worker_id);
    }
    if let Some(name) = args.name {
        config.worker.name = name;
    }
    if let Some(data_dir) = args.data_dir {
        config.store.data_dir = data_dir;
    }
    config.validate()?;

    let store = Arc::new(JobStore::open(config.to_job_store_config())?);
    let recovered = store.recover_in_work()?;
    info!(recovered, "Job store ready");

    if config.admin.enabled {
        let admin = AdminServer::bind(store.clone(), &config.admin).await?;
        tokio::spawn(async move {
            if let Err(e) = admin.run().await {
                error!("Admin channel stopped: {}", e);
            }
        });
    }

    let connector = Arc::new(NatsConnector::new(
        format!("harvester-{}", config.worker.name),
        &config.broker,
    ));
    let processor = Arc::new(CommandProcessor::new(config.processor.clone()));
    let context = Arc::new(WorkerContext::new(config, store, connector, processor));
    let supervisor = Supervisor::new(context);

    tokio::select! {
        _ = supervisor.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    Ok(())
}
