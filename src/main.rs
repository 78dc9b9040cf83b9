use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use cascade::execution::{ExecutionPort, PolicyExecutor, SimulatedExecutor};
use cascade::observer::{HealthSource, Observer};
use cascade::registry::{BlockNumber, Registry, RegistryLoader};
use cascade::scheduler::{LoggingEventSink, Scheduler};
use cascade::CascadeConfig;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "cascade", about = "Run a dependency-ordered cascade of blocks")]
struct Args {
    /// YAML configuration file; defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive the cascade until it stops
    Run {
        /// Stop after this many ticks
        max_ticks: Option<u64>,
    },
    /// Watch run progress and alert on stalls
    Observe {
        /// Seconds between samples
        interval_secs: Option<u64>,
    },
    /// Print the current status report
    Status,
    /// Check the registry and configuration
    Validate,
    /// Let a failed block be selected again
    ClearFailure { block: BlockNumber },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => CascadeConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => CascadeConfig::default(),
    };
    config.apply_env()?;

    match args.command.unwrap_or(Command::Run { max_ticks: None }) {
        Command::Run { max_ticks } => {
            if max_ticks.is_some() {
                config.scheduler.max_ticks = max_ticks;
            }
            config.validate()?;
            run(config).await
        }
        Command::Observe { interval_secs } => {
            if let Some(secs) = interval_secs {
                config.observer.interval_ms = secs.saturating_mul(1_000);
            }
            config.validate()?;
            observe(config).await
        }
        Command::Status => status(config).await,
        Command::Validate => validate(config),
        Command::ClearFailure { block } => clear_failure(config, block).await,
    }
}

fn load_registry(config: &CascadeConfig) -> anyhow::Result<Arc<Registry>> {
    let registry = RegistryLoader::new()
        .allow_cycles(config.registry.allow_cycles)
        .load_file(&config.registry.path)
        .with_context(|| format!("loading registry {}", config.registry.path.display()))?;
    Ok(Arc::new(registry))
}

async fn open_scheduler(config: &CascadeConfig) -> anyhow::Result<Scheduler> {
    let registry = load_registry(config)?;
    let store = config.open_store()?;
    let simulated: Arc<dyn ExecutionPort> = Arc::new(SimulatedExecutor::new(
        Duration::from_millis(config.simulated_delay_ms),
    ));
    let executor = Arc::new(PolicyExecutor::new(simulated, config.execution.clone()));
    let health = Arc::new(config.health_tracker().await?);

    let scheduler = Scheduler::open(
        &config.cascade_id,
        registry,
        store,
        executor,
        health,
        config.scheduler.clone(),
    )
    .await?
    .with_event_sink(Arc::new(LoggingEventSink));
    Ok(scheduler)
}

async fn run(config: CascadeConfig) -> anyhow::Result<()> {
    let mut scheduler = open_scheduler(&config).await?;
    info!(
        "cascade: registry {}, state {}",
        config.registry.path.display(),
        config.storage.state_path.display()
    );

    tokio::select! {
        summary = scheduler.run_until_stopped(config.scheduler.max_ticks) => {
            println!("{summary}");
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("cascade: interrupted; the block in progress will be recovered on the next run");
        }
    }
    Ok(())
}

async fn observe(config: CascadeConfig) -> anyhow::Result<()> {
    let store = config.open_reader()?;
    let health = match &config.storage.health_path {
        Some(path) => HealthSource::File(path.clone()),
        None => HealthSource::None,
    };
    let mut observer = Observer::new(store, health, config.observer.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("cascade: observer stopped by user");
        }
        let _ = shutdown_tx.send(true);
    });

    observer.run(shutdown_rx).await;
    Ok(())
}

async fn status(config: CascadeConfig) -> anyhow::Result<()> {
    let store = config.open_reader()?;
    let health = match &config.storage.health_path {
        Some(path) => HealthSource::File(path.clone()),
        None => HealthSource::None,
    };
    let observer = Observer::new(store, health, config.observer.clone());
    println!("{}", observer.sample().await);
    Ok(())
}

fn validate(config: CascadeConfig) -> anyhow::Result<()> {
    config.validate()?;
    let registry = RegistryLoader::new()
        .allow_cycles(true)
        .load_file(&config.registry.path)
        .with_context(|| format!("loading registry {}", config.registry.path.display()))?;

    for block in registry.blocks() {
        println!(
            "{:>4}  {:<32} weight {:<3} depends on {:?}",
            block.block_number, block.name, block.weight, block.depends_on
        );
    }
    let cycles = registry.cycles();
    if !cycles.is_empty() {
        bail!("registry has dependency cycles: {cycles:?}");
    }
    println!("{} blocks, no cycles", registry.len());
    Ok(())
}

async fn clear_failure(config: CascadeConfig, block: BlockNumber) -> anyhow::Result<()> {
    let mut scheduler = open_scheduler(&config).await?;
    if scheduler.clear_failure(block).await {
        println!(
            "block {block} cleared; status now {}",
            scheduler.state().status
        );
    } else {
        println!("block {block} was not marked failed");
    }
    Ok(())
}
