//! Entry point for the fleetmon collector. Parses args, loads configuration and
//! runs the collection loop until Ctrl-C / SIGTERM.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use fleetmon::{
    logging, sweeper, AgentCollector, EnvSource, FleetScheduler, MetricsStore, TargetSource,
};

#[derive(Debug, Parser)]
#[command(
    name = "fleetmon",
    version,
    about = "Collect health and resource metrics from a fleet of servers"
)]
struct Cli {
    /// dotenv file with SERVERn_* entries and settings (re-read every cycle)
    #[arg(long, short = 'e', value_name = "PATH", default_value = ".env")]
    env_file: PathBuf,

    /// Override DATABASE_URL, e.g. sqlite://server_monitoring.db
    #[arg(long, value_name = "URL")]
    database_url: Option<String>,

    /// Seconds to sleep between cycles
    #[arg(long, short = 'i', value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    interval: Option<u64>,

    /// Servers processed at once (1 = sequential)
    #[arg(long, short = 'c', value_name = "N", value_parser = clap::value_parser!(u64).range(1..))]
    concurrency: Option<u64>,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Print the resolved server list (without passwords) and exit
    #[arg(long)]
    check_config: bool,

    /// Also purge expired rows every SECS seconds from this process
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    purge_every: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init();

    let source = EnvSource::new(Some(cli.env_file.clone()));
    let mut config = source.config().context("invalid configuration")?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    if let Some(secs) = cli.interval {
        config.interval = Duration::from_secs(secs);
    }
    if let Some(n) = cli.concurrency {
        config.concurrency = n as usize;
    }

    if cli.check_config {
        let targets = source.targets().context("failed to enumerate servers")?;
        println!("{}", serde_json::to_string_pretty(&targets)?);
        return Ok(());
    }

    let store = MetricsStore::connect(&config.database_url)
        .await
        .context("failed to open metrics store")?;
    store
        .ensure_schema()
        .await
        .context("failed to initialize metrics store")?;

    let scheduler = FleetScheduler::new(
        AgentCollector::new(config.agent.clone()),
        source,
        store.clone(),
    )
    .with_interval(config.interval)
    .with_concurrency(config.concurrency);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, finishing in-flight servers");
        let _ = shutdown_tx.send(true);
    });

    if cli.once {
        let result = scheduler.run_cycle(&shutdown_rx).await;
        store.pool().close().await;
        return result.map(|_| ()).context("failed to enumerate servers");
    }

    let sweeper = cli.purge_every.map(|secs| {
        info!(every_secs = secs, "starting in-process retention sweeper");
        sweeper::spawn_sweeper(store.clone(), config.retention, Duration::from_secs(secs))
    });

    info!(
        interval_secs = config.interval.as_secs(),
        concurrency = config.concurrency,
        "fleetmon started"
    );
    let result = scheduler.run(shutdown_rx).await;
    if let Some(handle) = sweeper {
        handle.abort();
    }
    store.pool().close().await;
    result.context("failed to enumerate servers")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
