//! Retention sweeper: deletes snapshot rows older than the retention window
//! (2 days by default) once, then exits. Meant to be run from cron or a
//! systemd timer, independently of the collector.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;

use fleetmon::{logging, sweeper, EnvSource, MetricsStore};

#[derive(Debug, Parser)]
#[command(
    name = "fleetmon_purge",
    version,
    about = "Delete fleetmon snapshots older than the retention window"
)]
struct Cli {
    /// dotenv file with DATABASE_URL / FLEETMON_RETENTION_SECS
    #[arg(long, short = 'e', value_name = "PATH", default_value = ".env")]
    env_file: PathBuf,

    /// Override DATABASE_URL
    #[arg(long, value_name = "URL")]
    database_url: Option<String>,

    /// Keep rows newer than SECS seconds
    #[arg(long, short = 'r', value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    retention: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init();

    let mut config = EnvSource::new(Some(cli.env_file))
        .config()
        .context("invalid configuration")?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    if let Some(secs) = cli.retention {
        config.retention = Duration::from_secs(secs);
    }

    let store = MetricsStore::connect(&config.database_url)
        .await
        .context("failed to open metrics store")?;
    store
        .ensure_schema()
        .await
        .context("failed to initialize metrics store")?;

    let result = sweeper::sweep(&store, config.retention).await;
    store.pool().close().await;
    if let Err(e) = &result {
        error!("retention sweep failed: {e}");
    }
    result.map(|_| ()).context("retention sweep failed")
}
