//! Retention sweeper: deletes snapshot rows older than the retention window.
//! Runs out-of-band from the collection cycle and shares nothing with it but
//! the store.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::error::StorageError;
use crate::store::{MetricsStore, PurgeReport};

/// One sweep. Callers decide what a failure means; the daemon only logs it.
pub async fn sweep(store: &MetricsStore, retention: Duration) -> Result<PurgeReport, StorageError> {
    let report = store.purge_older_than(retention).await?;
    info!(
        metrics_deleted = report.metrics_deleted,
        top_users_deleted = report.top_users_deleted,
        retention = ?retention,
        "purged expired snapshots"
    );
    Ok(report)
}

/// Sweep every `period` in the background, starting immediately.
pub fn spawn_sweeper(store: MetricsStore, retention: Duration, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = sweep(&store, retention).await {
                error!("retention sweep failed: {e}");
            }
        }
    })
}
