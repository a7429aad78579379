//! Fleet scheduler: one cycle walks every configured target through
//! liveness -> collect -> decode -> store, then sleeps until the next cycle.
//!
//! A target's failure is logged and counted, never propagated. The only
//! fatal error is failing to enumerate the targets at all.

use std::time::Duration;

use futures::{future, stream, StreamExt};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::collector::Collector;
use crate::config::{TargetSource, DEFAULT_INTERVAL};
use crate::error::{ConfigError, TargetError};
use crate::protocol::{decode_metrics_record, decode_top_users_table};
use crate::store::MetricsStore;
use crate::types::{CollectMode, ServerTarget};

/// Outcome counts for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub stored: usize,
    pub offline: usize,
    pub failed: usize,
}

pub struct FleetScheduler<C, S> {
    collector: C,
    targets: S,
    store: MetricsStore,
    interval: Duration,
    concurrency: usize,
}

impl<C: Collector, S: TargetSource> FleetScheduler<C, S> {
    pub fn new(collector: C, targets: S, store: MetricsStore) -> Self {
        Self {
            collector,
            targets,
            store,
            interval: DEFAULT_INTERVAL,
            concurrency: 1,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn store(&self) -> &MetricsStore {
        &self.store
    }

    /// Cycle until `shutdown` flips to true. In-flight targets finish first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConfigError> {
        loop {
            self.run_cycle(&shutdown).await?;
            if *shutdown.borrow() {
                info!("shutdown requested, stopping after current cycle");
                return Ok(());
            }
            debug!(interval = ?self.interval, "sleeping until next cycle");
            if self.sleep_or_shutdown(&mut shutdown).await {
                info!("shutdown requested while idle");
                return Ok(());
            }
        }
    }

    /// One pass over the fleet. Targets not yet started when `shutdown` is set
    /// are left for a later run.
    pub async fn run_cycle(
        &self,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<CycleReport, ConfigError> {
        let targets = self.targets.targets()?;
        info!(targets = targets.len(), "starting collection cycle");

        let outcomes: Vec<Result<(), TargetError>> = stream::iter(targets)
            .take_while(|_| future::ready(!*shutdown.borrow()))
            .map(|target| async move {
                let outcome = self.process_target(&target).await;
                match &outcome {
                    Ok(()) => info!(server = %target.name, "stored snapshot"),
                    Err(TargetError::Offline) => {
                        error!(server = %target.name, host = %target.host, "server is offline, skipping")
                    }
                    Err(e) => error!(server = %target.name, "skipping server: {e}"),
                }
                outcome
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = CycleReport::default();
        for outcome in outcomes {
            match outcome {
                Ok(()) => report.stored += 1,
                Err(TargetError::Offline) => report.offline += 1,
                Err(_) => report.failed += 1,
            }
        }
        info!(
            stored = report.stored,
            offline = report.offline,
            failed = report.failed,
            "cycle complete"
        );
        Ok(report)
    }

    /// Both sub-collections must succeed before anything is written.
    pub async fn process_target(&self, target: &ServerTarget) -> Result<(), TargetError> {
        if !self.collector.check_liveness(target).await {
            return Err(TargetError::Offline);
        }

        let general = self.collect(target, CollectMode::GeneralMetrics).await?;
        let top = self.collect(target, CollectMode::TopUsers).await?;

        let metrics = decode_metrics_record(&general).map_err(|source| TargetError::Parse {
            what: "metrics record",
            source,
        })?;
        let top_users = decode_top_users_table(&top).map_err(|source| TargetError::Parse {
            what: "top-users table",
            source,
        })?;

        let snapshot = metrics.into_snapshot(target.name.as_str());
        self.store
            .store_metrics_snapshot(&snapshot)
            .await
            .map_err(|source| TargetError::Storage {
                what: "metrics snapshot",
                source,
            })?;
        self.store
            .replace_top_users(&target.name, &top_users)
            .await
            .map_err(|source| TargetError::Storage {
                what: "top users",
                source,
            })?;
        Ok(())
    }

    async fn collect(
        &self,
        target: &ServerTarget,
        mode: CollectMode,
    ) -> Result<String, TargetError> {
        self.collector
            .collect_raw(target, mode)
            .await
            .map_err(|source| TargetError::Collection {
                mode: mode.as_str(),
                source,
            })
    }

    // true when shutdown arrived before the interval elapsed
    async fn sleep_or_shutdown(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let sleep = tokio::time::sleep(self.interval);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                changed = shutdown.changed() => match changed {
                    Ok(()) if *shutdown.borrow() => return true,
                    Ok(()) => continue,
                    Err(_) => {
                        // sender gone: nobody can ask us to stop any more
                        (&mut sleep).await;
                        return false;
                    }
                },
            }
        }
    }
}
