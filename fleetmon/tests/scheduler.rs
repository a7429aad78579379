//! Scheduler fault isolation with a scripted collector.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetmon::error::CollectionError;
use fleetmon::types::{CollectMode, ServerTarget};
use fleetmon::{Collector, FleetScheduler, MetricsStore};
use tokio::sync::watch;

const GOOD_METRICS: &str = "x86_64,Linux,2,4,1G/2G,50,10G/20G,50%,0.1,0.2,0.3,boot,5,1,0,0";
const GOOD_TOP: &str = "alice 10.5 20.1 nan\nbob 5.0 3.2 1.1\n";

#[derive(Clone)]
enum Behaviour {
    Healthy,
    Offline,
    AgentFails(CollectMode),
    Output { metrics: &'static str, top: &'static str },
}

#[derive(Default)]
struct FakeCollector {
    behaviour: HashMap<String, Behaviour>,
    probes: AtomicUsize,
    invocations: AtomicUsize,
}

impl FakeCollector {
    fn with(mut self, host: &str, b: Behaviour) -> Self {
        self.behaviour.insert(host.to_string(), b);
        self
    }

    fn behaviour(&self, target: &ServerTarget) -> Behaviour {
        self.behaviour
            .get(&target.host)
            .cloned()
            .unwrap_or(Behaviour::Healthy)
    }
}

#[async_trait]
impl Collector for FakeCollector {
    async fn check_liveness(&self, target: &ServerTarget) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        !matches!(self.behaviour(target), Behaviour::Offline)
    }

    async fn collect_raw(
        &self,
        target: &ServerTarget,
        mode: CollectMode,
    ) -> Result<String, CollectionError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        match (self.behaviour(target), mode) {
            (Behaviour::AgentFails(m), _) if m == mode => Err(CollectionError::Spawn {
                program: "agent".into(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no agent"),
            }),
            (Behaviour::Output { metrics, .. }, CollectMode::GeneralMetrics) => Ok(metrics.into()),
            (Behaviour::Output { top, .. }, CollectMode::TopUsers) => Ok(top.into()),
            (_, CollectMode::GeneralMetrics) => Ok(GOOD_METRICS.into()),
            (_, CollectMode::TopUsers) => Ok(GOOD_TOP.into()),
        }
    }
}

fn fleet(n: usize) -> Vec<ServerTarget> {
    (1..=n)
        .map(|i| ServerTarget {
            name: format!("srv{i}"),
            host: format!("host{i}"),
            username: "mon".into(),
            password: "secret".into(),
        })
        .collect()
}

async fn store() -> MetricsStore {
    let store = MetricsStore::in_memory().await.unwrap();
    store.ensure_schema().await.unwrap();
    store
}

fn never_stop() -> watch::Receiver<bool> {
    watch::channel(false).1
}

#[tokio::test]
async fn offline_target_is_skipped_others_stored() {
    let collector = FakeCollector::default().with("host3", Behaviour::Offline);
    let scheduler = FleetScheduler::new(collector, fleet(5), store().await);

    let report = scheduler.run_cycle(&never_stop()).await.unwrap();
    assert_eq!(report.stored, 4);
    assert_eq!(report.offline, 1);
    assert_eq!(report.failed, 0);

    let store = scheduler.store();
    assert_eq!(store.snapshot_count(None).await.unwrap(), 4);
    assert_eq!(store.snapshot_count(Some("srv3")).await.unwrap(), 0);
    assert!(store.top_users("srv3").await.unwrap().is_empty());
    assert_eq!(store.top_users("srv1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn failures_are_contained_per_server() {
    let collector = FakeCollector::default()
        .with("host1", Behaviour::AgentFails(CollectMode::TopUsers))
        .with(
            "host2",
            Behaviour::Output {
                metrics: "not,enough,fields",
                top: GOOD_TOP,
            },
        )
        .with(
            "host3",
            Behaviour::Output {
                metrics: GOOD_METRICS,
                top: "alice 1.0 2.0 3.0\ncarl 1.0 2.0\n",
            },
        )
        .with("host4", Behaviour::AgentFails(CollectMode::GeneralMetrics));
    let scheduler = FleetScheduler::new(collector, fleet(6), store().await);

    let report = scheduler.run_cycle(&never_stop()).await.unwrap();
    assert_eq!(report.stored, 2);
    assert_eq!(report.failed, 4);

    let store = scheduler.store();
    for failed in ["srv1", "srv2", "srv3", "srv4"] {
        assert_eq!(store.snapshot_count(Some(failed)).await.unwrap(), 0, "{failed}");
        assert!(store.top_users(failed).await.unwrap().is_empty(), "{failed}");
    }
    assert_eq!(store.snapshot_count(Some("srv5")).await.unwrap(), 1);
    assert_eq!(store.snapshot_count(Some("srv6")).await.unwrap(), 1);
}

#[tokio::test]
async fn failed_cycle_keeps_previous_top_users() {
    let store = store().await;
    let first = FleetScheduler::new(FakeCollector::default(), fleet(1), store.clone());
    first.run_cycle(&never_stop()).await.unwrap();

    let broken = FakeCollector::default().with(
        "host1",
        Behaviour::Output {
            metrics: GOOD_METRICS,
            top: "mallory x 1 1",
        },
    );
    let second = FleetScheduler::new(broken, fleet(1), store.clone());
    let report = second.run_cycle(&never_stop()).await.unwrap();
    assert_eq!(report.failed, 1);

    let users: Vec<_> = store
        .top_users("srv1")
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.entry.user)
        .collect();
    assert_eq!(users, ["alice", "bob"]);
    assert_eq!(store.snapshot_count(Some("srv1")).await.unwrap(), 1);
}

#[tokio::test]
async fn parallel_cycle_matches_sequential_result() {
    let collector = FakeCollector::default().with("host2", Behaviour::Offline);
    let scheduler =
        FleetScheduler::new(collector, fleet(8), store().await).with_concurrency(4);

    let report = scheduler.run_cycle(&never_stop()).await.unwrap();
    assert_eq!(report.stored, 7);
    assert_eq!(report.offline, 1);
    assert_eq!(scheduler.store().snapshot_count(None).await.unwrap(), 7);
}

#[tokio::test]
async fn shutdown_before_cycle_starts_no_targets() {
    let collector = FakeCollector::default();
    let scheduler = FleetScheduler::new(collector, fleet(3), store().await);
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();

    let report = scheduler.run_cycle(&rx).await.unwrap();
    assert_eq!(report, Default::default());
}

struct CountingSource {
    reads: Arc<AtomicUsize>,
}

impl fleetmon::TargetSource for CountingSource {
    fn targets(&self) -> Result<Vec<ServerTarget>, fleetmon::error::ConfigError> {
        let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        // fleet grows by one server per cycle
        Ok(fleet(n))
    }
}

async fn wait_for_snapshot(store: &MetricsStore, server: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while store.snapshot_count(Some(server)).await.unwrap() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "no snapshot for {server}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn targets_are_reread_every_cycle() {
    let reads = Arc::new(AtomicUsize::new(0));
    let source = CountingSource {
        reads: reads.clone(),
    };
    let store = store().await;
    let scheduler = FleetScheduler::new(FakeCollector::default(), source, store.clone())
        .with_interval(Duration::from_millis(20));
    let (tx, rx) = watch::channel(false);

    let runner = tokio::spawn(async move { scheduler.run(rx).await });

    // srv3 only exists from the third read onwards
    wait_for_snapshot(&store, "srv3").await;
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(10), runner)
        .await
        .expect("scheduler stopped")
        .unwrap()
        .unwrap();

    assert!(reads.load(Ordering::SeqCst) >= 3);
    assert!(store.snapshot_count(Some("srv1")).await.unwrap() >= 3);
}

#[tokio::test]
async fn shutdown_interrupts_the_idle_sleep() {
    let store = store().await;
    let scheduler = FleetScheduler::new(FakeCollector::default(), fleet(2), store.clone())
        .with_interval(Duration::from_secs(3600));
    let (tx, rx) = watch::channel(false);

    let runner = tokio::spawn(async move { scheduler.run(rx).await });
    wait_for_snapshot(&store, "srv2").await;
    tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(10), runner)
        .await
        .expect("scheduler did not wake from its sleep")
        .unwrap()
        .unwrap();
    assert_eq!(store.snapshot_count(None).await.unwrap(), 2);
}
