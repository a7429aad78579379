//! Library for fleetmon: collects health metrics from remote servers through an
//! external agent and persists them to a SQLite time-series store.

pub mod collector;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod scheduler;
pub mod store;
pub mod sweeper;
pub mod types;

pub use collector::{AgentCollector, Collector};
pub use config::{Config, EnvSource, TargetSource};
pub use scheduler::{CycleReport, FleetScheduler};
pub use store::{MetricsStore, PurgeReport};
