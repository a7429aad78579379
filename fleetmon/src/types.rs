//! Typed records produced by the protocol decoder and persisted by the store.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One monitored host. `name` is the display and storage key.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct ServerTarget {
    pub name: String,
    pub host: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
}

impl fmt::Debug for ServerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTarget")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Which of the two agent scripts to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectMode {
    GeneralMetrics,
    TopUsers,
}

impl CollectMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GeneralMetrics => "general-metrics",
            Self::TopUsers => "top-users",
        }
    }
}

impl fmt::Display for CollectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A "used/total" pair as reported by the agent, e.g. `3.1G/15G`.
/// Both halves are free-form capacity strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageRatio {
    pub used: String,
    pub total: String,
}

/// Decoded general-metrics line, not yet bound to a server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsRecord {
    pub architecture: String,
    pub operating_system: String,
    pub physical_cpus: u32,
    pub virtual_cpus: u32,
    pub ram: UsageRatio,
    pub ram_percentage: u8, // 0..=100
    pub disk: UsageRatio,
    pub disk_percentage: u8, // 0..=100
    pub load_1min: f64,
    pub load_5min: f64,
    pub load_15min: f64,
    // opaque; the agent's format varies by locale
    pub last_boot: String,
    pub tcp_connections: u32,
    pub logged_users: u32,
    pub active_vnc_users: u32,
    pub active_ssh_users: u32,
}

impl MetricsRecord {
    pub fn into_snapshot(self, server_name: impl Into<String>) -> MetricsSnapshot {
        MetricsSnapshot {
            server_name: server_name.into(),
            captured_at: None,
            metrics: self,
        }
    }
}

/// One point-in-time sample for a server. `captured_at == None` lets the
/// store assign the insert time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub server_name: String,
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub metrics: MetricsRecord,
}

impl MetricsSnapshot {
    pub fn captured_at(mut self, at: DateTime<Utc>) -> Self {
        self.captured_at = Some(at);
        self
    }
}

/// One row of the top-resource-consumers table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopUserEntry {
    pub user: String,
    pub cpu: f64,
    pub mem: f64,
    pub disk: f64,
}

/// A top-users row as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredTopUser {
    pub server_name: String,
    pub captured_at: DateTime<Utc>,
    #[serde(flatten)]
    pub entry: TopUserEntry,
}
