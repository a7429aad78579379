//! Snapshot persistence in SQLite.
//!
//! Two tables: `server_metrics` is append-only history, `top_users` holds the
//! current top-consumers set per server and is replaced wholesale each cycle.
//! Capture times are unix seconds assigned by the store unless supplied.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info, instrument};

use crate::error::StorageError;
use crate::types::{MetricsRecord, MetricsSnapshot, StoredTopUser, TopUserEntry, UsageRatio};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS server_metrics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        captured_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER)),
        server_name TEXT NOT NULL CHECK (server_name <> ''),
        architecture TEXT NOT NULL,
        operating_system TEXT NOT NULL,
        physical_cpus INTEGER NOT NULL,
        virtual_cpus INTEGER NOT NULL,
        ram_used TEXT NOT NULL,
        ram_total TEXT NOT NULL,
        ram_percentage INTEGER NOT NULL CHECK (ram_percentage BETWEEN 0 AND 100),
        disk_used TEXT NOT NULL,
        disk_total TEXT NOT NULL,
        disk_percentage INTEGER NOT NULL CHECK (disk_percentage BETWEEN 0 AND 100),
        cpu_load_1min REAL NOT NULL,
        cpu_load_5min REAL NOT NULL,
        cpu_load_15min REAL NOT NULL,
        last_boot TEXT NOT NULL,
        tcp_connections INTEGER NOT NULL,
        logged_users INTEGER NOT NULL,
        active_vnc_users INTEGER NOT NULL,
        active_ssh_users INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_server_metrics_server ON server_metrics (server_name, captured_at)",
    "CREATE INDEX IF NOT EXISTS idx_server_metrics_captured_at ON server_metrics (captured_at)",
    r#"
    CREATE TABLE IF NOT EXISTS top_users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        captured_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER)),
        server_name TEXT NOT NULL CHECK (server_name <> ''),
        user TEXT NOT NULL CHECK (user <> ''),
        cpu REAL NOT NULL,
        mem REAL NOT NULL,
        disk REAL NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_top_users_server ON top_users (server_name)",
    "CREATE INDEX IF NOT EXISTS idx_top_users_captured_at ON top_users (captured_at)",
];

/// Rows removed by one retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub metrics_deleted: u64,
    pub top_users_deleted: u64,
}

#[derive(Clone)]
pub struct MetricsStore {
    pool: SqlitePool,
}

impl MetricsStore {
    /// Open (creating if missing) the database at `url`, e.g. `sqlite://fleet.db`
    /// or `sqlite::memory:`.
    #[instrument]
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let to_err = |source| StorageError::Connect {
            url: url.to_string(),
            source,
        };
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");

        let mut options = SqliteConnectOptions::from_str(url)
            .map_err(to_err)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // An in-memory database lives only as long as its connection.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(options).await.map_err(to_err)?;

        info!("opened metrics store");
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self, StorageError> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create both tables if absent. Idempotent.
    #[instrument(skip(self))]
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(StorageError::Schema)?;
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&mut *tx)
                .await
                .map_err(StorageError::Schema)?;
        }
        tx.commit().await.map_err(StorageError::Schema)?;
        debug!("schema ready");
        Ok(())
    }

    /// Append one snapshot and return its row id.
    #[instrument(skip(self, snapshot), fields(server = %snapshot.server_name))]
    pub async fn store_metrics_snapshot(
        &self,
        snapshot: &MetricsSnapshot,
    ) -> Result<i64, StorageError> {
        let m = &snapshot.metrics;
        let result = sqlx::query(
            r#"
            INSERT INTO server_metrics (
                captured_at, server_name, architecture, operating_system,
                physical_cpus, virtual_cpus, ram_used, ram_total, ram_percentage,
                disk_used, disk_total, disk_percentage,
                cpu_load_1min, cpu_load_5min, cpu_load_15min, last_boot,
                tcp_connections, logged_users, active_vnc_users, active_ssh_users
            ) VALUES (
                COALESCE(?, CAST(strftime('%s', 'now') AS INTEGER)), ?, ?, ?,
                ?, ?, ?, ?, ?,
                ?, ?, ?,
                ?, ?, ?, ?,
                ?, ?, ?, ?
            )
            "#,
        )
        .bind(snapshot.captured_at.map(|t| t.timestamp()))
        .bind(&snapshot.server_name)
        .bind(&m.architecture)
        .bind(&m.operating_system)
        .bind(i64::from(m.physical_cpus))
        .bind(i64::from(m.virtual_cpus))
        .bind(&m.ram.used)
        .bind(&m.ram.total)
        .bind(i64::from(m.ram_percentage))
        .bind(&m.disk.used)
        .bind(&m.disk.total)
        .bind(i64::from(m.disk_percentage))
        .bind(m.load_1min)
        .bind(m.load_5min)
        .bind(m.load_15min)
        .bind(&m.last_boot)
        .bind(i64::from(m.tcp_connections))
        .bind(i64::from(m.logged_users))
        .bind(i64::from(m.active_vnc_users))
        .bind(i64::from(m.active_ssh_users))
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Swap the server's top-users set for `entries`, stamped with the current time.
    pub async fn replace_top_users(
        &self,
        server_name: &str,
        entries: &[TopUserEntry],
    ) -> Result<(), StorageError> {
        self.replace_top_users_at(server_name, entries, Utc::now())
            .await
    }

    /// Delete-then-insert inside one transaction: readers see either the old
    /// complete set or the new one. Any error rolls the whole swap back.
    #[instrument(skip(self, entries), fields(server = %server_name, rows = entries.len()))]
    pub async fn replace_top_users_at(
        &self,
        server_name: &str,
        entries: &[TopUserEntry],
        captured_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM top_users WHERE server_name = ?")
            .bind(server_name)
            .execute(&mut *tx)
            .await?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO top_users (captured_at, server_name, user, cpu, mem, disk)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(captured_at.timestamp())
            .bind(server_name)
            .bind(&entry.user)
            .bind(entry.cpu)
            .bind(entry.mem)
            .bind(entry.disk)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Delete rows from both tables captured more than `age` ago.
    pub async fn purge_older_than(&self, age: Duration) -> Result<PurgeReport, StorageError> {
        let cutoff = chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.purge_before(cutoff).await
    }

    /// Delete rows captured strictly before `cutoff`; rows at the cutoff are kept.
    /// Stored times are whole seconds, so a fractional cutoff rounds up.
    #[instrument(skip(self))]
    pub async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport, StorageError> {
        let cutoff = cutoff.timestamp() + i64::from(cutoff.timestamp_subsec_nanos() > 0);
        let mut tx = self.pool.begin().await?;

        let metrics = sqlx::query("DELETE FROM server_metrics WHERE captured_at < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
        let top_users = sqlx::query("DELETE FROM top_users WHERE captured_at < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(PurgeReport {
            metrics_deleted: metrics.rows_affected(),
            top_users_deleted: top_users.rows_affected(),
        })
    }

    /// Newest first.
    pub async fn recent_snapshots(
        &self,
        server_name: &str,
        limit: u32,
    ) -> Result<Vec<MetricsSnapshot>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT captured_at, server_name, architecture, operating_system,
                   physical_cpus, virtual_cpus, ram_used, ram_total, ram_percentage,
                   disk_used, disk_total, disk_percentage,
                   cpu_load_1min, cpu_load_5min, cpu_load_15min, last_boot,
                   tcp_connections, logged_users, active_vnc_users, active_ssh_users
            FROM server_metrics
            WHERE server_name = ?
            ORDER BY captured_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(server_name)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<MetricsSnapshot, StorageError> {
                Ok(MetricsSnapshot {
                    captured_at: Some(timestamp(row.try_get("captured_at")?)?),
                    server_name: row.try_get("server_name")?,
                    metrics: MetricsRecord {
                        architecture: row.try_get("architecture")?,
                        operating_system: row.try_get("operating_system")?,
                        physical_cpus: narrow(&row, "physical_cpus")?,
                        virtual_cpus: narrow(&row, "virtual_cpus")?,
                        ram: UsageRatio {
                            used: row.try_get("ram_used")?,
                            total: row.try_get("ram_total")?,
                        },
                        ram_percentage: narrow(&row, "ram_percentage")?,
                        disk: UsageRatio {
                            used: row.try_get("disk_used")?,
                            total: row.try_get("disk_total")?,
                        },
                        disk_percentage: narrow(&row, "disk_percentage")?,
                        load_1min: row.try_get("cpu_load_1min")?,
                        load_5min: row.try_get("cpu_load_5min")?,
                        load_15min: row.try_get("cpu_load_15min")?,
                        last_boot: row.try_get("last_boot")?,
                        tcp_connections: narrow(&row, "tcp_connections")?,
                        logged_users: narrow(&row, "logged_users")?,
                        active_vnc_users: narrow(&row, "active_vnc_users")?,
                        active_ssh_users: narrow(&row, "active_ssh_users")?,
                    },
                })
            })
            .collect()
    }

    /// Number of stored snapshots, for one server or all of them.
    pub async fn snapshot_count(&self, server_name: Option<&str>) -> Result<i64, StorageError> {
        let count: i64 = match server_name {
            Some(name) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM server_metrics WHERE server_name = ?")
                    .bind(name)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM server_metrics")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }

    /// Current top-users set for a server, in insertion order.
    pub async fn top_users(&self, server_name: &str) -> Result<Vec<StoredTopUser>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT captured_at, server_name, user, cpu, mem, disk
            FROM top_users
            WHERE server_name = ?
            ORDER BY id
            "#,
        )
        .bind(server_name)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<StoredTopUser, StorageError> {
                Ok(StoredTopUser {
                    captured_at: timestamp(row.try_get("captured_at")?)?,
                    server_name: row.try_get("server_name")?,
                    entry: TopUserEntry {
                        user: row.try_get("user")?,
                        cpu: row.try_get("cpu")?,
                        mem: row.try_get("mem")?,
                        disk: row.try_get("disk")?,
                    },
                })
            })
            .collect()
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp(secs, 0).ok_or(StorageError::Column {
        column: "captured_at",
        value: secs,
    })
}

fn narrow<T: TryFrom<i64>>(
    row: &sqlx::sqlite::SqliteRow,
    column: &'static str,
) -> Result<T, StorageError> {
    let value: i64 = row.try_get(column)?;
    T::try_from(value).map_err(|_| StorageError::Column { column, value })
}
