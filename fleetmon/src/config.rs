//! Runtime configuration: process environment layered over an optional dotenv file.
//!
//! Targets are enumerated as `SERVER1_*`, `SERVER2_*`, ... until the first
//! missing `SERVER{i}_NAME`. The target list is re-read every cycle through
//! [`TargetSource`], so hosts can be added or removed without a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::types::ServerTarget;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://server_monitoring.db";
pub const DEFAULT_AGENT_PATH: &str = "./BashGetInfo.sh";
pub const DEFAULT_METRICS_SCRIPT: &str = "mini_monitering.sh";
pub const DEFAULT_TOP_USERS_SCRIPT: &str = "TopUsers.sh";
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(900);
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(2 * 24 * 3600);

/// How the remote agent and liveness probe are invoked.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub agent_path: PathBuf,
    pub metrics_script: String,
    pub top_users_script: String,
    pub ping_path: PathBuf,
    pub ping_timeout: Duration,
    pub agent_timeout: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            agent_path: PathBuf::from(DEFAULT_AGENT_PATH),
            metrics_script: DEFAULT_METRICS_SCRIPT.into(),
            top_users_script: DEFAULT_TOP_USERS_SCRIPT.into(),
            ping_path: PathBuf::from("ping"),
            ping_timeout: Duration::from_secs(5),
            agent_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub agent: AgentSettings,
    pub interval: Duration,
    /// Targets processed at once; 1 keeps the cycle strictly sequential.
    pub concurrency: usize,
    pub retention: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.into(),
            agent: AgentSettings::default(),
            interval: DEFAULT_INTERVAL,
            concurrency: 1,
            retention: DEFAULT_RETENTION,
        }
    }
}

impl Config {
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut cfg = Config::default();
        if let Some(url) = non_empty(vars, "DATABASE_URL") {
            cfg.database_url = url.to_string();
        }
        if let Some(p) = non_empty(vars, "FLEETMON_AGENT_PATH") {
            cfg.agent.agent_path = PathBuf::from(p);
        }
        if let Some(s) = non_empty(vars, "FLEETMON_METRICS_SCRIPT") {
            cfg.agent.metrics_script = s.to_string();
        }
        if let Some(s) = non_empty(vars, "FLEETMON_TOP_USERS_SCRIPT") {
            cfg.agent.top_users_script = s.to_string();
        }
        if let Some(p) = non_empty(vars, "FLEETMON_PING_PATH") {
            cfg.agent.ping_path = PathBuf::from(p);
        }
        if let Some(secs) = positive(vars, "FLEETMON_PING_TIMEOUT_SECS")? {
            cfg.agent.ping_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = positive(vars, "FLEETMON_AGENT_TIMEOUT_SECS")? {
            cfg.agent.agent_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = positive(vars, "FLEETMON_INTERVAL_SECS")? {
            cfg.interval = Duration::from_secs(secs);
        }
        if let Some(n) = positive(vars, "FLEETMON_CONCURRENCY")? {
            cfg.concurrency = n as usize;
        }
        if let Some(secs) = positive(vars, "FLEETMON_RETENTION_SECS")? {
            cfg.retention = Duration::from_secs(secs);
        }
        Ok(cfg)
    }
}

/// Enumerate `SERVER{i}_*` entries until the first gap in `NAME`.
pub fn read_targets(vars: &HashMap<String, String>) -> Result<Vec<ServerTarget>, ConfigError> {
    let mut targets: Vec<ServerTarget> = Vec::new();
    for i in 1.. {
        let name_key = format!("SERVER{i}_NAME");
        let Some(name) = non_empty(vars, &name_key) else {
            break;
        };
        let required = |field: &str| {
            let key = format!("SERVER{i}_{field}");
            non_empty(vars, &key)
                .map(str::to_string)
                .ok_or(ConfigError::IncompleteTarget {
                    key: name_key.clone(),
                    missing: key,
                })
        };
        let target = ServerTarget {
            name: name.to_string(),
            host: required("HOST")?,
            username: required("USERNAME")?,
            password: vars
                .get(&format!("SERVER{i}_PASSWORD"))
                .cloned()
                .unwrap_or_default(),
        };
        if let Some(pos) = targets.iter().position(|t| t.name == target.name) {
            return Err(ConfigError::DuplicateTarget {
                name: target.name,
                first: format!("SERVER{}_NAME", pos + 1),
                second: name_key,
            });
        }
        targets.push(target);
    }
    Ok(targets)
}

/// Supplies the fleet at the start of each cycle.
pub trait TargetSource: Send + Sync {
    fn targets(&self) -> Result<Vec<ServerTarget>, ConfigError>;
}

impl TargetSource for Vec<ServerTarget> {
    fn targets(&self) -> Result<Vec<ServerTarget>, ConfigError> {
        Ok(self.clone())
    }
}

/// Process environment over an optional dotenv file. The file is re-read on
/// every call; process variables win over file values.
#[derive(Debug, Clone, Default)]
pub struct EnvSource {
    env_file: Option<PathBuf>,
}

impl EnvSource {
    pub fn new(env_file: Option<PathBuf>) -> Self {
        Self { env_file }
    }

    pub fn vars(&self) -> Result<HashMap<String, String>, ConfigError> {
        let mut vars = match self.env_file.as_deref() {
            Some(path) if path.exists() => read_env_file(path)?,
            _ => HashMap::new(),
        };
        vars.extend(
            std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?))),
        );
        Ok(vars)
    }

    pub fn config(&self) -> Result<Config, ConfigError> {
        Config::from_vars(&self.vars()?)
    }
}

impl TargetSource for EnvSource {
    fn targets(&self) -> Result<Vec<ServerTarget>, ConfigError> {
        read_targets(&self.vars()?)
    }
}

fn read_env_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let to_err = |source| ConfigError::EnvFile {
        path: path.display().to_string(),
        source,
    };
    dotenv::from_path_iter(path)
        .map_err(to_err)?
        .collect::<Result<HashMap<_, _>, _>>()
        .map_err(to_err)
}

fn non_empty<'a>(vars: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn positive(vars: &HashMap<String, String>, key: &str) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = non_empty(vars, key) else {
        return Ok(None);
    };
    match raw.parse::<u64>() {
        Ok(v) if v > 0 => Ok(Some(v)),
        _ => Err(ConfigError::InvalidNumber {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}
