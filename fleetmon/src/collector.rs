//! Remote collection: a bounded liveness probe plus the two agent invocations.
//!
//! Agent contract: `<agent_path> <host> <username> <password> <script>`, stdout
//! is the only data channel and a non-zero exit is a failure.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::AgentSettings;
use crate::error::CollectionError;
use crate::types::{CollectMode, ServerTarget};

// Grace on top of the probe's own deadline before the child is killed.
const PING_GRACE: Duration = Duration::from_secs(1);

/// The seam between the scheduler and the outside world.
#[async_trait]
pub trait Collector: Send + Sync {
    /// `false` on timeout or unreachability; never an error.
    async fn check_liveness(&self, target: &ServerTarget) -> bool;

    async fn collect_raw(
        &self,
        target: &ServerTarget,
        mode: CollectMode,
    ) -> Result<String, CollectionError>;
}

/// Runs the external agent executable and `ping`.
#[derive(Debug, Clone)]
pub struct AgentCollector {
    settings: AgentSettings,
}

impl AgentCollector {
    pub fn new(settings: AgentSettings) -> Self {
        Self { settings }
    }

    fn script_for(&self, mode: CollectMode) -> &str {
        match mode {
            CollectMode::GeneralMetrics => &self.settings.metrics_script,
            CollectMode::TopUsers => &self.settings.top_users_script,
        }
    }
}

#[async_trait]
impl Collector for AgentCollector {
    async fn check_liveness(&self, target: &ServerTarget) -> bool {
        let wait_secs = self.settings.ping_timeout.as_secs().max(1);
        let mut cmd = Command::new(&self.settings.ping_path);
        cmd.args(["-c", "1", "-w"])
            .arg(wait_secs.to_string())
            .arg(&target.host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match timeout(self.settings.ping_timeout + PING_GRACE, cmd.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                warn!(server = %target.name, "liveness probe could not run: {e}");
                false
            }
            Err(_) => {
                debug!(server = %target.name, "liveness probe timed out");
                false
            }
        }
    }

    async fn collect_raw(
        &self,
        target: &ServerTarget,
        mode: CollectMode,
    ) -> Result<String, CollectionError> {
        let agent = &self.settings.agent_path;
        let program = agent.display().to_string();
        ensure_executable(agent).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                CollectionError::Spawn {
                    program: program.clone(),
                    source,
                }
            } else {
                CollectionError::Permissions {
                    program: program.clone(),
                    source,
                }
            }
        })?;

        let mut cmd = Command::new(agent);
        cmd.arg(&target.host)
            .arg(&target.username)
            .arg(&target.password)
            .arg(self.script_for(mode))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(server = %target.name, %mode, "invoking agent");
        let output = match timeout(self.settings.agent_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(CollectionError::Spawn { program, source }),
            Err(_) => {
                return Err(CollectionError::Timeout {
                    program,
                    timeout: self.settings.agent_timeout,
                })
            }
        };

        if !output.status.success() {
            return Err(CollectionError::NonZeroExit {
                program,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }
}

/// Adds the execute bits if they are missing. Safe to call before every run.
#[cfg(unix)]
pub fn ensure_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = std::fs::metadata(path)?.permissions();
    let mode = perms.mode();
    if mode & 0o111 != 0o111 {
        perms.set_mode(mode | 0o755);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn ensure_executable(path: &Path) -> std::io::Result<()> {
    std::fs::metadata(path).map(|_| ())
}
