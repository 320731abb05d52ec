use std::fs;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::{Result, WardenError};

const DEFAULT_UNIT_DIR: &str = "/etc/systemd/system";
const DROP_IN_NAME: &str = "etcd-warden.conf";
const RELOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Service type written into the member unit's drop-in.
///
/// While more than one additional node is still needed to reach quorum the
/// unit runs as `simple`, so the supervisor treats etcd as started the
/// moment it execs and the remaining nodes can join without a readiness
/// deadlock. Once one more node suffices, `notify` makes the supervisor
/// wait for the member to self-report readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitType {
    Simple,
    Notify,
}

impl std::fmt::Display for UnitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitType::Simple => write!(f, "simple"),
            UnitType::Notify => write!(f, "notify"),
        }
    }
}

/// Writes the member unit drop-in and triggers supervisor reloads. The
/// supervisor itself is external; its contract is that it respects the
/// drop-in and the member env file, and restarts etcd after a reload.
#[derive(Debug, Clone)]
pub struct Supervisor {
    service_name: String,
    unit_dir: PathBuf,
}

impl Supervisor {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            unit_dir: PathBuf::from(DEFAULT_UNIT_DIR),
        }
    }

    /// Override the unit directory. Tests point this at a scratch dir.
    pub fn with_unit_dir(mut self, unit_dir: impl Into<PathBuf>) -> Self {
        self.unit_dir = unit_dir.into();
        self
    }

    pub fn drop_in_path(&self) -> PathBuf {
        self.unit_dir
            .join(format!("{}.service.d", self.service_name))
            .join(DROP_IN_NAME)
    }

    /// Write the `[Service] Type=` drop-in. The daemon reload is left to
    /// the action path that follows.
    pub fn write_unit_type(&self, unit_type: UnitType) -> Result<()> {
        let path = self.drop_in_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, format!("[Service]\nType={}\n", unit_type))?;
        tracing::info!(unit_type = %unit_type, path = %path.display(), "Unit drop-in written");
        Ok(())
    }

    pub async fn daemon_reload(&self) -> Result<()> {
        let mut cmd = Command::new("systemctl");
        cmd.arg("daemon-reload")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(RELOAD_TIMEOUT, cmd.output())
            .await
            .map_err(|_| WardenError::Timeout {
                op: "daemon-reload",
                seconds: RELOAD_TIMEOUT.as_secs(),
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(WardenError::Supervisor(if stderr.is_empty() {
                format!("daemon-reload exit code {:?}", output.status.code())
            } else {
                stderr
            }));
        }
        tracing::info!(service = %self.service_name, "Supervisor daemon reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_drop_in_rendering() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new("etcd-member-0").with_unit_dir(dir.path());

        supervisor.write_unit_type(UnitType::Simple).unwrap();
        let path = dir
            .path()
            .join("etcd-member-0.service.d")
            .join("etcd-warden.conf");
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "[Service]\nType=simple\n"
        );

        supervisor.write_unit_type(UnitType::Notify).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "[Service]\nType=notify\n"
        );
    }
}
