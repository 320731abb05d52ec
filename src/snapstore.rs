use std::fs;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::config::AgentConfig;
use crate::error::{Result, WardenError};

/// Name of the single blob the cluster keeps in the object store.
/// Uploads overwrite it; there is never more than one snapshot per cluster.
pub const BLOB_NAME: &str = "snapshot.db";

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Upload/download/exists for the cluster snapshot blob, backed by the
/// `aws s3` CLI against the configured bucket URI.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    uri: String,
    transfer_timeout: Duration,
}

impl SnapshotStore {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            uri: config.snapshots_uri.clone(),
            transfer_timeout: config.snapshot_timeout,
        }
    }

    pub fn blob_uri(&self) -> String {
        format!("{}/{}", self.uri.trim_end_matches('/'), BLOB_NAME)
    }

    /// Whether the remote blob exists.
    ///
    /// `aws s3 ls` exits non-zero with empty output for a missing key, and
    /// with diagnostics on stderr for a real failure; only the latter is an
    /// error here.
    pub async fn exists(&self) -> Result<bool> {
        let output = self
            .run("exists", &["s3", "ls", &self.blob_uri()], METADATA_TIMEOUT)
            .await?;
        if output.status.success() {
            return Ok(listing_contains_blob(&String::from_utf8_lossy(&output.stdout)));
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.is_empty() {
            Ok(false)
        } else {
            Err(WardenError::SnapshotStore {
                op: "exists",
                detail: stderr,
            })
        }
    }

    /// Upload a local snapshot, overwriting the remote blob. The upload is
    /// confirmed by re-listing before this returns.
    pub async fn upload(&self, local: &Path) -> Result<()> {
        let local_str = local.display().to_string();
        let blob = self.blob_uri();
        let output = self
            .run("upload", &["s3", "cp", &local_str, &blob], self.transfer_timeout)
            .await?;
        self.check("upload", &output)?;

        if !self.exists().await? {
            return Err(WardenError::SnapshotStore {
                op: "upload",
                detail: format!("{} not listed after upload", blob),
            });
        }
        tracing::info!(blob = %blob, "Snapshot uploaded");
        Ok(())
    }

    /// Download the remote blob to `local`, creating parent directories as
    /// needed. The local file exists when this returns Ok.
    pub async fn download(&self, local: &Path) -> Result<()> {
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)?;
        }
        let local_str = local.display().to_string();
        let blob = self.blob_uri();
        let output = self
            .run("download", &["s3", "cp", &blob, &local_str], self.transfer_timeout)
            .await?;
        self.check("download", &output)?;

        if !local.exists() {
            return Err(WardenError::SnapshotStore {
                op: "download",
                detail: format!("{} missing after download", local.display()),
            });
        }
        tracing::info!(blob = %blob, local = %local.display(), "Snapshot downloaded");
        Ok(())
    }

    async fn run(
        &self,
        op: &'static str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<std::process::Output> {
        let mut cmd = Command::new("aws");
        cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| WardenError::Timeout {
                op,
                seconds: timeout.as_secs(),
            })??;
        Ok(output)
    }

    fn check(&self, op: &'static str, output: &std::process::Output) -> Result<()> {
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let detail = if stderr.is_empty() {
            format!("exit code {:?}", output.status.code())
        } else {
            stderr
        };
        Err(WardenError::SnapshotStore { op, detail })
    }
}

fn listing_contains_blob(listing: &str) -> bool {
    listing
        .lines()
        .any(|line| line.split_whitespace().last() == Some(BLOB_NAME))
}
