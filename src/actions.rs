use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::config::AgentConfig;
use crate::decider::{Action, NoOpReason};
use crate::error::{Result, WardenError};
use crate::etcdctl::EtcdCtl;
use crate::observer::Observer;
use crate::snapstore::SnapshotStore;
use crate::state::{ClusterState, MemberStatus, StateStore};
use crate::supervisor::Supervisor;

/// Principal that owns the data directory once etcd runs.
const ETCD_USER: &str = "etcd";

/// Window for the cluster to elect a new leader between removing and
/// re-adding a member, in case the removed member was leading.
const REPLACE_GRACE: Duration = Duration::from_secs(1);

/// Executes the recovery action selected by the decider (or forced by the
/// `save`/`replace` verbs). One invocation runs one action to completion;
/// any sub-operation failure aborts the invocation and the next tick
/// re-evaluates from scratch.
pub struct ActionRunner<'a> {
    config: &'a AgentConfig,
    state: &'a StateStore,
    etcd: &'a EtcdCtl,
    store: &'a SnapshotStore,
    supervisor: &'a Supervisor,
    observer: &'a Observer<'a>,
}

impl<'a> ActionRunner<'a> {
    pub fn new(
        config: &'a AgentConfig,
        state: &'a StateStore,
        etcd: &'a EtcdCtl,
        store: &'a SnapshotStore,
        supervisor: &'a Supervisor,
        observer: &'a Observer<'a>,
    ) -> Self {
        Self {
            config,
            state,
            etcd,
            store,
            supervisor,
            observer,
        }
    }

    pub async fn run(&self, action: Action) -> Result<()> {
        match action {
            Action::Bootstrap => self.bootstrap().await,
            Action::RestoreLocal => self.restore_from_local_snapshot().await,
            Action::ReplaceFailed => self.replace_failed().await,
            Action::SaveSnapshot => self.save_snapshot().await,
            Action::ReloadOnly => self.supervisor.daemon_reload().await,
            Action::NoOp(reason) => {
                tracing::info!(reason = reason.describe(), "No action required");
                Ok(())
            }
        }
    }

    /// Start the member fresh, preferring the cluster snapshot when one is
    /// available. Without any snapshot the member starts empty, which is
    /// the valid first-ever bootstrap.
    pub async fn bootstrap(&self) -> Result<()> {
        let snapshot_path = self.state.snapshot_path();

        if self.store.exists().await? {
            self.store.download(&snapshot_path).await?;
            protect_snapshot(&snapshot_path)?;
        }
        if snapshot_path.exists() {
            self.restore_from_local_snapshot().await?;
        } else {
            tracing::info!("No snapshot available, bootstrapping empty");
        }

        self.state.write_cluster_state(ClusterState::New)?;
        self.supervisor.daemon_reload().await
    }

    /// Install the staged snapshot into the data directory.
    ///
    /// The restore runs against a temporary sibling directory so a failure
    /// partway never leaves a half-written data directory; the entries move
    /// in by rename only after the restore succeeded.
    pub async fn restore_from_local_snapshot(&self) -> Result<()> {
        let snapshot_path = self.state.snapshot_path();
        let data_dir = &self.config.data_dir;
        let restored = self.config.restored_data_dir();

        clean_dir(data_dir)?;
        if restored.exists() {
            // Leftover from a prior failed attempt
            fs::remove_dir_all(&restored)?;
        }

        self.etcd
            .snapshot_restore(
                &snapshot_path,
                &restored,
                self.config.member_name(),
                self.config.peer_url(self.config.member_index),
                self.config.initial_cluster_spec(),
            )
            .await?;

        fs::create_dir_all(data_dir)?;
        for entry in fs::read_dir(&restored)? {
            let entry = entry?;
            fs::rename(entry.path(), data_dir.join(entry.file_name()))?;
        }
        fs::remove_dir_all(&restored)?;

        chown_recursive(data_dir, ETCD_USER).await?;
        fs::remove_file(&snapshot_path)?;

        tracing::info!(data_dir = %data_dir.display(), "Snapshot restored into data directory");
        Ok(())
    }

    /// Replace this member's cluster entry: remove the old member ID, wait
    /// for the cluster to settle, add the entry back, and restart as an
    /// existing member with an empty data directory.
    pub async fn replace_failed(&self) -> Result<()> {
        clean_dir(&self.config.data_dir)?;

        let next_endpoint = self.config.client_url(self.config.next_index());
        let own_peer_url = self.config.peer_url(self.config.member_index);
        let members = self.etcd.member_list(next_endpoint).await?;
        let member = members
            .iter()
            .find(|m| m.advertises(own_peer_url))
            .ok_or_else(|| WardenError::MemberNotFound(self.config.member_name().to_string()))?;

        tracing::info!(member_id = member.id, "Removing failed member");
        self.etcd.member_remove(next_endpoint, member.id).await?;
        tokio::time::sleep(REPLACE_GRACE).await;
        self.etcd
            .member_add(next_endpoint, self.config.member_name(), own_peer_url)
            .await?;

        self.state.write_cluster_state(ClusterState::Existing)?;
        self.state.set_status(MemberStatus::Replaced)?;
        self.supervisor.daemon_reload().await
    }

    /// Take and upload a cluster snapshot. Only the leader of a healthy
    /// cluster does this; a snapshot of an unhealthy cluster could persist
    /// corrupt state.
    pub async fn save_snapshot(&self) -> Result<()> {
        let endpoint = self.config.client_url(self.config.member_index);

        let status = self.etcd.endpoint_status(endpoint).await?;
        if !status.is_leader() {
            tracing::info!(reason = NoOpReason::NotLeader.describe(), "Skipping snapshot");
            return Ok(());
        }
        if !self.observer.cluster_is_healthy().await? {
            tracing::info!(
                reason = NoOpReason::ClusterUnhealthy.describe(),
                "Skipping snapshot"
            );
            return Ok(());
        }

        let path = self.state.snapshot_path();
        self.etcd.snapshot_save(endpoint, &path).await?;
        protect_snapshot(&path)?;
        self.etcd.snapshot_status(&path).await?;
        self.store.upload(&path).await?;
        fs::remove_file(&path)?;

        tracing::info!("Snapshot saved and uploaded");
        Ok(())
    }
}

/// Drop write permission on a staged snapshot. The file stays read-only
/// until the privileged restore or upload path consumes and removes it.
fn protect_snapshot(path: &Path) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(0o400))?;
    Ok(())
}

/// Delete the contents of a directory, leaving it empty. A missing
/// directory is a no-op.
pub fn clean_dir(dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

async fn chown_recursive(dir: &Path, user: &str) -> Result<()> {
    let mut cmd = Command::new("chown");
    cmd.arg("-R")
        .arg(format!("{0}:{0}", user))
        .arg(dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let output = cmd.output().await?;
    if !output.status.success() {
        return Err(WardenError::Io(std::io::Error::other(format!(
            "chown {} failed: {}",
            dir.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        ))));
    }
    Ok(())
}
