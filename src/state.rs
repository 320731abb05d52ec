use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

const MEMBER_FAILURE_FILE: &str = "member-failure-beginning-time";
const CLUSTER_FAILURE_FILE: &str = "cluster-failure-beginning-time";
const STATUS_FILE: &str = "status";
const SNAPSHOTS_DIR: &str = "snapshots";

/// Which failure timestamp a state operation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Member,
    Cluster,
}

impl FailureKind {
    fn file_name(self) -> &'static str {
        match self {
            FailureKind::Member => MEMBER_FAILURE_FILE,
            FailureKind::Cluster => CLUSTER_FAILURE_FILE,
        }
    }
}

/// Lifecycle status of the local member, persisted as a single word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    /// The member entry was removed-and-re-added in the cluster and the
    /// local data directory emptied; the supervisor has not reported the
    /// member live yet.
    Replaced,
    /// The member has successfully started at least once.
    Started,
}

impl MemberStatus {
    fn as_word(self) -> &'static str {
        match self {
            MemberStatus::Replaced => "replaced",
            MemberStatus::Started => "started",
        }
    }

    fn from_word(word: &str) -> Option<Self> {
        match word {
            "replaced" => Some(MemberStatus::Replaced),
            "started" => Some(MemberStatus::Started),
            _ => None,
        }
    }
}

/// Value written to the member env file, consumed by the supervisor when
/// it (re)starts etcd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    New,
    Existing,
}

impl ClusterState {
    fn as_str(self) -> &'static str {
        match self {
            ClusterState::New => "new",
            ClusterState::Existing => "existing",
        }
    }
}

/// Per-member persistent scratch under the agent-owned state directory.
///
/// Everything that must survive between invocations lives here: failure
/// beginning timestamps, the one-word member status, the env file the
/// supervisor reads, and the staged snapshot.
#[derive(Debug, Clone)]
pub struct StateStore {
    state_dir: PathBuf,
    member_name: String,
}

impl StateStore {
    pub fn new(state_dir: impl Into<PathBuf>, member_name: impl Into<String>) -> Self {
        Self {
            state_dir: state_dir.into(),
            member_name: member_name.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.state_dir.join(SNAPSHOTS_DIR)
    }

    /// Local staging path for the member's snapshot payload.
    pub fn snapshot_path(&self) -> PathBuf {
        self.snapshots_dir().join(format!("{}.db", self.member_name))
    }

    pub fn env_file_path(&self) -> PathBuf {
        self.state_dir.join(format!("{}.env", self.member_name))
    }

    /// Create the state directory and the snapshot staging directory.
    pub fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(self.snapshots_dir())?;
        Ok(())
    }

    /// Record the beginning of a failure, only if one is not already
    /// recorded. An existing timestamp keeps its original value so the
    /// failure period measures from the first unhealthy observation.
    pub fn record_failure(&self, kind: FailureKind, now: i64) -> Result<()> {
        let path = self.state_dir.join(kind.file_name());
        if !path.exists() {
            fs::write(&path, format!("{}\n", now))?;
        }
        Ok(())
    }

    /// Clear a failure timestamp. Missing file is a no-op.
    pub fn clear_failure(&self, kind: FailureKind) -> Result<()> {
        let path = self.state_dir.join(kind.file_name());
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// UNIX seconds when the failure began, if one is recorded.
    pub fn failure_began(&self, kind: FailureKind) -> Option<i64> {
        let path = self.state_dir.join(kind.file_name());
        let contents = fs::read_to_string(path).ok()?;
        contents.trim().parse().ok()
    }

    /// Whether a recorded failure is older than the configured limit.
    pub fn failure_exceeded(&self, kind: FailureKind, limit: Duration, now: i64) -> bool {
        match self.failure_began(kind) {
            Some(began) => now - began > limit.as_secs() as i64,
            None => false,
        }
    }

    pub fn status(&self) -> Option<MemberStatus> {
        let contents = fs::read_to_string(self.state_dir.join(STATUS_FILE)).ok()?;
        MemberStatus::from_word(contents.trim())
    }

    pub fn set_status(&self, status: MemberStatus) -> Result<()> {
        fs::write(
            self.state_dir.join(STATUS_FILE),
            format!("{}\n", status.as_word()),
        )?;
        Ok(())
    }

    /// Rewrite the member env file with the given initial-cluster-state.
    /// The supervisor passes this file to etcd on the next restart.
    pub fn write_cluster_state(&self, state: ClusterState) -> Result<()> {
        fs::write(
            self.env_file_path(),
            format!("ETCD_INITIAL_CLUSTER_STATE={}\n", state.as_str()),
        )?;
        Ok(())
    }
}
