use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::actions::ActionRunner;
use crate::config::AgentConfig;
use crate::decider::{decide, Action};
use crate::error::{Result, WardenError};
use crate::etcdctl::EtcdCtl;
use crate::observer::Observer;
use crate::probe::NodeProbe;
use crate::snapstore::SnapshotStore;
use crate::state::StateStore;
use crate::supervisor::Supervisor;

/// The four operations one invocation of the agent can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Save,
    Replace,
    Reconfigure,
    Check,
}

impl FromStr for Verb {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "save" => Ok(Verb::Save),
            "replace" => Ok(Verb::Replace),
            "reconfigure" => Ok(Verb::Reconfigure),
            "check" => Ok(Verb::Check),
            other => Err(WardenError::UnexpectedCommand(other.to_string())),
        }
    }
}

/// One agent instance manages exactly one local etcd member. The process
/// is single-shot: an external timer re-invokes it, and all state that
/// must survive between invocations lives in the state store.
pub struct Agent {
    config: AgentConfig,
    state: StateStore,
    etcd: EtcdCtl,
    store: SnapshotStore,
    supervisor: Supervisor,
    probe: NodeProbe,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        let state = StateStore::new(&config.state_dir, config.member_name());
        let etcd = EtcdCtl::new(&config);
        let store = SnapshotStore::new(&config);
        let supervisor = Supervisor::new(config.service_name.clone());
        let probe = NodeProbe::new(&config);
        Self {
            config,
            state,
            etcd,
            store,
            supervisor,
            probe,
        }
    }

    pub async fn run(&self, verb: Verb) -> Result<()> {
        self.state.ensure_layout()?;
        match verb {
            Verb::Save => self.save().await,
            Verb::Replace => self.replace().await,
            Verb::Reconfigure => self.reconfigure().await,
            Verb::Check => self.check().await,
        }
    }

    /// Run the decision procedure and execute the selected action.
    pub async fn reconfigure(&self) -> Result<()> {
        self.validate_preconditions()?;

        let observer = Observer::new(&self.config, &self.etcd, &self.state, &self.probe);
        let observations = observer.observe().await?;
        let decision = decide(&observations);
        tracing::info!(action = ?decision.action, "Reconfiguration decision");

        if let Some(unit_type) = decision.unit_type {
            self.supervisor.write_unit_type(unit_type)?;
        }

        let runner = ActionRunner::new(
            &self.config,
            &self.state,
            &self.etcd,
            &self.store,
            &self.supervisor,
            &observer,
        );
        runner.run(decision.action).await
    }

    /// Update the failure-beginning timestamps from current health.
    pub async fn check(&self) -> Result<()> {
        let observer = Observer::new(&self.config, &self.etcd, &self.state, &self.probe);
        observer.refresh_failure_timestamps().await
    }

    /// Take and upload a snapshot if leader of a healthy cluster.
    pub async fn save(&self) -> Result<()> {
        self.run_action(Action::SaveSnapshot).await
    }

    /// Force the replace-failed-member procedure.
    pub async fn replace(&self) -> Result<()> {
        self.run_action(Action::ReplaceFailed).await
    }

    async fn run_action(&self, action: Action) -> Result<()> {
        let observer = Observer::new(&self.config, &self.etcd, &self.state, &self.probe);
        let runner = ActionRunner::new(
            &self.config,
            &self.state,
            &self.etcd,
            &self.store,
            &self.supervisor,
            &observer,
        );
        runner.run(action).await
    }

    /// The directories the recovery actions mutate must exist and be
    /// writable before any observation is made; anything else is fatal.
    pub fn validate_preconditions(&self) -> Result<()> {
        for dir in [
            self.state.state_dir().to_path_buf(),
            self.state.snapshots_dir(),
            self.config.data_dir.clone(),
        ] {
            if !dir_writable(&dir) {
                return Err(WardenError::Precondition(dir));
            }
        }
        Ok(())
    }
}

fn dir_writable(dir: &Path) -> bool {
    if !dir.is_dir() {
        return false;
    }
    let probe: PathBuf = dir.join(".warden-write-probe");
    match fs::OpenOptions::new().write(true).create(true).open(&probe) {
        Ok(_) => {
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}
