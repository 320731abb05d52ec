use chrono::Utc;

use crate::config::AgentConfig;
use crate::error::Result;
use crate::etcdctl::EtcdCtl;
use crate::probe::NodeProbe;
use crate::state::{FailureKind, MemberStatus, StateStore};

/// Everything the decider needs to know, gathered once per invocation.
#[derive(Debug, Clone)]
pub struct Observations {
    pub local_healthy: bool,
    pub healthy_count: usize,
    pub cluster_healthy: bool,
    pub running_count: usize,
    pub unstarted: bool,
    pub member_failure_exceeded: bool,
    pub cluster_failure_exceeded: bool,
    pub status: Option<MemberStatus>,
    pub member_count: usize,
    pub quorum: usize,
}

/// Computes member and cluster health, the running-node count, and the
/// unstarted flag, and keeps the failure-beginning timestamps current.
pub struct Observer<'a> {
    config: &'a AgentConfig,
    etcd: &'a EtcdCtl,
    state: &'a StateStore,
    probe: &'a NodeProbe,
}

impl<'a> Observer<'a> {
    pub fn new(
        config: &'a AgentConfig,
        etcd: &'a EtcdCtl,
        state: &'a StateStore,
        probe: &'a NodeProbe,
    ) -> Self {
        Self {
            config,
            etcd,
            state,
            probe,
        }
    }

    /// Health of the local member's client endpoint.
    pub async fn local_healthy(&self) -> Result<bool> {
        self.etcd
            .endpoint_health(self.config.client_url(self.config.member_index))
            .await
    }

    /// Number of members, including self, whose endpoint reports healthy.
    pub async fn healthy_count(&self) -> Result<usize> {
        let mut count = 0;
        for i in 0..self.config.member_count {
            if self.etcd.endpoint_health(self.config.client_url(i)).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    pub async fn cluster_is_healthy(&self) -> Result<bool> {
        Ok(self.healthy_count().await? >= self.config.quorum())
    }

    /// Whether the next peer's member list carries an unstarted entry for
    /// our peer URL. The next peer is asked because our own endpoint is not
    /// serving while we are the unstarted entry.
    pub async fn member_is_unstarted(&self) -> Result<bool> {
        let members = self
            .etcd
            .member_list(self.config.client_url(self.config.next_index()))
            .await?;
        let own_peer_url = self.config.peer_url(self.config.member_index);
        Ok(members
            .iter()
            .any(|m| m.is_unstarted() && m.advertises(own_peer_url)))
    }

    /// Gather the full observation set for one reconfigure invocation.
    ///
    /// The unstarted flag is only consulted when the cluster is healthy, so
    /// the next-peer member list is only queried on that branch.
    pub async fn observe(&self) -> Result<Observations> {
        let local_healthy = self.local_healthy().await?;
        let healthy_count = self.healthy_count().await?;
        let quorum = self.config.quorum();
        let cluster_healthy = healthy_count >= quorum;
        let running_count = self.probe.running_nodes().await?;
        let unstarted = if cluster_healthy {
            self.member_is_unstarted().await?
        } else {
            false
        };

        let now = Utc::now().timestamp();
        let observations = Observations {
            local_healthy,
            healthy_count,
            cluster_healthy,
            running_count,
            unstarted,
            member_failure_exceeded: self.state.failure_exceeded(
                FailureKind::Member,
                self.config.member_failure_limit,
                now,
            ),
            cluster_failure_exceeded: self.state.failure_exceeded(
                FailureKind::Cluster,
                self.config.cluster_failure_limit,
                now,
            ),
            status: self.state.status(),
            member_count: self.config.member_count,
            quorum,
        };

        tracing::info!(
            local_healthy = observations.local_healthy,
            healthy_count = observations.healthy_count,
            running_count = observations.running_count,
            unstarted = observations.unstarted,
            status = ?observations.status,
            "Observed cluster state"
        );
        Ok(observations)
    }

    /// The `check` verb: set each failure-beginning timestamp on the first
    /// unhealthy observation, clear it on the first healthy one. A healthy
    /// local member is also the point where `status` becomes `started`.
    pub async fn refresh_failure_timestamps(&self) -> Result<()> {
        let now = Utc::now().timestamp();

        if self.local_healthy().await? {
            self.state.clear_failure(FailureKind::Member)?;
            if self.state.status() != Some(MemberStatus::Started) {
                self.state.set_status(MemberStatus::Started)?;
            }
        } else {
            tracing::warn!("Local member unhealthy");
            self.state.record_failure(FailureKind::Member, now)?;
        }

        if self.cluster_is_healthy().await? {
            self.state.clear_failure(FailureKind::Cluster)?;
        } else {
            tracing::warn!("Cluster below quorum");
            self.state.record_failure(FailureKind::Cluster, now)?;
        }

        Ok(())
    }
}
