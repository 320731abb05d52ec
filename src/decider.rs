use crate::observer::Observations;
use crate::state::MemberStatus;
use crate::supervisor::UnitType;

/// Recovery action selected for one invocation. The decider returns a
/// subset of these; `SaveSnapshot` is forced by the `save` verb and
/// `RestoreLocal` runs inside `Bootstrap` when a staged snapshot exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Bootstrap,
    RestoreLocal,
    ReplaceFailed,
    SaveSnapshot,
    ReloadOnly,
    NoOp(NoOpReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoOpReason {
    /// Replacement just finished; peers list us unstarted until the
    /// supervisor brings the member up.
    AwaitingReplacedStart,
    /// Cluster is fine and the local failure has not outlived its limit.
    RecentRestart,
    /// `save` invoked on a member that is not the current leader.
    NotLeader,
    /// `save` invoked while the cluster is below quorum.
    ClusterUnhealthy,
}

impl NoOpReason {
    pub fn describe(self) -> &'static str {
        match self {
            NoOpReason::AwaitingReplacedStart => "replacement finished, waiting for restart",
            NoOpReason::RecentRestart => "recent restart, failure period not exceeded",
            NoOpReason::NotLeader => "not leader",
            NoOpReason::ClusterUnhealthy => "cluster unhealthy",
        }
    }
}

/// Output of the decision procedure. `unit_type` is set only on the
/// unhealthy-cluster branch, where the drop-in must be applied before the
/// reload the action triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    pub unit_type: Option<UnitType>,
}

/// Map one observation set to a recovery action.
///
/// With a healthy cluster the fault, if any, is local: an unstarted entry
/// for us means either a just-finished replacement (wait) or a cluster
/// restored from a snapshot that lists us (bootstrap from that snapshot);
/// a local failure past its limit means our data is suspect (replace);
/// anything else is a transient restart. Without quorum we are either
/// still bootstrapping (nodes missing), in disaster recovery (all nodes up,
/// down past the limit), or mid-bringup (reload and let the next tick
/// re-evaluate).
pub fn decide(obs: &Observations) -> Decision {
    if obs.cluster_healthy {
        let action = if obs.unstarted {
            if obs.status == Some(MemberStatus::Replaced) {
                Action::NoOp(NoOpReason::AwaitingReplacedStart)
            } else {
                Action::Bootstrap
            }
        } else if obs.member_failure_exceeded {
            Action::ReplaceFailed
        } else {
            Action::NoOp(NoOpReason::RecentRestart)
        };
        return Decision {
            action,
            unit_type: None,
        };
    }

    let remaining = obs.quorum.saturating_sub(obs.running_count) + 1;
    let unit_type = if remaining >= 2 {
        UnitType::Simple
    } else {
        UnitType::Notify
    };

    let action = if obs.running_count < obs.member_count {
        Action::Bootstrap
    } else if obs.cluster_failure_exceeded {
        Action::Bootstrap
    } else {
        Action::ReloadOnly
    };

    Decision {
        action,
        unit_type: Some(unit_type),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Baseline: healthy three-member cluster, everything running.
    fn healthy_obs() -> Observations {
        Observations {
            local_healthy: true,
            healthy_count: 3,
            cluster_healthy: true,
            running_count: 3,
            unstarted: false,
            member_failure_exceeded: false,
            cluster_failure_exceeded: false,
            status: Some(MemberStatus::Started),
            member_count: 3,
            quorum: 2,
        }
    }

    #[test]
    fn test_healthy_cluster_healthy_member_is_noop() {
        let decision = decide(&healthy_obs());
        assert_eq!(decision.action, Action::NoOp(NoOpReason::RecentRestart));
        assert_eq!(decision.unit_type, None);
    }

    #[test]
    fn test_unstarted_after_replacement_waits() {
        let obs = Observations {
            unstarted: true,
            status: Some(MemberStatus::Replaced),
            local_healthy: false,
            healthy_count: 2,
            ..healthy_obs()
        };
        assert_eq!(
            decide(&obs).action,
            Action::NoOp(NoOpReason::AwaitingReplacedStart)
        );
    }

    #[test]
    fn test_unstarted_without_replacement_bootstraps() {
        // The disaster-recovery tail: the cluster came back from a snapshot
        // whose membership includes us, and we never went through replace.
        for status in [None, Some(MemberStatus::Started)] {
            let obs = Observations {
                unstarted: true,
                status,
                local_healthy: false,
                healthy_count: 2,
                ..healthy_obs()
            };
            let decision = decide(&obs);
            assert_eq!(decision.action, Action::Bootstrap);
            assert_eq!(decision.unit_type, None);
        }
    }

    #[test]
    fn test_member_failure_past_limit_replaces() {
        let obs = Observations {
            local_healthy: false,
            healthy_count: 2,
            member_failure_exceeded: true,
            ..healthy_obs()
        };
        let decision = decide(&obs);
        assert_eq!(decision.action, Action::ReplaceFailed);
        assert_eq!(decision.unit_type, None);
    }

    #[test]
    fn test_member_failure_within_limit_is_noop() {
        let obs = Observations {
            local_healthy: false,
            healthy_count: 2,
            member_failure_exceeded: false,
            ..healthy_obs()
        };
        assert_eq!(decide(&obs).action, Action::NoOp(NoOpReason::RecentRestart));
    }

    #[test]
    fn test_unstarted_wins_over_member_failure() {
        // Peers listing us unstarted means our member entry is fresh; the
        // replace procedure would remove an entry that is already new.
        let obs = Observations {
            unstarted: true,
            status: None,
            local_healthy: false,
            healthy_count: 2,
            member_failure_exceeded: true,
            ..healthy_obs()
        };
        assert_eq!(decide(&obs).action, Action::Bootstrap);
    }

    #[test]
    fn test_unhealthy_cluster_missing_nodes_bootstraps() {
        let obs = Observations {
            local_healthy: false,
            healthy_count: 0,
            cluster_healthy: false,
            running_count: 1,
            status: None,
            ..healthy_obs()
        };
        let decision = decide(&obs);
        assert_eq!(decision.action, Action::Bootstrap);
        assert_eq!(decision.unit_type, Some(UnitType::Simple));
    }

    #[test]
    fn test_unhealthy_cluster_all_nodes_past_limit_is_disaster_recovery() {
        let obs = Observations {
            local_healthy: false,
            healthy_count: 0,
            cluster_healthy: false,
            running_count: 3,
            cluster_failure_exceeded: true,
            ..healthy_obs()
        };
        let decision = decide(&obs);
        assert_eq!(decision.action, Action::Bootstrap);
        assert_eq!(decision.unit_type, Some(UnitType::Notify));
    }

    #[test]
    fn test_unhealthy_cluster_all_nodes_within_limit_reloads() {
        let obs = Observations {
            local_healthy: false,
            healthy_count: 1,
            cluster_healthy: false,
            running_count: 3,
            cluster_failure_exceeded: false,
            ..healthy_obs()
        };
        let decision = decide(&obs);
        assert_eq!(decision.action, Action::ReloadOnly);
        assert_eq!(decision.unit_type, Some(UnitType::Notify));
    }

    #[test]
    fn test_unit_type_threshold() {
        // quorum 2: 0 running -> 3 remaining (simple), 1 running -> 2
        // remaining (simple), 2 running -> 1 remaining (notify).
        let cases = [
            (0, UnitType::Simple),
            (1, UnitType::Simple),
            (2, UnitType::Notify),
            (3, UnitType::Notify),
        ];
        for (running_count, expected) in cases {
            let obs = Observations {
                cluster_healthy: false,
                healthy_count: 0,
                running_count,
                ..healthy_obs()
            };
            assert_eq!(
                decide(&obs).unit_type,
                Some(expected),
                "unit type with {} running nodes",
                running_count
            );
        }
    }

    #[test]
    fn test_five_member_unit_type_threshold() {
        // quorum 3: the simple/notify cutover sits at 2 running nodes.
        for (running_count, expected) in [
            (0, UnitType::Simple),
            (1, UnitType::Simple),
            (2, UnitType::Simple),
            (3, UnitType::Notify),
        ] {
            let obs = Observations {
                cluster_healthy: false,
                healthy_count: 0,
                running_count,
                member_count: 5,
                quorum: 3,
                ..healthy_obs()
            };
            assert_eq!(decide(&obs).unit_type, Some(expected));
        }
    }

    #[test]
    fn test_healthy_branch_never_sets_unit_type() {
        for obs in [
            healthy_obs(),
            Observations {
                unstarted: true,
                status: None,
                ..healthy_obs()
            },
            Observations {
                member_failure_exceeded: true,
                ..healthy_obs()
            },
        ] {
            assert_eq!(decide(&obs).unit_type, None);
        }
    }
}
