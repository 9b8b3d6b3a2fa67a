use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::Api;
use kube::ResourceExt;
use tracing::{info, warn};

use crate::{
    cluster_controller::Ctx,
    conditions::ConditionReason,
    crds::cluster::TypesenseCluster,
    error::ReconcileError,
    nodeslist,
    quorum::{
        classify::classify,
        probe::NodeProbe,
        readiness,
        types::{min_required_nodes, ClusterStatus, NodeEndpoint, NodeState, Quorum},
    },
    statefulset,
};

pub const HEALTHY_WRITE_LAG_DEFAULT: i64 = 500;
pub const HEALTHY_READ_LAG_DEFAULT: i64 = 1000;

const HEALTHY_WRITE_LAG_KEY: &str = "healthy-write-lag";
const HEALTHY_READ_LAG_KEY: &str = "healthy-read-lag";

/// Everything the decision table looks at, gathered in one place so the
/// table itself stays a pure function.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub cluster: ClusterStatus,
    pub current_replicas: i32,
    pub desired_replicas: i32,
    pub incremental: bool,
    pub any_resource_error: bool,
    pub any_queued_writes: bool,
    pub lagging: bool,
    /// Single-node quorum whose node answered with ERROR or still holds
    /// queued writes; waiting will not fix it.
    pub single_node_faulted: bool,
    pub healthy_nodes: usize,
    pub min_required: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Narrow the peer list to ordinal 0, then scale to one replica.
    Downgrade,
    /// Delete every pod so the controller recreates them against the
    /// currently published peer list.
    Purge,
    /// Publish a wider peer list, then scale to match.
    UpgradeTo(i32),
    /// No mutation this tick; the reason says why.
    Hold(ConditionReason),
}

/// The quorum state machine. Split brain outranks everything: with two
/// leaders no other signal can be trusted. Resource faults outrank the
/// deadlock downgrade; restarting a node on a full disk only burns the
/// remaining headroom.
pub fn decide(obs: &Observation) -> Decision {
    if obs.cluster == ClusterStatus::SplitBrain {
        return Decision::Downgrade;
    }
    if obs.any_resource_error {
        return Decision::Hold(ConditionReason::QuorumNeedsAttentionMemoryOrDiskIssue);
    }
    if obs.cluster == ClusterStatus::ElectionDeadlock {
        return Decision::Downgrade;
    }

    if obs.cluster == ClusterStatus::NotReady {
        if obs.current_replicas == 1 {
            if obs.single_node_faulted {
                return Decision::Purge;
            }
            return Decision::Hold(ConditionReason::QuorumNotReadyWaitATerm);
        }
        if obs.healthy_nodes < obs.min_required {
            return Decision::Hold(ConditionReason::QuorumNotReadyWaitATerm);
        }
        return Decision::Hold(ConditionReason::QuorumNotReady);
    }

    // ClusterStatus::Ok from here on.
    if obs.lagging {
        return Decision::Hold(ConditionReason::QuorumNeedsAttentionClusterIsLagging);
    }
    if obs.current_replicas < obs.desired_replicas {
        if obs.any_queued_writes {
            return Decision::Hold(ConditionReason::QuorumQueuedWrites);
        }
        return Decision::UpgradeTo(next_quorum_size(
            obs.current_replicas,
            obs.desired_replicas,
            obs.incremental,
        ));
    }
    Decision::Hold(ConditionReason::QuorumReady)
}

/// Target size for an upgrade. Incremental recovery moves to the next odd
/// count (quorums are odd-or-1), a full recovery jumps to the declared size.
pub fn next_quorum_size(current: i32, desired: i32, incremental: bool) -> i32 {
    if !incremental {
        return desired;
    }
    let stepped = if current < 1 {
        1
    } else if current % 2 == 0 {
        current + 1
    } else {
        current + 2
    };
    stepped.min(desired)
}

/// One full observer/actuator cycle: snapshot the published quorum, probe
/// every peer, flip the readiness gates, classify, act. Engine HTTP failures
/// are absorbed by the prober; only API-server errors propagate.
pub async fn reconcile_quorum(
    ctx: &Ctx,
    ts: &TypesenseCluster,
    secret: &Secret,
    sts: &StatefulSet,
) -> Result<ConditionReason, ReconcileError> {
    let quorum = get_quorum(ctx, ts).await?;
    let probe = NodeProbe::from_secret(ts, secret)?;

    let mut statuses = BTreeMap::new();
    let mut healths = Vec::with_capacity(quorum.nodes.len());
    for node in &quorum.nodes {
        statuses.insert(node.host.clone(), probe.status(node).await);
        healths.push(probe.health(node).await);
    }

    readiness::write_readiness_gates(ctx, ts, &healths).await?;

    let cluster = classify(&statuses);
    info!(status = %cluster, nodes = quorum.available_nodes, "classified quorum");

    let thresholds = lag_thresholds(ctx, ts).await;
    let current_replicas = sts
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(quorum.available_nodes as i32);

    let observation = Observation {
        cluster,
        current_replicas,
        desired_replicas: ts.spec.replicas,
        incremental: ts.spec.incremental_quorum_recovery,
        any_resource_error: healths.iter().any(|h| h.resource_error.is_some()),
        any_queued_writes: statuses.values().any(|s| s.queued_writes > 0),
        lagging: statuses
            .values()
            .any(|s| s.queued_writes > thresholds.write),
        single_node_faulted: quorum.available_nodes == 1
            && statuses
                .values()
                .any(|s| s.state == NodeState::Error || s.queued_writes != 0),
        healthy_nodes: healths.iter().filter(|h| h.ok).count(),
        min_required: quorum.min_required_nodes,
    };

    match decide(&observation) {
        Decision::Downgrade => {
            info!("downgrading quorum to a single node");
            // Narrow the peer list first: the surviving node must not try to
            // contact peers the scale-down is about to delete.
            nodeslist::update_nodes(ctx, ts, &quorum.nodes_list, Some(1)).await?;
            statefulset::scale_statefulset(ctx, ts, 1).await?;
            Ok(ConditionReason::QuorumDowngraded)
        }
        Decision::Purge => {
            info!("purging quorum pods");
            statefulset::purge_pods(ctx, ts).await?;
            Ok(ConditionReason::QuorumNotReady)
        }
        Decision::UpgradeTo(replicas) => {
            info!(replicas, "upgrading quorum");
            nodeslist::update_nodes(ctx, ts, &quorum.nodes_list, Some(replicas)).await?;
            statefulset::scale_statefulset(ctx, ts, replicas).await?;
            Ok(ConditionReason::QuorumUpgraded)
        }
        Decision::Hold(reason) => Ok(reason),
    }
}

/// Snapshot of the published quorum from the `{cluster}-nodeslist` map.
async fn get_quorum(ctx: &Ctx, ts: &TypesenseCluster) -> Result<Quorum, ReconcileError> {
    let ns = ts.namespace().unwrap_or_default();
    let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &ns);
    let nodes_list = config_maps.get(&ts.nodes_list_name()).await?;

    let raw = nodes_list
        .data
        .as_ref()
        .and_then(|d| d.get(nodeslist::NODES_KEY))
        .cloned()
        .unwrap_or_default();

    let mut nodes = Vec::new();
    for entry in raw.split(',').filter(|e| !e.is_empty()) {
        let endpoint = NodeEndpoint::parse(entry)
            .ok_or_else(|| anyhow::anyhow!("malformed peer list entry: {entry}"))?;
        nodes.push(endpoint);
    }

    Ok(Quorum {
        min_required_nodes: min_required_nodes(nodes.len()),
        available_nodes: nodes.len(),
        nodes,
        nodes_list,
    })
}

pub struct LagThresholds {
    pub read: i64,
    pub write: i64,
}

/// Read/write lag tolerances from the referenced server configuration map;
/// defaults apply when the map, the keys, or the numbers are missing.
async fn lag_thresholds(ctx: &Ctx, ts: &TypesenseCluster) -> LagThresholds {
    let mut thresholds = LagThresholds {
        read: HEALTHY_READ_LAG_DEFAULT,
        write: HEALTHY_WRITE_LAG_DEFAULT,
    };

    let Some(config_ref) = &ts.spec.additional_server_configuration else {
        return thresholds;
    };
    let ns = ts.namespace().unwrap_or_default();
    let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &ns);
    let data = match config_maps.get_opt(&config_ref.name).await {
        Ok(Some(cm)) => cm.data.unwrap_or_default(),
        Ok(None) => return thresholds,
        Err(error) => {
            warn!(?error, configmap = %config_ref.name, "fetching server configuration failed");
            return thresholds;
        }
    };

    for (key, target) in [
        (HEALTHY_READ_LAG_KEY, &mut thresholds.read),
        (HEALTHY_WRITE_LAG_KEY, &mut thresholds.write),
    ] {
        if let Some(value) = data.get(key) {
            match value.parse() {
                Ok(parsed) => *target = parsed,
                Err(_) => warn!(key, value, "unparsable lag threshold, keeping default"),
            }
        }
    }
    thresholds
}

#[cfg(test)]
mod tests_actuator {
    use super::*;

    fn observation(cluster: ClusterStatus) -> Observation {
        Observation {
            cluster,
            current_replicas: 3,
            desired_replicas: 3,
            incremental: false,
            any_resource_error: false,
            any_queued_writes: false,
            lagging: false,
            single_node_faulted: false,
            healthy_nodes: 3,
            min_required: 2,
        }
    }

    #[test]
    fn split_brain_downgrades() {
        let obs = observation(ClusterStatus::SplitBrain);
        assert_eq!(decide(&obs), Decision::Downgrade);
    }

    #[test]
    fn split_brain_outranks_resource_error() {
        let obs = Observation {
            any_resource_error: true,
            ..observation(ClusterStatus::SplitBrain)
        };
        assert_eq!(decide(&obs), Decision::Downgrade);
    }

    #[test]
    fn resource_error_surfaces_and_blocks_recovery() {
        let obs = Observation {
            any_resource_error: true,
            ..observation(ClusterStatus::ElectionDeadlock)
        };
        assert_eq!(
            decide(&obs),
            Decision::Hold(ConditionReason::QuorumNeedsAttentionMemoryOrDiskIssue)
        );
    }

    #[test]
    fn election_deadlock_downgrades() {
        let obs = observation(ClusterStatus::ElectionDeadlock);
        assert_eq!(decide(&obs), Decision::Downgrade);
    }

    #[test]
    fn faulted_single_node_is_purged() {
        let obs = Observation {
            current_replicas: 1,
            single_node_faulted: true,
            healthy_nodes: 0,
            min_required: 1,
            ..observation(ClusterStatus::NotReady)
        };
        assert_eq!(decide(&obs), Decision::Purge);
    }

    #[test]
    fn quiet_single_node_waits_a_term() {
        let obs = Observation {
            current_replicas: 1,
            healthy_nodes: 0,
            min_required: 1,
            ..observation(ClusterStatus::NotReady)
        };
        assert_eq!(
            decide(&obs),
            Decision::Hold(ConditionReason::QuorumNotReadyWaitATerm)
        );
    }

    #[test]
    fn below_majority_waits_a_term() {
        let obs = Observation {
            healthy_nodes: 1,
            ..observation(ClusterStatus::NotReady)
        };
        assert_eq!(
            decide(&obs),
            Decision::Hold(ConditionReason::QuorumNotReadyWaitATerm)
        );
    }

    #[test]
    fn queued_writes_defer_the_upgrade() {
        let obs = Observation {
            current_replicas: 1,
            desired_replicas: 5,
            any_queued_writes: true,
            ..observation(ClusterStatus::Ok)
        };
        assert_eq!(
            decide(&obs),
            Decision::Hold(ConditionReason::QuorumQueuedWrites)
        );
    }

    #[test]
    fn ok_below_desired_upgrades() {
        let obs = Observation {
            current_replicas: 1,
            desired_replicas: 5,
            ..observation(ClusterStatus::Ok)
        };
        assert_eq!(decide(&obs), Decision::UpgradeTo(5));
    }

    #[test]
    fn incremental_upgrade_steps_through_odd_sizes() {
        let obs = Observation {
            current_replicas: 1,
            desired_replicas: 5,
            incremental: true,
            ..observation(ClusterStatus::Ok)
        };
        assert_eq!(decide(&obs), Decision::UpgradeTo(3));

        let obs = Observation {
            current_replicas: 3,
            ..obs
        };
        assert_eq!(decide(&obs), Decision::UpgradeTo(5));
    }

    #[test]
    fn lagging_cluster_is_surfaced_not_remediated() {
        let obs = Observation {
            lagging: true,
            any_queued_writes: true,
            ..observation(ClusterStatus::Ok)
        };
        assert_eq!(
            decide(&obs),
            Decision::Hold(ConditionReason::QuorumNeedsAttentionClusterIsLagging)
        );
    }

    #[test]
    fn steady_state_is_ready() {
        let obs = observation(ClusterStatus::Ok);
        assert_eq!(decide(&obs), Decision::Hold(ConditionReason::QuorumReady));
    }

    #[test]
    fn quorum_sizes_stay_odd_and_bounded() {
        assert_eq!(next_quorum_size(1, 5, true), 3);
        assert_eq!(next_quorum_size(3, 5, true), 5);
        assert_eq!(next_quorum_size(5, 5, true), 5);
        assert_eq!(next_quorum_size(1, 7, true), 3);
        assert_eq!(next_quorum_size(1, 3, true), 3);
        assert_eq!(next_quorum_size(1, 5, false), 5);
        // Even counts (mid-rollout observations) are rounded up to odd.
        assert_eq!(next_quorum_size(2, 7, true), 3);
        for desired in [1, 3, 5, 7] {
            let mut current = 1;
            while current < desired {
                current = next_quorum_size(current, desired, true);
                assert!(current == 1 || current % 2 == 1);
                assert!(current <= desired);
            }
        }
    }
}
