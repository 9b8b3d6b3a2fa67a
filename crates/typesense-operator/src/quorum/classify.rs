use std::collections::BTreeMap;

use crate::quorum::types::{min_required_nodes, ClusterStatus, NodeState, NodeStatus};

/// Classify the cluster from one cycle's node statuses. Pure and commutative
/// over the map; the actuator is the only place that acts on the verdict.
///
/// Two leaders is the single unambiguous intervention signal. One leader with
/// a bare majority is OK even while minority nodes are unreachable; no leader
/// among several nodes is an election deadlock (a candidate majority counts —
/// it cannot converge once peers disagree about the membership list).
pub fn classify(nodes: &BTreeMap<String, NodeStatus>) -> ClusterStatus {
    let available = nodes.len();
    let min_required = min_required_nodes(available);

    let leaders = nodes
        .values()
        .filter(|s| s.state == NodeState::Leader)
        .count();
    let not_ready = nodes
        .values()
        .filter(|s| matches!(s.state, NodeState::NotReady | NodeState::Unreachable))
        .count();

    if leaders > 1 {
        return ClusterStatus::SplitBrain;
    }

    if leaders == 0 {
        if available == 1 {
            return ClusterStatus::NotReady;
        }
        return ClusterStatus::ElectionDeadlock;
    }

    if available - not_ready < min_required {
        return ClusterStatus::NotReady;
    }

    ClusterStatus::Ok
}
