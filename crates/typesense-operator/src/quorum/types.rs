use std::fmt;

use k8s_openapi::api::core::v1::ConfigMap;
use serde::{Deserialize, Serialize};

/// Role a node reports on `/status`, plus the two states the prober
/// synthesizes when the node cannot be asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Leader,
    Follower,
    Candidate,
    NotReady,
    /// Connection error or deadline exceeded; never sent on the wire.
    Unreachable,
    /// Non-200 or undecodable response; never sent on the wire.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub committed_index: i64,
    #[serde(default)]
    pub queued_writes: i64,
    pub state: NodeState,
}

impl NodeStatus {
    pub fn unreachable() -> Self {
        NodeStatus {
            committed_index: 0,
            queued_writes: 0,
            state: NodeState::Unreachable,
        }
    }

    pub fn error() -> Self {
        NodeStatus {
            committed_index: 0,
            queued_writes: 0,
            state: NodeState::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeResourceError {
    OutOfMemory,
    OutOfDisk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHealth {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_error: Option<NodeResourceError>,
}

impl NodeHealth {
    pub fn not_ok() -> Self {
        NodeHealth {
            ok: false,
            resource_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStatus {
    Ok,
    NotReady,
    SplitBrain,
    ElectionDeadlock,
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterStatus::Ok => "OK",
            ClusterStatus::NotReady => "NOT_READY",
            ClusterStatus::SplitBrain => "SPLIT_BRAIN",
            ClusterStatus::ElectionDeadlock => "ELECTION_DEADLOCK",
        };
        f.write_str(s)
    }
}

/// A published peer entry, `host:peeringPort:apiPort`. The host is an ordinal
/// DNS name during bootstrap and a bare pod IP in steady state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEndpoint {
    pub host: String,
    pub peering_port: i32,
    pub api_port: i32,
}

impl NodeEndpoint {
    pub fn parse(entry: &str) -> Option<Self> {
        let mut parts = entry.split(':');
        let host = parts.next()?.to_string();
        let peering_port = parts.next()?.parse().ok()?;
        let api_port = parts.next()?.parse().ok()?;
        if host.is_empty() || parts.next().is_some() {
            return None;
        }
        Some(NodeEndpoint {
            host,
            peering_port,
            api_port,
        })
    }
}

impl fmt::Display for NodeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.peering_port, self.api_port)
    }
}

/// Snapshot of the published quorum, derived each tick and never persisted.
pub struct Quorum {
    pub min_required_nodes: usize,
    pub available_nodes: usize,
    pub nodes: Vec<NodeEndpoint>,
    pub nodes_list: ConfigMap,
}

/// The floor below which the cluster cannot commit writes.
pub fn min_required_nodes(available_nodes: usize) -> usize {
    (available_nodes.saturating_sub(1)) / 2 + 1
}

#[cfg(test)]
mod tests_quorum_types {
    use super::*;

    #[test]
    fn min_required_over_allowed_sizes() {
        assert_eq!(min_required_nodes(1), 1);
        assert_eq!(min_required_nodes(3), 2);
        assert_eq!(min_required_nodes(5), 3);
        assert_eq!(min_required_nodes(7), 4);
    }

    #[test]
    fn endpoint_round_trip() {
        let entry = "demo-sts-0.demo-sts-svc:8107:8108";
        let endpoint = NodeEndpoint::parse(entry).expect("parses");
        assert_eq!(endpoint.host, "demo-sts-0.demo-sts-svc");
        assert_eq!(endpoint.peering_port, 8107);
        assert_eq!(endpoint.api_port, 8108);
        assert_eq!(endpoint.to_string(), entry);

        let ip = NodeEndpoint::parse("10.42.0.17:8107:8108").expect("parses");
        assert_eq!(ip.host, "10.42.0.17");
    }

    #[test]
    fn endpoint_rejects_malformed_entries() {
        assert!(NodeEndpoint::parse("").is_none());
        assert!(NodeEndpoint::parse("host:8107").is_none());
        assert!(NodeEndpoint::parse("host:8107:8108:9").is_none());
        assert!(NodeEndpoint::parse(":8107:8108").is_none());
    }

    #[test]
    fn status_decodes_engine_wire_format() {
        let status: NodeStatus = serde_json::from_str(
            r#"{"committed_index": 42, "queued_writes": 3, "state": "LEADER"}"#,
        )
        .expect("decodes");
        assert_eq!(status.state, NodeState::Leader);
        assert_eq!(status.committed_index, 42);
        assert_eq!(status.queued_writes, 3);

        let health: NodeHealth =
            serde_json::from_str(r#"{"ok": false, "resource_error": "OUT_OF_MEMORY"}"#)
                .expect("decodes");
        assert!(!health.ok);
        assert_eq!(health.resource_error, Some(NodeResourceError::OutOfMemory));
    }
}
