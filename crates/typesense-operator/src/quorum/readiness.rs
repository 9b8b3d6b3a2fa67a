use chrono::Utc;
use k8s_openapi::api::core::v1::{Pod, PodCondition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use tracing::debug;

use crate::{
    cluster_controller::Ctx,
    crds::cluster::TypesenseCluster,
    error::ReconcileError,
    quorum::types::NodeHealth,
};

/// Pod readiness gate driven by the prober. The statefulset declares it, so
/// rolling updates stall on a pod whose quorum peer has not rejoined.
pub const READINESS_GATE_CONDITION: &str = "RaftQuorumReady";

const REASON_HEALTHY: &str = "NodeHealthy";
const REASON_NOT_HEALTHY: &str = "NodeNotHealthy";
const REASON_NOT_RECOVERABLE: &str = "NodeNotRecoverable";

/// Patch each pod's `RaftQuorumReady` condition from this cycle's health
/// verdicts. `healths` is in ordinal order, matching the published peer list.
pub async fn write_readiness_gates(
    ctx: &Ctx,
    ts: &TypesenseCluster,
    healths: &[NodeHealth],
) -> Result<(), ReconcileError> {
    let ns = ts.namespace().unwrap_or_default();
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &ns);

    for (ordinal, health) in healths.iter().enumerate() {
        let pod_name = ts.pod_name(ordinal as i32);
        let Some(pod) = pods.get_opt(&pod_name).await? else {
            debug!(pod = %pod_name, "skipping readiness gate, pod not found");
            continue;
        };

        let mut conditions = pod
            .status
            .as_ref()
            .and_then(|s| s.conditions.clone())
            .unwrap_or_default();
        merge_gate_condition(&mut conditions, gate_condition(health));

        let pp = PatchParams::default();
        pods.patch_status(
            &pod_name,
            &pp,
            &Patch::Merge(serde_json::json!({ "status": { "conditions": conditions } })),
        )
        .await?;
    }
    Ok(())
}

/// Health verdict to pod condition. A resource error means the node cannot
/// come back on its own, which gets its own reason so operators can tell the
/// two apart from `kubectl describe`.
pub fn gate_condition(health: &NodeHealth) -> PodCondition {
    let (status, reason) = if health.ok {
        ("True", REASON_HEALTHY)
    } else if health.resource_error.is_some() {
        ("False", REASON_NOT_RECOVERABLE)
    } else {
        ("False", REASON_NOT_HEALTHY)
    };

    PodCondition {
        type_: READINESS_GATE_CONDITION.into(),
        status: status.into(),
        observed_generation: None,
        reason: Some(reason.into()),
        message: health
            .resource_error
            .map(|e| format!("node reported {:?}", e)),
        last_probe_time: Some(Time(Utc::now())),
        last_transition_time: Some(Time(Utc::now())),
    }
}

/// Replace the single matching entry, append if absent; the transition time
/// is preserved while the status holds steady.
pub fn merge_gate_condition(conditions: &mut Vec<PodCondition>, mut condition: PodCondition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

#[cfg(test)]
mod tests_readiness {
    use super::*;
    use crate::quorum::types::NodeResourceError;

    #[test]
    fn healthy_node_gates_true() {
        let cond = gate_condition(&NodeHealth {
            ok: true,
            resource_error: None,
        });
        assert_eq!(cond.type_, "RaftQuorumReady");
        assert_eq!(cond.status, "True");
        assert_eq!(cond.reason.as_deref(), Some("NodeHealthy"));
    }

    #[test]
    fn unhealthy_node_gates_false() {
        let cond = gate_condition(&NodeHealth::not_ok());
        assert_eq!(cond.status, "False");
        assert_eq!(cond.reason.as_deref(), Some("NodeNotHealthy"));
    }

    #[test]
    fn resource_error_is_not_recoverable() {
        let cond = gate_condition(&NodeHealth {
            ok: false,
            resource_error: Some(NodeResourceError::OutOfMemory),
        });
        assert_eq!(cond.status, "False");
        assert_eq!(cond.reason.as_deref(), Some("NodeNotRecoverable"));
        assert!(cond.message.as_deref().unwrap_or("").contains("OutOfMemory"));
    }

    #[test]
    fn merge_replaces_matching_entry_and_keeps_others() {
        let mut conditions = vec![
            PodCondition {
                type_: "Ready".into(),
                status: "True".into(),
                ..Default::default()
            },
            gate_condition(&NodeHealth::not_ok()),
        ];
        merge_gate_condition(
            &mut conditions,
            gate_condition(&NodeHealth {
                ok: true,
                resource_error: None,
            }),
        );
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].type_, "Ready");
        assert_eq!(conditions[1].status, "True");
    }

    #[test]
    fn merge_appends_when_absent() {
        let mut conditions = vec![];
        merge_gate_condition(&mut conditions, gate_condition(&NodeHealth::not_ok()));
        assert_eq!(conditions.len(), 1);
    }

    #[test]
    fn merge_preserves_transition_time_while_status_holds() {
        let mut conditions = vec![];
        merge_gate_condition(&mut conditions, gate_condition(&NodeHealth::not_ok()));
        let first = conditions[0].last_transition_time.clone();
        merge_gate_condition(&mut conditions, gate_condition(&NodeHealth::not_ok()));
        assert_eq!(conditions[0].last_transition_time, first);
    }
}
