use std::fmt;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::events::{Event, EventType};
use kube::{Resource, ResourceExt};
use rand::{distributions::Alphanumeric, Rng};
use tracing::warn;

use crate::{
    cluster_controller::Ctx,
    crds::cluster::{TypesenseCluster, TypesenseClusterStatus},
    error::ReconcileError,
};

pub const CONDITION_TYPE_READY: &str = "Ready";

const INIT_RECONCILIATION_MESSAGE: &str = "Starting reconciliation";
const READY_MESSAGE: &str = "Cluster is Ready";

/// Reasons carried by the `Ready` condition. Pipeline faults recover on the
/// next tick, quorum faults are driven forward by the actuator, and the
/// needs-attention pair requires an administrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionReason {
    ReconciliationInProgress,
    SecretNotReady,
    ConfigMapNotReady,
    ServicesNotReady,
    IngressNotReady,
    ScrapersNotReady,
    MetricsExporterNotReady,
    StatefulSetNotReady,
    QuorumStateUnknown,
    QuorumReady,
    QuorumNotReady,
    QuorumNotReadyWaitATerm,
    QuorumDowngraded,
    QuorumUpgraded,
    QuorumQueuedWrites,
    QuorumNeedsAttentionMemoryOrDiskIssue,
    QuorumNeedsAttentionClusterIsLagging,
}

impl ConditionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ConditionReason::ReconciliationInProgress => "ReconciliationInProgress",
            ConditionReason::SecretNotReady => "SecretNotReady",
            ConditionReason::ConfigMapNotReady => "ConfigMapNotReady",
            ConditionReason::ServicesNotReady => "ServicesNotReady",
            ConditionReason::IngressNotReady => "IngressNotReady",
            ConditionReason::ScrapersNotReady => "ScrapersNotReady",
            ConditionReason::MetricsExporterNotReady => "MetricsExporterNotReady",
            ConditionReason::StatefulSetNotReady => "StatefulSetNotReady",
            ConditionReason::QuorumStateUnknown => "QuorumStateUnknown",
            ConditionReason::QuorumReady => "QuorumReady",
            ConditionReason::QuorumNotReady => "QuorumNotReady",
            ConditionReason::QuorumNotReadyWaitATerm => "QuorumNotReadyWaitATerm",
            ConditionReason::QuorumDowngraded => "QuorumDowngraded",
            ConditionReason::QuorumUpgraded => "QuorumUpgraded",
            ConditionReason::QuorumQueuedWrites => "QuorumQueuedWrites",
            ConditionReason::QuorumNeedsAttentionMemoryOrDiskIssue => {
                "QuorumNeedsAttentionMemoryOrDiskIssue"
            }
            ConditionReason::QuorumNeedsAttentionClusterIsLagging => {
                "QuorumNeedsAttentionClusterIsLagging"
            }
        }
    }

    /// Surfaced as a warning and never auto-recovered.
    pub fn needs_attention(self) -> bool {
        matches!(
            self,
            ConditionReason::QuorumNeedsAttentionMemoryOrDiskIssue
                | ConditionReason::QuorumNeedsAttentionClusterIsLagging
        )
    }
}

impl fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn ready_condition(ts: &TypesenseCluster) -> Option<&Condition> {
    ts.status
        .as_ref()?
        .conditions
        .iter()
        .find(|c| c.type_ == CONDITION_TYPE_READY)
}

pub fn ready_reason(ts: &TypesenseCluster) -> Option<String> {
    ready_condition(ts).map(|c| c.reason.clone())
}

/// Merge a condition into the list the way apimachinery does: the transition
/// time only moves when the status actually changes.
pub fn set_status_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    let now = Time(Utc::now());
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            condition.last_transition_time = if existing.status == condition.status {
                existing.last_transition_time.clone()
            } else {
                now
            };
            *existing = condition;
        }
        None => {
            condition.last_transition_time = now;
            conditions.push(condition);
        }
    }
}

async fn patch_status(
    ctx: &Ctx,
    ts: &TypesenseCluster,
    mutate: impl FnOnce(&mut TypesenseClusterStatus),
) -> Result<(), ReconcileError> {
    let ns = ts.namespace().unwrap_or_default();
    let mut status = ts.status.clone().unwrap_or_default();
    mutate(&mut status);

    let api: Api<TypesenseCluster> = Api::namespaced(ctx.client.clone(), &ns);
    let pp = PatchParams::apply("typesense-operator");
    api.patch_status(
        &ts.name_any(),
        &pp,
        &Patch::Merge(serde_json::json!({ "status": status })),
    )
    .await?;
    Ok(())
}

/// First-pass bookkeeping: a `Ready: Unknown` condition and a short random
/// cluster id, both written exactly once.
pub async fn init_conditions(ctx: &Ctx, ts: &TypesenseCluster) -> Result<(), ReconcileError> {
    let has_conditions = ts
        .status
        .as_ref()
        .map(|s| !s.conditions.is_empty())
        .unwrap_or(false);
    let has_cluster_id = ts
        .status
        .as_ref()
        .and_then(|s| s.cluster_id.as_ref())
        .is_some();
    if has_conditions && has_cluster_id {
        return Ok(());
    }

    patch_status(ctx, ts, |status| {
        if status.cluster_id.is_none() {
            status.cluster_id = Some(generate_cluster_id());
        }
        if status.conditions.is_empty() {
            set_status_condition(
                &mut status.conditions,
                Condition {
                    type_: CONDITION_TYPE_READY.into(),
                    status: "Unknown".into(),
                    reason: ConditionReason::ReconciliationInProgress.to_string(),
                    message: INIT_RECONCILIATION_MESSAGE.into(),
                    observed_generation: ts.metadata.generation,
                    last_transition_time: Time(Utc::now()),
                },
            );
            status.phase = Some(ConditionReason::ReconciliationInProgress.to_string());
        }
    })
    .await
}

pub async fn set_condition_not_ready(
    ctx: &Ctx,
    ts: &TypesenseCluster,
    reason: ConditionReason,
    message: &str,
) -> Result<(), ReconcileError> {
    let previous = ready_reason(ts);
    let unchanged = ready_condition(ts)
        .map(|c| c.status == "False" && c.reason == reason.as_str() && c.message == message)
        .unwrap_or(false);
    if unchanged {
        return Ok(());
    }
    patch_status(ctx, ts, |status| {
        set_status_condition(
            &mut status.conditions,
            Condition {
                type_: CONDITION_TYPE_READY.into(),
                status: "False".into(),
                reason: reason.to_string(),
                message: message.to_string(),
                observed_generation: ts.metadata.generation,
                last_transition_time: Time(Utc::now()),
            },
        );
        status.phase = Some(reason.to_string());
    })
    .await?;

    if previous.as_deref() != Some(reason.as_str()) {
        publish_event(ctx, ts, EventType::Warning, reason, message).await;
    }
    Ok(())
}

pub async fn set_condition_ready(ctx: &Ctx, ts: &TypesenseCluster) -> Result<(), ReconcileError> {
    let was_ready = ready_condition(ts)
        .map(|c| c.status == "True")
        .unwrap_or(false);
    if was_ready {
        return Ok(());
    }
    patch_status(ctx, ts, |status| {
        set_status_condition(
            &mut status.conditions,
            Condition {
                type_: CONDITION_TYPE_READY.into(),
                status: "True".into(),
                reason: ConditionReason::QuorumReady.to_string(),
                message: READY_MESSAGE.into(),
                observed_generation: ts.metadata.generation,
                last_transition_time: Time(Utc::now()),
            },
        );
        status.phase = Some(ConditionReason::QuorumReady.to_string());
    })
    .await?;

    publish_event(
        ctx,
        ts,
        EventType::Normal,
        ConditionReason::QuorumReady,
        "Quorum is ready",
    )
    .await;
    Ok(())
}

/// Events are best effort; a failed publish never fails the tick.
async fn publish_event(
    ctx: &Ctx,
    ts: &TypesenseCluster,
    type_: EventType,
    reason: ConditionReason,
    note: &str,
) {
    let event = Event {
        type_,
        reason: reason.to_string(),
        note: Some(note.to_string()),
        action: "Reconciling".into(),
        secondary: None,
    };
    if let Err(error) = ctx.recorder.publish(&event, &ts.object_ref(&())).await {
        warn!(?error, reason = %reason, "publishing event failed");
    }
}

fn generate_cluster_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(4)
        .map(char::from)
        .collect();
    format!("tsc-{}", suffix.to_lowercase())
}

#[cfg(test)]
mod tests_conditions {
    use super::*;

    fn condition(status: &str, reason: ConditionReason) -> Condition {
        Condition {
            type_: CONDITION_TYPE_READY.into(),
            status: status.into(),
            reason: reason.to_string(),
            message: String::new(),
            observed_generation: None,
            last_transition_time: Time(Utc::now()),
        }
    }

    #[test]
    fn transition_time_moves_only_on_status_change() {
        let mut conditions = vec![];
        set_status_condition(&mut conditions, condition("False", ConditionReason::QuorumNotReady));
        let first = conditions[0].last_transition_time.clone();

        set_status_condition(
            &mut conditions,
            condition("False", ConditionReason::QuorumNotReadyWaitATerm),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].reason, "QuorumNotReadyWaitATerm");
        assert_eq!(conditions[0].last_transition_time, first);

        set_status_condition(&mut conditions, condition("True", ConditionReason::QuorumReady));
        assert_eq!(conditions.len(), 1);
        assert_ne!(conditions[0].last_transition_time, first);
    }

    #[test]
    fn needs_attention_classification() {
        assert!(ConditionReason::QuorumNeedsAttentionMemoryOrDiskIssue.needs_attention());
        assert!(ConditionReason::QuorumNeedsAttentionClusterIsLagging.needs_attention());
        assert!(!ConditionReason::QuorumDowngraded.needs_attention());
        assert!(!ConditionReason::QuorumReady.needs_attention());
    }

    #[test]
    fn cluster_id_shape() {
        let id = generate_cluster_id();
        assert!(id.starts_with("tsc-"));
        assert_eq!(id.len(), 8);
        assert_eq!(id, id.to_lowercase());
    }
}
