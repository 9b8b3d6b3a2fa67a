use std::sync::Arc;

use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Recorder, Reporter};
use kube::{Api, Client, ResourceExt};
use tokio::time::Duration;
use tracing::{error, info, warn};

use crate::{
    conditions::{self, ConditionReason},
    crds::cluster::TypesenseCluster,
    error::ReconcileError,
    ingress, nodeslist, podmonitor,
    quorum::actuator,
    scraper, secret, services, statefulset,
};

/// Base requeue interval; the workload's termination grace period is added so
/// a tick never lands in the middle of a pod it just asked to stop.
const REQUEUE_BASE_SECONDS: u64 = 60;

#[derive(Clone)]
pub struct Ctx {
    pub client: Client,
    pub recorder: Recorder,
}

impl Ctx {
    pub fn new(client: Client) -> Self {
        let recorder = Recorder::new(
            client.clone(),
            Reporter {
                controller: "typesense-operator".into(),
                instance: std::env::var("POD_NAME").ok(),
            },
        );
        Ctx { client, recorder }
    }
}

pub fn controller(client: Client) -> Controller<TypesenseCluster> {
    let api: Api<TypesenseCluster> = Api::all(client);
    Controller::new(api, Default::default()).shutdown_on_signal()
}

/// One reconciliation tick: secret, peer list, services, ingress, scrapers,
/// pod monitor, workload — strictly in that order — then the quorum check,
/// unless this was the bootstrap pass that created the peer list.
pub async fn reconcile(
    ts: Arc<TypesenseCluster>,
    ctx: Arc<Ctx>,
) -> Result<Action, ReconcileError> {
    let ns = ts.namespace().unwrap_or_default();
    let name = ts.name_any();
    info!(namespace = %ns, cluster = %name, "reconciling cluster");

    conditions::init_conditions(&ctx, &ts).await?;

    let admin_secret = match secret::reconcile_secret(&ctx, &ts).await {
        Ok(secret) => secret,
        Err(e) => return Err(fail_step(&ctx, &ts, ConditionReason::SecretNotReady, e).await),
    };

    let nodes_list_existed = match nodeslist::reconcile_nodes_list(&ctx, &ts).await {
        Ok(existed) => existed,
        Err(e) => return Err(fail_step(&ctx, &ts, ConditionReason::ConfigMapNotReady, e).await),
    };

    if let Err(e) = services::reconcile_services(&ctx, &ts).await {
        return Err(fail_step(&ctx, &ts, ConditionReason::ServicesNotReady, e).await);
    }

    if let Err(e) = ingress::reconcile_ingress(&ctx, &ts).await {
        return Err(fail_step(&ctx, &ts, ConditionReason::IngressNotReady, e).await);
    }

    if let Err(e) = scraper::reconcile_scrapers(&ctx, &ts).await {
        return Err(fail_step(&ctx, &ts, ConditionReason::ScrapersNotReady, e).await);
    }

    if let Err(e) = podmonitor::reconcile_pod_monitor(&ctx, &ts).await {
        return Err(fail_step(&ctx, &ts, ConditionReason::MetricsExporterNotReady, e).await);
    }

    let sts = match statefulset::reconcile_statefulset(&ctx, &ts).await {
        Ok(sts) => sts,
        Err(e) => return Err(fail_step(&ctx, &ts, ConditionReason::StatefulSetNotReady, e).await),
    };

    // A freshly created peer list means the workload is only now coming up;
    // probing it would misclassify a cluster that never elected anything yet.
    if nodes_list_existed {
        let reason = match actuator::reconcile_quorum(&ctx, &ts, &admin_secret, &sts).await {
            Ok(reason) => reason,
            Err(e) => {
                return Err(fail_step(&ctx, &ts, ConditionReason::QuorumStateUnknown, e).await)
            }
        };

        if reason == ConditionReason::QuorumReady {
            conditions::set_condition_ready(&ctx, &ts).await?;
        } else {
            conditions::set_condition_not_ready(&ctx, &ts, reason, quorum_message(reason)).await?;
        }
        info!(namespace = %ns, cluster = %name, condition = %reason, "reconciling cluster completed");
    } else {
        info!(namespace = %ns, cluster = %name, "bootstrapping cluster completed");
    }

    let requeue = REQUEUE_BASE_SECONDS + statefulset::TERMINATION_GRACE_SECONDS as u64;
    Ok(Action::requeue(Duration::from_secs(requeue)))
}

pub fn error_policy(_ts: Arc<TypesenseCluster>, err: &ReconcileError, _ctx: Arc<Ctx>) -> Action {
    error!(error = ?err, "reconcile failed");
    Action::requeue(Duration::from_secs(30))
}

/// Record the step's failure on the `Ready` condition, then hand the error
/// back so the tick fails fast onto the error-policy requeue.
async fn fail_step(
    ctx: &Ctx,
    ts: &TypesenseCluster,
    reason: ConditionReason,
    err: ReconcileError,
) -> ReconcileError {
    if let Err(cond_err) =
        conditions::set_condition_not_ready(ctx, ts, reason, &err.to_string()).await
    {
        warn!(error = ?cond_err, "updating cluster status failed");
    }
    err
}

fn quorum_message(reason: ConditionReason) -> &'static str {
    match reason {
        ConditionReason::QuorumDowngraded => "quorum downgraded to a single node",
        ConditionReason::QuorumUpgraded => "quorum upgraded towards the declared replicas",
        ConditionReason::QuorumQueuedWrites => {
            "queued writes pending, quorum upgrade deferred"
        }
        ConditionReason::QuorumNotReadyWaitATerm => {
            "quorum not ready, waiting an election term"
        }
        ConditionReason::QuorumNotReady => "quorum has fewer healthy nodes than required",
        ConditionReason::QuorumNeedsAttentionMemoryOrDiskIssue => {
            "cluster needs manual administrative attention: out of memory or disk"
        }
        ConditionReason::QuorumNeedsAttentionClusterIsLagging => {
            "cluster needs manual administrative attention: queued writes above the healthy write lag"
        }
        _ => "quorum is not ready",
    }
}

#[cfg(test)]
mod tests_cluster_controller {
    use super::*;

    #[test]
    fn requeue_interval_includes_termination_grace() {
        let requeue = REQUEUE_BASE_SECONDS + statefulset::TERMINATION_GRACE_SECONDS as u64;
        assert_eq!(requeue, 65);
    }

    #[test]
    fn quorum_messages_cover_the_attention_reasons() {
        assert!(quorum_message(ConditionReason::QuorumNeedsAttentionMemoryOrDiskIssue)
            .contains("out of memory or disk"));
        assert!(quorum_message(ConditionReason::QuorumNeedsAttentionClusterIsLagging)
            .contains("healthy write lag"));
    }
}
