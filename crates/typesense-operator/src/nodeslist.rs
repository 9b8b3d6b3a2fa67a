use std::collections::{BTreeMap, HashMap, HashSet};

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::ResourceExt;
use tracing::{debug, info};

use crate::{
    cluster_controller::Ctx, crds::cluster::TypesenseCluster, error::ReconcileError,
};

/// Raft rejects peer hostnames longer than this.
pub const NODE_NAME_LEN_LIMIT: usize = 64;
pub const NODES_KEY: &str = "nodes";

/// Ordinal DNS name of a peer behind the headless service.
fn raft_hostname(ts: &TypesenseCluster, ordinal: i32) -> String {
    format!("{}.{}", ts.pod_name(ordinal), ts.headless_service_name())
}

fn check_hostname(hostname: &str) -> Result<(), ReconcileError> {
    if hostname.len() > NODE_NAME_LEN_LIMIT {
        return Err(ReconcileError::NameTooLong {
            name: hostname.to_string(),
            limit: NODE_NAME_LEN_LIMIT,
        });
    }
    Ok(())
}

/// Peer entries for a cluster with no workload yet: one ordinal DNS name per
/// declared replica.
pub fn bootstrap_nodes(
    ts: &TypesenseCluster,
    replicas: i32,
) -> Result<Vec<String>, ReconcileError> {
    let mut nodes = Vec::with_capacity(replicas as usize);
    for ordinal in 0..replicas {
        let hostname = raft_hostname(ts, ordinal);
        check_hostname(&hostname)?;
        nodes.push(format!(
            "{}:{}:{}",
            hostname, ts.spec.peering_port, ts.spec.api_port
        ));
    }
    Ok(nodes)
}

/// Pods of the workload that are actually able to peer: not terminating,
/// Running, and carrying an IP.
async fn live_pod_ips(
    ctx: &Ctx,
    ts: &TypesenseCluster,
) -> Result<HashMap<String, String>, ReconcileError> {
    let ns = ts.namespace().unwrap_or_default();
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &ns);
    let lp = ListParams::default().labels(&format!("app={}", ts.sts_name()));

    let mut live = HashMap::new();
    for pod in pods.list(&lp).await? {
        if pod.metadata.deletion_timestamp.is_some() {
            continue;
        }
        let Some(status) = &pod.status else { continue };
        if status.phase.as_deref() != Some("Running") {
            continue;
        }
        if let Some(ip) = status.pod_ip.as_ref().filter(|ip| !ip.is_empty()) {
            live.insert(pod.name_any(), ip.clone());
        }
    }
    Ok(live)
}

/// Addresses the headless service currently publishes. Slices can lag pod
/// churn, which is why they are intersected with live pod IPs.
async fn endpoint_addresses(
    ctx: &Ctx,
    ts: &TypesenseCluster,
) -> Result<HashSet<String>, ReconcileError> {
    let ns = ts.namespace().unwrap_or_default();
    let slices: Api<EndpointSlice> = Api::namespaced(ctx.client.clone(), &ns);
    let lp = ListParams::default().labels(&format!(
        "kubernetes.io/service-name={}",
        ts.headless_service_name()
    ));

    let mut addresses = HashSet::new();
    for slice in slices.list(&lp).await? {
        for endpoint in slice.endpoints {
            addresses.extend(endpoint.addresses);
        }
    }
    Ok(addresses)
}

/// Peer entries for a running cluster, exactly `replicas` long and in ordinal
/// order: a live endpoint-backed pod contributes its IP, anything else its
/// DNS name. Ordinal 0 always comes first, so a single-entry list during a
/// downgrade retains the right peer.
pub async fn build_nodes(
    ctx: &Ctx,
    ts: &TypesenseCluster,
    replicas: i32,
) -> Result<Vec<String>, ReconcileError> {
    let live = live_pod_ips(ctx, ts).await?;
    let published = endpoint_addresses(ctx, ts).await?;

    let mut nodes = Vec::with_capacity(replicas as usize);
    for ordinal in 0..replicas {
        let hostname = raft_hostname(ts, ordinal);
        check_hostname(&hostname)?;

        let host = match live.get(&ts.pod_name(ordinal)) {
            Some(ip) if published.contains(ip) => ip.clone(),
            _ => hostname,
        };
        nodes.push(format!("{}:{}:{}", host, ts.spec.peering_port, ts.spec.api_port));
    }
    Ok(nodes)
}

/// Ensure the `{cluster}-nodeslist` config map. Returns whether it already
/// existed; the first pass (creation) is the bootstrap pass and skips the
/// quorum check downstream.
pub async fn reconcile_nodes_list(
    ctx: &Ctx,
    ts: &TypesenseCluster,
) -> Result<bool, ReconcileError> {
    let ns = ts.namespace().unwrap_or_default();
    let name = ts.nodes_list_name();
    let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &ns);

    match config_maps.get_opt(&name).await? {
        Some(cm) => {
            update_nodes(ctx, ts, &cm, None).await?;
            Ok(true)
        }
        None => {
            info!(configmap = %name, "creating nodes list");
            let nodes = bootstrap_nodes(ts, ts.spec.replicas)?;
            let cm = ConfigMap {
                metadata: ts.object_meta(&name),
                data: Some(BTreeMap::from([(NODES_KEY.to_string(), nodes.join(","))])),
                ..Default::default()
            };
            let pp = PostParams::default();
            config_maps.create(&pp, &cm).await?;
            Ok(false)
        }
    }
}

/// Re-derive the peer list and patch it in place when it drifted. With
/// `replicas_override` the list is narrowed or widened ahead of a scale, the
/// quorum actuator's lever for downgrades and upgrades. Returns the published
/// list length.
pub async fn update_nodes(
    ctx: &Ctx,
    ts: &TypesenseCluster,
    cm: &ConfigMap,
    replicas_override: Option<i32>,
) -> Result<usize, ReconcileError> {
    let ns = ts.namespace().unwrap_or_default();

    let replicas = match replicas_override {
        Some(replicas) => replicas,
        None => {
            let sts_api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &ns);
            sts_api
                .get_opt(&ts.sts_name())
                .await?
                .and_then(|sts| sts.spec.and_then(|s| s.replicas))
                .unwrap_or(ts.spec.replicas)
        }
    };

    let nodes = build_nodes(ctx, ts, replicas).await?;
    if nodes.is_empty() {
        return Err(anyhow::anyhow!("empty quorum configuration").into());
    }

    let desired = nodes.join(",");
    let current = cm
        .data
        .as_ref()
        .and_then(|d| d.get(NODES_KEY))
        .cloned()
        .unwrap_or_default();

    if current != desired {
        info!(nodes = nodes.len(), "updating quorum configuration");
        let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &ns);
        let pp = PatchParams::default();
        config_maps
            .patch(
                &ts.nodes_list_name(),
                &pp,
                &Patch::Merge(serde_json::json!({ "data": { NODES_KEY: desired } })),
            )
            .await?;
    } else {
        debug!(nodes = nodes.len(), "quorum configuration unchanged");
    }

    Ok(nodes.len())
}
