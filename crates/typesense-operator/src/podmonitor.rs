use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, PostParams,
};
use kube::ResourceExt;
use tracing::{debug, info};

use crate::{
    cluster_controller::Ctx, crds::cluster::TypesenseCluster, error::ReconcileError,
};

const MONITORING_GROUP: &str = "monitoring.coreos.com";

fn pod_monitor_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(MONITORING_GROUP, "v1", "PodMonitor"))
}

/// Pod monitor for the metrics sidecar. Only materialized when metrics are
/// declared and the monitoring API group is actually served; most of the
/// fields are immutable, so drift means drop and recreate.
pub async fn reconcile_pod_monitor(
    ctx: &Ctx,
    ts: &TypesenseCluster,
) -> Result<(), ReconcileError> {
    let ns = ts.namespace().unwrap_or_default();
    let name = ts.pod_monitor_name();
    let api: Api<DynamicObject> =
        Api::namespaced_with(ctx.client.clone(), &ns, &pod_monitor_resource());

    if !monitoring_group_served(ctx).await? {
        debug!("monitoring api group not served, skipping pod monitor");
        return Ok(());
    }

    if ts.spec.metrics.is_none() {
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => info!(podmonitor = %name, "deleting undeclared pod monitor"),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
        return Ok(());
    }

    let desired = build_pod_monitor(ts);
    match api.get_opt(&name).await? {
        None => {
            info!(podmonitor = %name, "creating pod monitor");
            let pp = PostParams::default();
            api.create(&pp, &desired).await?;
        }
        Some(existing) if existing.data.get("spec") != desired.data.get("spec") => {
            info!(podmonitor = %name, "recreating drifted pod monitor");
            api.delete(&name, &DeleteParams::default()).await?;
            let pp = PostParams::default();
            api.create(&pp, &desired).await?;
        }
        Some(_) => {}
    }
    Ok(())
}

async fn monitoring_group_served(ctx: &Ctx) -> Result<bool, ReconcileError> {
    let groups = ctx.client.list_api_groups().await?;
    Ok(groups
        .groups
        .iter()
        .any(|group| group.name == MONITORING_GROUP))
}

fn build_pod_monitor(ts: &TypesenseCluster) -> DynamicObject {
    let exporter = ts.metrics_exporter();
    let mut monitor = DynamicObject::new(&ts.pod_monitor_name(), &pod_monitor_resource());
    monitor.metadata.namespace = kube::ResourceExt::namespace(ts);
    monitor.metadata.labels = Some(ts.labels());
    monitor.metadata.owner_references = Some(vec![ts.owner_ref()]);
    monitor.data = serde_json::json!({
        "spec": {
            "selector": { "matchLabels": ts.labels() },
            "podMetricsEndpoints": [{
                "port": "metrics",
                "path": "/metrics",
                "interval": exporter.interval,
            }],
        }
    });
    monitor
}

#[cfg(test)]
mod tests_podmonitor {
    use super::*;

    #[test]
    fn pod_monitor_selects_the_workload_pods() {
        let mut ts = TypesenseCluster::new(
            "demo",
            serde_json::from_value(serde_json::json!({
                "image": "typesense/typesense:27.1",
                "storage": {"storageClassName": "standard"},
                "metrics": {}
            }))
            .expect("valid spec"),
        );
        ts.metadata.namespace = Some("ns".into());

        let monitor = build_pod_monitor(&ts);
        assert_eq!(monitor.metadata.name.as_deref(), Some("demo-podmonitor"));
        assert_eq!(
            monitor.data["spec"]["selector"]["matchLabels"]["app"],
            serde_json::json!("demo-sts")
        );
        let endpoint = &monitor.data["spec"]["podMetricsEndpoints"][0];
        assert_eq!(endpoint["port"], serde_json::json!("metrics"));
        assert_eq!(endpoint["interval"], serde_json::json!("15s"));
    }
}
