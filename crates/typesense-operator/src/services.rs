use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::ResourceExt;
use tracing::debug;

use crate::{
    cluster_controller::Ctx, crds::cluster::TypesenseCluster, error::ReconcileError,
};

const ENGINE_CONTAINER_PORT: i32 = 8108;

/// Ensure the headless peering service and the ClusterIP REST service.
pub async fn reconcile_services(ctx: &Ctx, ts: &TypesenseCluster) -> Result<(), ReconcileError> {
    ensure_service(ctx, ts, &ts.headless_service_name(), true).await?;
    ensure_service(ctx, ts, &ts.rest_service_name(), false).await?;
    Ok(())
}

async fn ensure_service(
    ctx: &Ctx,
    ts: &TypesenseCluster,
    name: &str,
    headless: bool,
) -> Result<(), ReconcileError> {
    let ns = ts.namespace().unwrap_or_default();
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), &ns);

    match services.get_opt(name).await? {
        None => {
            debug!(service = %name, "creating service");
            let svc = build_service(ts, name, headless);
            let pp = PostParams::default();
            services.create(&pp, &svc).await?;
        }
        Some(existing) => {
            let current_port = existing
                .spec
                .as_ref()
                .and_then(|s| s.ports.as_ref())
                .and_then(|p| p.first())
                .map(|p| p.port);
            if current_port != Some(ts.spec.api_port) {
                debug!(service = %name, "updating service port");
                let pp = PatchParams::default();
                services
                    .patch(
                        name,
                        &pp,
                        &Patch::Merge(serde_json::json!({
                            "spec": { "ports": [service_port(ts)] }
                        })),
                    )
                    .await?;
            }
        }
    }
    Ok(())
}

fn service_port(ts: &TypesenseCluster) -> ServicePort {
    ServicePort {
        name: Some("http".into()),
        port: ts.spec.api_port,
        target_port: Some(IntOrString::Int(ENGINE_CONTAINER_PORT)),
        ..Default::default()
    }
}

fn build_service(ts: &TypesenseCluster, name: &str, headless: bool) -> Service {
    let spec = if headless {
        ServiceSpec {
            cluster_ip: Some("None".into()),
            // Peers must resolve each other before they report ready.
            publish_not_ready_addresses: Some(true),
            selector: Some(ts.labels()),
            ports: Some(vec![service_port(ts)]),
            ..Default::default()
        }
    } else {
        ServiceSpec {
            type_: Some("ClusterIP".into()),
            selector: Some(ts.labels()),
            ports: Some(vec![service_port(ts)]),
            ..Default::default()
        }
    };

    Service {
        metadata: ts.object_meta(name),
        spec: Some(spec),
        ..Default::default()
    }
}
