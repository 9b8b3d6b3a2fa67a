use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, PodSpec, PodTemplateSpec, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::ResourceExt;
use tracing::{debug, info};

use crate::{
    cluster_controller::Ctx,
    crds::cluster::{IngressSpec as ClusterIngressSpec, TypesenseCluster},
    error::ReconcileError,
};

const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";
const NGINX_CONF_KEY: &str = "nginx.conf";
const CLUSTER_ISSUER_ANNOTATION: &str = "cert-manager.io/cluster-issuer";

/// Reverse-proxy collaborators: ingress, rendered nginx config, deployment,
/// service. Everything is dropped again when the ingress is undeclared.
pub async fn reconcile_ingress(ctx: &Ctx, ts: &TypesenseCluster) -> Result<(), ReconcileError> {
    let Some(spec) = &ts.spec.ingress else {
        return delete_ingress_objects(ctx, ts).await;
    };

    ensure_ingress(ctx, ts, spec).await?;
    let config_changed = ensure_proxy_config(ctx, ts, spec).await?;
    ensure_proxy_deployment(ctx, ts, spec, config_changed).await?;
    ensure_proxy_service(ctx, ts).await?;
    Ok(())
}

async fn delete_ingress_objects(ctx: &Ctx, ts: &TypesenseCluster) -> Result<(), ReconcileError> {
    let ns = ts.namespace().unwrap_or_default();
    let dp = DeleteParams::default();

    macro_rules! delete_if_present {
        ($kind:ty, $name:expr) => {
            let api: Api<$kind> = Api::namespaced(ctx.client.clone(), &ns);
            match api.delete(&$name, &dp).await {
                Ok(_) => info!(object = %$name, "deleting undeclared reverse proxy object"),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        };
    }

    delete_if_present!(Ingress, ts.reverse_proxy_name());
    delete_if_present!(Deployment, ts.reverse_proxy_name());
    delete_if_present!(ConfigMap, ts.reverse_proxy_config_name());
    delete_if_present!(Service, ts.reverse_proxy_service_name());
    Ok(())
}

async fn ensure_ingress(
    ctx: &Ctx,
    ts: &TypesenseCluster,
    spec: &ClusterIngressSpec,
) -> Result<(), ReconcileError> {
    let ns = ts.namespace().unwrap_or_default();
    let name = ts.reverse_proxy_name();
    let ingresses: Api<Ingress> = Api::namespaced(ctx.client.clone(), &ns);

    let desired = build_ingress(ts, spec);
    match ingresses.get_opt(&name).await? {
        None => {
            info!(ingress = %name, "creating ingress");
            let pp = PostParams::default();
            ingresses.create(&pp, &desired).await?;
        }
        Some(existing) if ingress_drifted(&existing, spec) => {
            info!(ingress = %name, "updating ingress");
            let pp = PatchParams::default();
            ingresses
                .patch(
                    &name,
                    &pp,
                    &Patch::Merge(serde_json::json!({
                        "metadata": { "annotations": desired.metadata.annotations },
                        "spec": desired.spec,
                    })),
                )
                .await?;
        }
        Some(_) => {}
    }
    Ok(())
}

fn ingress_drifted(existing: &Ingress, spec: &ClusterIngressSpec) -> bool {
    let current_host = existing
        .spec
        .as_ref()
        .and_then(|s| s.rules.as_ref())
        .and_then(|r| r.first())
        .and_then(|r| r.host.as_deref());
    if current_host != Some(spec.host.as_str()) {
        return true;
    }

    let current_class = existing
        .spec
        .as_ref()
        .and_then(|s| s.ingress_class_name.as_deref());
    if current_class != Some(spec.ingress_class_name.as_str()) {
        return true;
    }

    let annotations = existing.metadata.annotations.clone().unwrap_or_default();
    if let Some(issuer) = &spec.cluster_issuer {
        if annotations.get(CLUSTER_ISSUER_ANNOTATION) != Some(issuer) {
            return true;
        }
    }
    if let Some(extra) = &spec.annotations {
        if extra.iter().any(|(k, v)| annotations.get(k) != Some(v)) {
            return true;
        }
    }

    if let Some(tls_secret) = &spec.tls_secret_name {
        let current_tls = existing
            .spec
            .as_ref()
            .and_then(|s| s.tls.as_ref())
            .and_then(|t| t.first())
            .and_then(|t| t.secret_name.as_deref());
        if current_tls != Some(tls_secret.as_str()) {
            return true;
        }
    }
    false
}

fn build_ingress(ts: &TypesenseCluster, spec: &ClusterIngressSpec) -> Ingress {
    let mut annotations = spec.annotations.clone().unwrap_or_default();
    if let Some(issuer) = &spec.cluster_issuer {
        annotations.insert(CLUSTER_ISSUER_ANNOTATION.into(), issuer.clone());
    }

    let tls_secret = spec
        .tls_secret_name
        .clone()
        .or_else(|| spec.cluster_issuer.as_ref().map(|_| format!("{}-tls", ts.reverse_proxy_name())));

    let mut metadata = ts.object_meta(&ts.reverse_proxy_name());
    metadata.labels = Some(ts.reverse_proxy_labels());
    metadata.annotations = Some(annotations);

    Ingress {
        metadata,
        spec: Some(IngressSpec {
            ingress_class_name: Some(spec.ingress_class_name.clone()),
            tls: tls_secret.map(|secret_name| {
                vec![IngressTLS {
                    hosts: Some(vec![spec.host.clone()]),
                    secret_name: Some(secret_name),
                }]
            }),
            rules: Some(vec![IngressRule {
                host: Some(spec.host.clone()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".into()),
                        path_type: "Prefix".into(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: ts.reverse_proxy_service_name(),
                                port: Some(ServiceBackendPort {
                                    number: Some(80),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Upserts the rendered nginx config; returns whether the content changed so
/// the deployment can be rolled.
async fn ensure_proxy_config(
    ctx: &Ctx,
    ts: &TypesenseCluster,
    spec: &ClusterIngressSpec,
) -> Result<bool, ReconcileError> {
    let ns = ts.namespace().unwrap_or_default();
    let name = ts.reverse_proxy_config_name();
    let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &ns);

    let rendered = render_proxy_config(ts, spec);
    match config_maps.get_opt(&name).await? {
        None => {
            info!(configmap = %name, "creating reverse proxy config");
            let mut metadata = ts.object_meta(&name);
            metadata.labels = Some(ts.reverse_proxy_labels());
            let cm = ConfigMap {
                metadata,
                data: Some(BTreeMap::from([(NGINX_CONF_KEY.to_string(), rendered)])),
                ..Default::default()
            };
            let pp = PostParams::default();
            config_maps.create(&pp, &cm).await?;
            Ok(false)
        }
        Some(existing) => {
            let current = existing
                .data
                .as_ref()
                .and_then(|d| d.get(NGINX_CONF_KEY))
                .cloned()
                .unwrap_or_default();
            if current == rendered {
                return Ok(false);
            }
            info!(configmap = %name, "updating reverse proxy config");
            let pp = PatchParams::default();
            config_maps
                .patch(
                    &name,
                    &pp,
                    &Patch::Merge(serde_json::json!({ "data": { NGINX_CONF_KEY: rendered } })),
                )
                .await?;
            Ok(true)
        }
    }
}

fn render_proxy_config(ts: &TypesenseCluster, spec: &ClusterIngressSpec) -> String {
    let mut http_block = String::new();
    if let Some(directives) = &spec.http_directives {
        http_block.push_str(directives);
        http_block.push('\n');
    }

    let mut server_block = String::new();
    if let Some(referers) = &spec.referer {
        server_block.push_str(&format!(
            "valid_referers server_names {referers};\nif ($invalid_referer) {{\n  return 403;\n}}\n"
        ));
    }
    if let Some(directives) = &spec.server_directives {
        server_block.push_str(directives);
        server_block.push('\n');
    }

    let mut location_block = String::new();
    if let Some(directives) = &spec.location_directives {
        location_block.push_str(directives);
        location_block.push('\n');
    }

    format!(
        "events {{}}\nhttp {{\n{http_block}server {{\n  listen 80;\n{server_block}  location / {{\n    proxy_pass http://{service}:{port}/;\n    proxy_pass_request_headers on;\n{location_block}  }}\n}}\n}}\n",
        service = ts.rest_service_name(),
        port = ts.spec.api_port,
    )
}

async fn ensure_proxy_deployment(
    ctx: &Ctx,
    ts: &TypesenseCluster,
    spec: &ClusterIngressSpec,
    config_changed: bool,
) -> Result<(), ReconcileError> {
    let ns = ts.namespace().unwrap_or_default();
    let name = ts.reverse_proxy_name();
    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), &ns);

    match deployments.get_opt(&name).await? {
        None => {
            info!(deployment = %name, "creating reverse proxy deployment");
            let pp = PostParams::default();
            deployments.create(&pp, &build_proxy_deployment(ts, spec)).await?;
        }
        Some(existing) => {
            let resources_drifted = existing
                .spec
                .as_ref()
                .and_then(|s| s.template.spec.as_ref())
                .and_then(|p| p.containers.first())
                .map(|c| {
                    c.resources.clone().unwrap_or_default()
                        != spec.resources.clone().unwrap_or_default()
                })
                .unwrap_or(true);

            if config_changed || resources_drifted {
                debug!(deployment = %name, "rolling reverse proxy deployment");
                let mut desired = build_proxy_deployment(ts, spec);
                if let Some(dspec) = desired.spec.as_mut() {
                    let metadata = dspec.template.metadata.get_or_insert_with(Default::default);
                    let annotations = metadata.annotations.get_or_insert_with(Default::default);
                    annotations.insert(RESTARTED_AT_ANNOTATION.into(), Utc::now().to_rfc3339());
                }
                let pp = PatchParams::default();
                deployments
                    .patch(
                        &name,
                        &pp,
                        &Patch::Merge(serde_json::json!({ "spec": desired.spec })),
                    )
                    .await?;
            }
        }
    }
    Ok(())
}

fn build_proxy_deployment(ts: &TypesenseCluster, spec: &ClusterIngressSpec) -> Deployment {
    let mut metadata = ts.object_meta(&ts.reverse_proxy_name());
    metadata.labels = Some(ts.reverse_proxy_labels());

    Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(ts.reverse_proxy_labels()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(ts.reverse_proxy_labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "nginx".into(),
                        image: Some(spec.image.clone()),
                        ports: Some(vec![ContainerPort {
                            name: Some("http".into()),
                            container_port: 80,
                            ..Default::default()
                        }]),
                        resources: spec.resources.clone(),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "nginx-conf".into(),
                            mount_path: "/etc/nginx/nginx.conf".into(),
                            sub_path: Some(NGINX_CONF_KEY.into()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: "nginx-conf".into(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: ts.reverse_proxy_config_name(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

async fn ensure_proxy_service(ctx: &Ctx, ts: &TypesenseCluster) -> Result<(), ReconcileError> {
    let ns = ts.namespace().unwrap_or_default();
    let name = ts.reverse_proxy_service_name();
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), &ns);

    if services.get_opt(&name).await?.is_some() {
        return Ok(());
    }

    info!(service = %name, "creating reverse proxy service");
    let mut metadata = ts.object_meta(&name);
    metadata.labels = Some(ts.reverse_proxy_labels());
    let svc = Service {
        metadata,
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".into()),
            selector: Some(ts.reverse_proxy_labels()),
            ports: Some(vec![ServicePort {
                name: Some("http".into()),
                port: 80,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };
    let pp = PostParams::default();
    services.create(&pp, &svc).await?;
    Ok(())
}
