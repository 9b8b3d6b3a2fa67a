use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapEnvSource, ConfigMapVolumeSource, Container, ContainerPort, EnvFromSource,
    EnvVar, EnvVarSource, ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    HTTPGetAction, Pod, PodReadinessGate, PodSecurityContext, PodSpec, PodTemplateSpec, Probe,
    SecretKeySelector, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::{
    cluster_controller::Ctx,
    conditions::{self, ConditionReason},
    crds::cluster::{TypesenseCluster, ADMIN_API_KEY_SECRET_KEY},
    error::ReconcileError,
    nodeslist,
    quorum::readiness::READINESS_GATE_CONDITION,
};

const METRICS_PORT: i32 = 9100;
const HASH_ANNOTATION: &str = "ts.opentelekomcloud.com/pod-template-hash";
const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

const NODES_MOUNT_PATH: &str = "/usr/share/typesense";
const DATA_MOUNT_PATH: &str = "/usr/share/typesense/data";

/// The engine tolerates abrupt exits; Raft handles the rest. A short grace
/// period keeps downgrades and purges fast.
pub const TERMINATION_GRACE_SECONDS: i64 = 5;

/// Reasons during which the workload must not be touched: the quorum
/// actuator owns replicas and peer list in those states and a concurrent
/// template update would race it.
fn in_skip_list(reason: &str) -> bool {
    matches!(
        reason,
        "QuorumDowngraded"
            | "QuorumUpgraded"
            | "QuorumNeedsAttentionMemoryOrDiskIssue"
            | "QuorumNotReady"
            | "StatefulSetNotReady"
            | "ReconciliationInProgress"
            | "QuorumNotReadyWaitATerm"
    )
}

pub async fn reconcile_statefulset(
    ctx: &Ctx,
    ts: &TypesenseCluster,
) -> Result<StatefulSet, ReconcileError> {
    let ns = ts.namespace().unwrap_or_default();
    let name = ts.sts_name();
    let sts_api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &ns);

    let Some(current) = sts_api.get_opt(&name).await? else {
        info!(sts = %name, "creating statefulset");
        let desired = build_statefulset(ctx, ts).await?;
        let pp = PostParams::default();
        return Ok(sts_api.create(&pp, &desired).await?);
    };

    let reason = conditions::ready_reason(ts).unwrap_or_default();
    if in_skip_list(&reason) {
        debug!(sts = %name, %reason, "skipping statefulset update in quorum-managed state");
        return Ok(current);
    }

    let desired = build_statefulset(ctx, ts).await?;
    if !should_update(&current, &desired, ts, &reason) {
        return Ok(current);
    }

    info!(sts = %name, "updating statefulset");
    let updated = update_statefulset(ts, &sts_api, &current, desired).await?;

    // Keep the peer list in lockstep with whatever replica count was applied.
    let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &ns);
    if let Some(cm) = config_maps.get_opt(&ts.nodes_list_name()).await? {
        let replicas = updated.spec.as_ref().and_then(|s| s.replicas);
        nodeslist::update_nodes(ctx, ts, &cm, replicas).await?;
    }

    Ok(updated)
}

fn should_update(
    current: &StatefulSet,
    desired: &StatefulSet,
    ts: &TypesenseCluster,
    reason: &str,
) -> bool {
    let current_replicas = current.spec.as_ref().and_then(|s| s.replicas);
    let replicas_drifted = current_replicas != Some(ts.spec.replicas)
        && reason != ConditionReason::QuorumDowngraded.as_str()
        && reason != ConditionReason::QuorumQueuedWrites.as_str();

    replicas_drifted || template_hash(current) != template_hash(desired)
}

fn template_hash(sts: &StatefulSet) -> Option<String> {
    sts.spec
        .as_ref()?
        .template
        .metadata
        .as_ref()?
        .annotations
        .as_ref()?
        .get(HASH_ANNOTATION)
        .cloned()
}

async fn update_statefulset(
    ts: &TypesenseCluster,
    sts_api: &Api<StatefulSet>,
    current: &StatefulSet,
    mut desired: StatefulSet,
) -> Result<StatefulSet, ReconcileError> {
    let hash_changed = template_hash(current) != template_hash(&desired);

    if let Some(spec) = desired.spec.as_mut() {
        let metadata = spec.template.metadata.get_or_insert_with(Default::default);
        let annotations = metadata.annotations.get_or_insert_with(Default::default);
        if hash_changed {
            // Rolls the pods; replica-only changes must not restart anything.
            annotations.insert(RESTARTED_AT_ANNOTATION.into(), Utc::now().to_rfc3339());
        } else if let Some(previous) = current
            .spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.annotations.as_ref())
            .and_then(|a| a.get(RESTARTED_AT_ANNOTATION))
        {
            annotations.insert(RESTARTED_AT_ANNOTATION.into(), previous.clone());
        }
    }

    let pp = PatchParams::default();
    let patched = sts_api
        .patch(
            &ts.sts_name(),
            &pp,
            &Patch::Merge(serde_json::json!({ "spec": desired.spec })),
        )
        .await?;
    Ok(patched)
}

/// Scale without touching the template. No-op when already at the target.
pub async fn scale_statefulset(
    ctx: &Ctx,
    ts: &TypesenseCluster,
    replicas: i32,
) -> Result<(), ReconcileError> {
    let ns = ts.namespace().unwrap_or_default();
    let sts_api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &ns);
    let name = ts.sts_name();

    let current = sts_api.get(&name).await?;
    if current.spec.as_ref().and_then(|s| s.replicas) == Some(replicas) {
        debug!(sts = %name, replicas, "statefulset already at desired replicas");
        return Ok(());
    }

    info!(sts = %name, replicas, "scaling statefulset");
    let pp = PatchParams::default();
    sts_api
        .patch(
            &name,
            &pp,
            &Patch::Merge(serde_json::json!({ "spec": { "replicas": replicas } })),
        )
        .await?;
    Ok(())
}

/// Delete every pod behind the workload selector so the controller recreates
/// them against the currently published peer list.
pub async fn purge_pods(ctx: &Ctx, ts: &TypesenseCluster) -> Result<(), ReconcileError> {
    let ns = ts.namespace().unwrap_or_default();
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &ns);
    let lp = ListParams::default().labels(&format!("app={}", ts.sts_name()));

    for pod in pods.list(&lp).await? {
        let name = pod.name_any();
        info!(pod = %name, "deleting pod");
        match pods.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn build_statefulset(
    ctx: &Ctx,
    ts: &TypesenseCluster,
) -> Result<StatefulSet, ReconcileError> {
    let pod_spec = build_pod_spec(ts);

    let extra_config = match &ts.spec.additional_server_configuration {
        Some(config_ref) => {
            let ns = ts.namespace().unwrap_or_default();
            let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &ns);
            config_maps.get(&config_ref.name).await?.data
        }
        None => None,
    };
    let hash = pod_template_hash(&pod_spec, extra_config.as_ref())?;

    Ok(build_statefulset_object(ts, pod_spec, hash))
}

/// Stable hash over the pod spec plus the *contents* of the referenced server
/// configuration, so a data-only edit of that map still rolls the pods.
pub fn pod_template_hash(
    pod_spec: &PodSpec,
    extra_config: Option<&BTreeMap<String, String>>,
) -> Result<String, ReconcileError> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(pod_spec)?);
    let mut hash = hex::encode(hasher.finalize());

    if let Some(data) = extra_config.filter(|d| !d.is_empty()) {
        let mut extra_hasher = Sha256::new();
        extra_hasher.update(serde_json::to_vec(data)?);
        hash.push_str(&hex::encode(extra_hasher.finalize()));
    }
    Ok(hash)
}

fn build_statefulset_object(ts: &TypesenseCluster, pod_spec: PodSpec, hash: String) -> StatefulSet {
    let mut template_meta = ObjectMeta {
        labels: Some(ts.labels()),
        annotations: Some(BTreeMap::from([(HASH_ANNOTATION.to_string(), hash)])),
        ..Default::default()
    };
    template_meta.namespace = ts.namespace();

    StatefulSet {
        metadata: ts.object_meta(&ts.sts_name()),
        spec: Some(StatefulSetSpec {
            service_name: Some(ts.headless_service_name()),
            pod_management_policy: Some("Parallel".into()),
            replicas: Some(ts.spec.replicas),
            selector: LabelSelector {
                match_labels: Some(ts.labels()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(template_meta),
                spec: Some(pod_spec),
            },
            volume_claim_templates: Some(vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some("data".into()),
                    labels: Some(ts.labels()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".into()]),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from([(
                            "storage".to_string(),
                            Quantity(ts.spec.storage.size.clone()),
                        )])),
                        ..Default::default()
                    }),
                    storage_class_name: Some(ts.spec.storage.storage_class_name.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_pod_spec(ts: &TypesenseCluster) -> PodSpec {
    PodSpec {
        security_context: Some(PodSecurityContext {
            run_as_user: Some(10000),
            run_as_group: Some(3000),
            fs_group: Some(2000),
            run_as_non_root: Some(true),
            ..Default::default()
        }),
        termination_grace_period_seconds: Some(TERMINATION_GRACE_SECONDS),
        readiness_gates: Some(vec![PodReadinessGate {
            condition_type: READINESS_GATE_CONDITION.into(),
        }]),
        containers: vec![engine_container(ts), metrics_container(ts)],
        node_selector: ts.spec.node_selector.clone(),
        tolerations: ts.spec.tolerations.clone(),
        affinity: ts.spec.affinity.clone(),
        topology_spread_constraints: ts.spec.topology_spread_constraints.clone(),
        volumes: Some(vec![
            Volume {
                name: "nodeslist".into(),
                config_map: Some(ConfigMapVolumeSource {
                    name: ts.nodes_list_name(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

fn admin_key_env(ts: &TypesenseCluster) -> EnvVar {
    EnvVar {
        name: "TYPESENSE_API_KEY".into(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: ts.admin_key_secret_name(),
                key: ADMIN_API_KEY_SECRET_KEY.into(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn engine_container(ts: &TypesenseCluster) -> Container {
    let env = vec![
        admin_key_env(ts),
        EnvVar {
            name: "TYPESENSE_NODES".into(),
            value: Some(format!("{NODES_MOUNT_PATH}/nodes")),
            ..Default::default()
        },
        EnvVar {
            name: "TYPESENSE_DATA_DIR".into(),
            value: Some(DATA_MOUNT_PATH.into()),
            ..Default::default()
        },
        EnvVar {
            name: "TYPESENSE_API_PORT".into(),
            value: Some(ts.spec.api_port.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "TYPESENSE_PEERING_PORT".into(),
            value: Some(ts.spec.peering_port.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "TYPESENSE_PEERING_ADDRESS".into(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "status.podIP".into(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        EnvVar {
            name: "TYPESENSE_ENABLE_CORS".into(),
            value: Some(ts.spec.enable_cors.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "TYPESENSE_CORS_DOMAINS".into(),
            value: Some(ts.cors_domains()),
            ..Default::default()
        },
        EnvVar {
            name: "TYPESENSE_RESET_PEERS_ON_ERROR".into(),
            value: Some(ts.spec.reset_peers_on_error.to_string()),
            ..Default::default()
        },
    ];

    let env_from = ts.spec.additional_server_configuration.as_ref().map(|r| {
        vec![EnvFromSource {
            config_map_ref: Some(ConfigMapEnvSource {
                name: r.name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }]
    });

    Container {
        name: "typesense".into(),
        image: Some(ts.spec.image.clone()),
        image_pull_policy: Some("IfNotPresent".into()),
        ports: Some(vec![ContainerPort {
            name: Some("http".into()),
            container_port: ts.spec.api_port,
            ..Default::default()
        }]),
        env: Some(env),
        env_from,
        resources: ts.spec.resources.clone(),
        // No liveness probe: a node replaying its snapshot reports unhealthy
        // for a while, and restarting it would fight the quorum actuator.
        readiness_probe: Some(health_probe(ts, 5)),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "nodeslist".into(),
                mount_path: NODES_MOUNT_PATH.into(),
                ..Default::default()
            },
            VolumeMount {
                name: "data".into(),
                mount_path: DATA_MOUNT_PATH.into(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

fn health_probe(ts: &TypesenseCluster, initial_delay: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/health".into()),
            port: IntOrString::Int(ts.spec.api_port),
            scheme: Some("HTTP".into()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(5),
        timeout_seconds: Some(2),
        ..Default::default()
    }
}

fn metrics_container(ts: &TypesenseCluster) -> Container {
    let exporter = ts.metrics_exporter();
    Container {
        name: "metrics-exporter".into(),
        image: Some(exporter.image),
        image_pull_policy: Some("IfNotPresent".into()),
        ports: Some(vec![ContainerPort {
            name: Some("metrics".into()),
            container_port: METRICS_PORT,
            ..Default::default()
        }]),
        env: Some(vec![
            admin_key_env(ts),
            EnvVar {
                name: "LOG_LEVEL".into(),
                value: Some("0".into()),
                ..Default::default()
            },
            EnvVar {
                name: "TYPESENSE_PROTOCOL".into(),
                value: Some("http".into()),
                ..Default::default()
            },
            EnvVar {
                name: "TYPESENSE_HOST".into(),
                value: Some("localhost".into()),
                ..Default::default()
            },
            EnvVar {
                name: "TYPESENSE_PORT".into(),
                value: Some(ts.spec.api_port.to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "METRICS_PORT".into(),
                value: Some(METRICS_PORT.to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "TYPESENSE_CLUSTER".into(),
                value: Some(ts.name_any()),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests_statefulset {
    use super::*;

    fn cluster() -> TypesenseCluster {
        let mut ts = TypesenseCluster::new(
            "demo",
            serde_json::from_value(serde_json::json!({
                "image": "typesense/typesense:27.1",
                "storage": {"size": "100Mi", "storageClassName": "standard"}
            }))
            .expect("valid spec"),
        );
        ts.metadata.namespace = Some("ns".into());
        ts.metadata.uid = Some("uid-1".into());
        ts
    }

    fn env_value(container: &Container, name: &str) -> Option<String> {
        container
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)?
            .value
            .clone()
    }

    #[test]
    fn pod_spec_matches_engine_contract() {
        let ts = cluster();
        let pod_spec = build_pod_spec(&ts);

        assert_eq!(pod_spec.termination_grace_period_seconds, Some(5));
        assert_eq!(
            pod_spec.readiness_gates.as_ref().expect("gates")[0].condition_type,
            "RaftQuorumReady"
        );
        assert_eq!(
            pod_spec.security_context.as_ref().and_then(|s| s.run_as_non_root),
            Some(true)
        );

        let engine = &pod_spec.containers[0];
        assert_eq!(engine.name, "typesense");
        assert_eq!(
            env_value(engine, "TYPESENSE_NODES").as_deref(),
            Some("/usr/share/typesense/nodes")
        );
        assert_eq!(
            env_value(engine, "TYPESENSE_DATA_DIR").as_deref(),
            Some("/usr/share/typesense/data")
        );
        assert_eq!(env_value(engine, "TYPESENSE_API_PORT").as_deref(), Some("8108"));
        assert_eq!(env_value(engine, "TYPESENSE_PEERING_PORT").as_deref(), Some("8107"));
        assert_eq!(env_value(engine, "TYPESENSE_ENABLE_CORS").as_deref(), Some("false"));
        assert_eq!(
            env_value(engine, "TYPESENSE_RESET_PEERS_ON_ERROR").as_deref(),
            Some("true")
        );

        let metrics = &pod_spec.containers[1];
        assert_eq!(metrics.name, "metrics-exporter");
        assert_eq!(
            metrics.ports.as_ref().expect("ports")[0].container_port,
            9100
        );
    }

    #[test]
    fn statefulset_declares_storage_and_selector() {
        let ts = cluster();
        let sts = build_statefulset_object(&ts, build_pod_spec(&ts), "abc".into());
        let spec = sts.spec.expect("spec");

        assert_eq!(spec.service_name.as_deref(), Some("demo-sts-svc"));
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.pod_management_policy.as_deref(), Some("Parallel"));

        let pvc = &spec.volume_claim_templates.expect("pvc templates")[0];
        let pvc_spec = pvc.spec.as_ref().expect("pvc spec");
        assert_eq!(pvc_spec.storage_class_name.as_deref(), Some("standard"));
        assert_eq!(
            pvc_spec
                .resources
                .as_ref()
                .and_then(|r| r.requests.as_ref())
                .and_then(|r| r.get("storage")),
            Some(&Quantity("100Mi".into()))
        );
    }

    #[test]
    fn hash_is_pure_over_its_inputs() {
        let ts = cluster();
        let pod_spec = build_pod_spec(&ts);

        let first = pod_template_hash(&pod_spec, None).expect("hash");
        let second = pod_template_hash(&pod_spec, None).expect("hash");
        assert_eq!(first, second);

        let mut other = cluster();
        other.spec.api_port = 9108;
        let changed = pod_template_hash(&build_pod_spec(&other), None).expect("hash");
        assert_ne!(first, changed);
    }

    #[test]
    fn hash_folds_in_referenced_configuration_contents() {
        let ts = cluster();
        let pod_spec = build_pod_spec(&ts);

        let config_a = BTreeMap::from([("healthy-write-lag".to_string(), "500".to_string())]);
        let config_b = BTreeMap::from([("healthy-write-lag".to_string(), "800".to_string())]);

        let bare = pod_template_hash(&pod_spec, None).expect("hash");
        let with_a = pod_template_hash(&pod_spec, Some(&config_a)).expect("hash");
        let with_b = pod_template_hash(&pod_spec, Some(&config_b)).expect("hash");

        assert_ne!(bare, with_a);
        assert_ne!(with_a, with_b);
        assert_eq!(
            with_a,
            pod_template_hash(&pod_spec, Some(&config_a)).expect("hash")
        );
        // An empty map hashes like no map at all.
        assert_eq!(bare, pod_template_hash(&pod_spec, Some(&BTreeMap::new())).expect("hash"));
    }

    #[test]
    fn update_rule_honors_quorum_managed_replicas() {
        let ts = cluster();
        let desired = build_statefulset_object(&ts, build_pod_spec(&ts), "h1".into());

        // Downgraded cluster at one replica: replica drift alone must not
        // trigger an update.
        let mut downgraded = desired.clone();
        if let Some(spec) = downgraded.spec.as_mut() {
            spec.replicas = Some(1);
        }
        assert!(!should_update(&downgraded, &desired, &ts, "QuorumDowngraded"));
        assert!(!should_update(&downgraded, &desired, &ts, "QuorumQueuedWrites"));
        assert!(should_update(&downgraded, &desired, &ts, "QuorumReady"));

        // Hash drift updates regardless of replica state.
        let rehashed = build_statefulset_object(&ts, build_pod_spec(&ts), "h2".into());
        assert!(should_update(&desired, &rehashed, &ts, "QuorumReady"));

        // Nothing drifted: no write.
        assert!(!should_update(&desired, &desired.clone(), &ts, "QuorumReady"));
    }

    #[test]
    fn skip_list_blocks_transient_states() {
        for reason in [
            "QuorumDowngraded",
            "QuorumUpgraded",
            "QuorumNeedsAttentionMemoryOrDiskIssue",
            "QuorumNotReady",
            "StatefulSetNotReady",
            "ReconciliationInProgress",
            "QuorumNotReadyWaitATerm",
        ] {
            assert!(in_skip_list(reason), "{reason} must skip");
        }
        assert!(!in_skip_list("QuorumReady"));
        assert!(!in_skip_list("QuorumNeedsAttentionClusterIsLagging"));
    }
}
