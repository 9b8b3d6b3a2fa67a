use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Affinity, ResourceRequirements, Toleration, TopologySpreadConstraint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, ObjectMeta, OwnerReference};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const ADMIN_API_KEY_SECRET_KEY: &str = "typesense-api-key";

/// A highly-available Typesense cluster. The operator materializes the
/// dependent objects (admin key secret, nodes list, services, statefulset,
/// optional reverse proxy / scrapers / pod monitor) and then keeps the Raft
/// quorum healthy.
#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, JsonSchema)]
#[kube(
    group = "ts.opentelekomcloud.com",
    version = "v1alpha1",
    kind = "TypesenseCluster",
    plural = "typesenseclusters",
    namespaced,
    status = "TypesenseClusterStatus",
    shortname = "tsc",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TypesenseClusterSpec {
    pub image: String,

    /// Quorum size. Even sizes cannot win elections, hence the enumeration.
    #[serde(default = "default_replicas")]
    #[schemars(schema_with = "replicas_schema")]
    pub replicas: i32,

    #[serde(default = "default_api_port")]
    #[schemars(range(min = 1025, max = 65535))]
    pub api_port: i32,

    #[serde(default = "default_peering_port")]
    #[schemars(range(min = 1025, max = 65535))]
    pub peering_port: i32,

    #[serde(default = "default_true")]
    pub reset_peers_on_error: bool,

    #[serde(default)]
    pub enable_cors: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cors_domains: Option<String>,

    pub storage: StorageSpec,

    /// Pre-existing secret holding the admin key; the operator mints one
    /// when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_api_key: Option<ObjectRef>,

    /// Config map with extra server tunables, injected via `envFrom` and
    /// folded into the pod-template hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_server_configuration: Option<ObjectRef>,

    /// Grow a recovered quorum one step at a time instead of jumping
    /// straight to the declared size.
    #[serde(default)]
    pub incremental_quorum_recovery: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scrapers: Option<Vec<DocSearchScraperSpec>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsExporterSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology_spread_constraints: Option<Vec<TopologySpreadConstraint>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Volume size per node, e.g. "100Mi"
    #[serde(default = "default_storage_size")]
    pub size: String,
    pub storage_class_name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct ObjectRef {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    #[schemars(regex(
        pattern = r"^(([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]*[a-zA-Z0-9])\.)*([A-Za-z0-9]|[A-Za-z0-9][A-Za-z0-9\-]*[A-Za-z0-9])$"
    ))]
    pub host: String,

    pub ingress_class_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_issuer: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,

    /// Extra annotations copied onto the ingress object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    /// Restrict access to requests carrying one of these referers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,

    #[serde(default = "default_reverse_proxy_image")]
    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_directives: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_directives: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_directives: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocSearchScraperSpec {
    pub name: String,
    pub image: String,
    /// Scraper configuration passed verbatim via the CONFIG env var.
    pub config: String,
    #[schemars(regex(
        pattern = r"^(@(annually|yearly|monthly|weekly|daily|hourly|midnight))|(((\*|[0-9,\-\*/]+) ){4}(\*|[0-9,\-\*/]+))$"
    ))]
    pub schedule: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricsExporterSpec {
    #[serde(default = "default_metrics_exporter_image")]
    pub image: String,
    /// Scrape interval for the pod monitor.
    #[serde(default = "default_metrics_interval")]
    pub interval: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TypesenseClusterStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
}

fn default_replicas() -> i32 {
    3
}
fn default_api_port() -> i32 {
    8108
}
fn default_peering_port() -> i32 {
    8107
}
fn default_true() -> bool {
    true
}
fn default_storage_size() -> String {
    "100Mi".into()
}
fn default_reverse_proxy_image() -> String {
    "nginx:1.27-alpine".into()
}
fn default_metrics_exporter_image() -> String {
    "akyriako78/typesense-prometheus-exporter:0.1.7".into()
}
fn default_metrics_interval() -> String {
    "15s".into()
}

fn replicas_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    let mut schema = schemars::schema::SchemaObject::default();
    schema.instance_type = Some(schemars::schema::InstanceType::Integer.into());
    schema.enum_values = Some(vec![1.into(), 3.into(), 5.into(), 7.into()]);
    schemars::schema::Schema::Object(schema)
}

impl TypesenseCluster {
    pub fn admin_key_secret_name(&self) -> String {
        match &self.spec.admin_api_key {
            Some(secret_ref) => secret_ref.name.clone(),
            None => format!("{}-admin-key", self.name_any()),
        }
    }

    pub fn nodes_list_name(&self) -> String {
        format!("{}-nodeslist", self.name_any())
    }

    pub fn sts_name(&self) -> String {
        format!("{}-sts", self.name_any())
    }

    pub fn headless_service_name(&self) -> String {
        format!("{}-sts-svc", self.name_any())
    }

    pub fn rest_service_name(&self) -> String {
        format!("{}-svc", self.name_any())
    }

    pub fn reverse_proxy_name(&self) -> String {
        format!("{}-reverse-proxy", self.name_any())
    }

    pub fn reverse_proxy_config_name(&self) -> String {
        format!("{}-reverse-proxy-config", self.name_any())
    }

    pub fn reverse_proxy_service_name(&self) -> String {
        format!("{}-reverse-proxy-svc", self.name_any())
    }

    pub fn pod_monitor_name(&self) -> String {
        format!("{}-podmonitor", self.name_any())
    }

    /// Name of the pod at the given statefulset ordinal.
    pub fn pod_name(&self, ordinal: i32) -> String {
        format!("{}-sts-{}", self.name_any(), ordinal)
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("app".to_string(), self.sts_name())])
    }

    pub fn reverse_proxy_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("app".to_string(), format!("{}-rp", self.name_any()))])
    }

    pub fn object_meta(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: self.namespace(),
            labels: Some(self.labels()),
            owner_references: Some(vec![self.owner_ref()]),
            ..Default::default()
        }
    }

    pub fn owner_ref(&self) -> OwnerReference {
        OwnerReference {
            api_version: "ts.opentelekomcloud.com/v1alpha1".into(),
            kind: "TypesenseCluster".into(),
            name: self.metadata.name.clone().unwrap_or_default(),
            uid: self.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    pub fn cors_domains(&self) -> String {
        match &self.spec.cors_domains {
            Some(domains) if !domains.trim().is_empty() => domains.clone(),
            _ => String::new(),
        }
    }

    pub fn metrics_exporter(&self) -> MetricsExporterSpec {
        self.spec.metrics.clone().unwrap_or(MetricsExporterSpec {
            image: default_metrics_exporter_image(),
            interval: default_metrics_interval(),
        })
    }
}

#[cfg(test)]
mod tests_cluster_crd {
    use super::*;
    use kube::core::CustomResourceExt;

    fn cluster(name: &str) -> TypesenseCluster {
        let mut ts = TypesenseCluster::new(
            name,
            serde_json::from_value(serde_json::json!({
                "image": "typesense/typesense:27.1",
                "storage": {"storageClassName": "standard"}
            }))
            .expect("valid spec"),
        );
        ts.metadata.namespace = Some("search".into());
        ts
    }

    #[test]
    fn spec_defaults_apply() {
        let ts = cluster("demo");
        assert_eq!(ts.spec.replicas, 3);
        assert_eq!(ts.spec.api_port, 8108);
        assert_eq!(ts.spec.peering_port, 8107);
        assert!(ts.spec.reset_peers_on_error);
        assert!(!ts.spec.enable_cors);
        assert!(!ts.spec.incremental_quorum_recovery);
        assert_eq!(ts.spec.storage.size, "100Mi");
    }

    #[test]
    fn derived_object_names() {
        let ts = cluster("demo");
        assert_eq!(ts.admin_key_secret_name(), "demo-admin-key");
        assert_eq!(ts.nodes_list_name(), "demo-nodeslist");
        assert_eq!(ts.sts_name(), "demo-sts");
        assert_eq!(ts.headless_service_name(), "demo-sts-svc");
        assert_eq!(ts.rest_service_name(), "demo-svc");
        assert_eq!(ts.pod_name(2), "demo-sts-2");
    }

    #[test]
    fn admin_key_reference_overrides_generated_name() {
        let mut ts = cluster("demo");
        ts.spec.admin_api_key = Some(ObjectRef {
            name: "byo-admin-key".into(),
        });
        assert_eq!(ts.admin_key_secret_name(), "byo-admin-key");
    }

    #[test]
    fn replicas_schema_is_the_allowed_enumeration() {
        let crd = TypesenseCluster::crd();
        let schema = serde_json::to_value(&crd).expect("serializable crd");
        let replicas = &schema["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]
            ["spec"]["properties"]["replicas"];
        assert_eq!(replicas["enum"], serde_json::json!([1, 3, 5, 7]));
    }
}
