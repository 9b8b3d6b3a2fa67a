use std::net::IpAddr;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use tracing::debug;

use crate::{
    crds::cluster::{TypesenseCluster, ADMIN_API_KEY_SECRET_KEY},
    error::ReconcileError,
    quorum::types::{NodeEndpoint, NodeHealth, NodeStatus},
};

/// Per-request wall-clock deadline. Kept short on purpose: longer timeouts
/// mask split-brain, and the prober never retries within a cycle.
pub const PROBE_DEADLINE: Duration = Duration::from_millis(500);

const API_KEY_HEADER: &str = "x-typesense-api-key";

/// Stateless per-tick prober for the engine's `/status` and `/health`
/// endpoints. Engine-side failures are absorbed into the returned node state
/// and never fail the reconciliation.
pub struct NodeProbe {
    http: reqwest::Client,
    api_key: String,
    namespace: String,
}

impl NodeProbe {
    pub fn new(namespace: &str, api_key: String) -> Result<Self, ReconcileError> {
        let http = reqwest::Client::builder()
            .timeout(PROBE_DEADLINE)
            .build()
            .map_err(anyhow::Error::from)?;
        Ok(NodeProbe {
            http,
            api_key,
            namespace: namespace.to_string(),
        })
    }

    pub fn from_secret(ts: &TypesenseCluster, secret: &Secret) -> Result<Self, ReconcileError> {
        // A just-created secret still carries stringData only.
        let from_data = secret
            .data
            .as_ref()
            .and_then(|data| data.get(ADMIN_API_KEY_SECRET_KEY))
            .map(|bytes| String::from_utf8(bytes.0.clone()))
            .transpose()?;
        let api_key = match from_data {
            Some(key) => key,
            None => secret
                .string_data
                .as_ref()
                .and_then(|data| data.get(ADMIN_API_KEY_SECRET_KEY))
                .cloned()
                .ok_or_else(|| {
                    anyhow::anyhow!("admin api key secret has no {ADMIN_API_KEY_SECRET_KEY} entry")
                })?,
        };
        Self::new(
            &kube::ResourceExt::namespace(ts).unwrap_or_default(),
            api_key,
        )
    }

    /// Bare pod IPs are used as-is; ordinal DNS names resolve through the
    /// headless service, which needs the namespace-qualified form outside the
    /// cluster's own namespace.
    fn node_url(&self, endpoint: &NodeEndpoint, path: &str) -> String {
        if endpoint.host.parse::<IpAddr>().is_ok() {
            format!("http://{}:{}{}", endpoint.host, endpoint.api_port, path)
        } else {
            format!(
                "http://{}.{}.svc.cluster.local:{}{}",
                endpoint.host, self.namespace, endpoint.api_port, path
            )
        }
    }

    pub async fn status(&self, endpoint: &NodeEndpoint) -> NodeStatus {
        let url = self.node_url(endpoint, "/status");
        let response = match self
            .http
            .get(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => {
                debug!(node = %endpoint.host, %error, "status request failed");
                return NodeStatus::unreachable();
            }
        };

        if !response.status().is_success() {
            debug!(node = %endpoint.host, code = %response.status(), "status returned non-200");
            return NodeStatus::error();
        }

        match response.json::<NodeStatus>().await {
            Ok(status) => status,
            Err(error) => {
                debug!(node = %endpoint.host, %error, "decoding status failed");
                NodeStatus::error()
            }
        }
    }

    pub async fn health(&self, endpoint: &NodeEndpoint) -> NodeHealth {
        let url = self.node_url(endpoint, "/health");
        let response = match self.http.get(&url).send().await {
            Ok(response) => response,
            Err(error) => {
                debug!(node = %endpoint.host, %error, "health request failed");
                return NodeHealth::not_ok();
            }
        };

        if !response.status().is_success() {
            debug!(node = %endpoint.host, code = %response.status(), "health returned non-200");
            return NodeHealth::not_ok();
        }

        match response.json::<NodeHealth>().await {
            Ok(health) => health,
            Err(error) => {
                debug!(node = %endpoint.host, %error, "decoding health failed");
                NodeHealth::not_ok()
            }
        }
    }
}

#[cfg(test)]
mod tests_probe {
    use super::*;
    use crate::quorum::types::{NodeResourceError, NodeState};
    use axum::http::{header::CONTENT_TYPE, HeaderMap, StatusCode};
    use axum::{routing::get, Router};
    use std::net::SocketAddr;
    use tokio::task::JoinHandle;

    async fn serve(app: Router) -> (NodeEndpoint, JoinHandle<()>) {
        let addr: SocketAddr = "127.0.0.1:0".parse().expect("addr");
        let listener = tokio::net::TcpListener::bind(addr).await.expect("bind");
        let local = listener.local_addr().expect("local addr");
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        let endpoint = NodeEndpoint {
            host: local.ip().to_string(),
            peering_port: 8107,
            api_port: local.port() as i32,
        };
        (endpoint, server)
    }

    fn probe() -> NodeProbe {
        NodeProbe::new("ns", "secret-key".into()).expect("probe")
    }

    #[tokio::test]
    async fn status_decodes_leader_and_sends_api_key() {
        let app = Router::new().route(
            "/status",
            get(|headers: HeaderMap| async move {
                assert_eq!(
                    headers.get("x-typesense-api-key").map(|v| v.as_bytes()),
                    Some(b"secret-key".as_ref())
                );
                (
                    StatusCode::OK,
                    [(CONTENT_TYPE, "application/json")],
                    r#"{"committed_index": 10, "queued_writes": 0, "state": "LEADER"}"#,
                )
            }),
        );
        let (endpoint, server) = serve(app).await;

        let status = probe().status(&endpoint).await;
        assert_eq!(status.state, NodeState::Leader);
        assert_eq!(status.committed_index, 10);
        server.abort();
    }

    #[tokio::test]
    async fn unreachable_node_maps_to_unreachable() {
        let (endpoint, server) = serve(Router::new()).await;
        // Kill the server so the port refuses connections.
        server.abort();
        let _ = server.await;

        let status = probe().status(&endpoint).await;
        assert_eq!(status.state, NodeState::Unreachable);
        let health = probe().health(&endpoint).await;
        assert!(!health.ok);
    }

    #[tokio::test]
    async fn deadline_exceeded_maps_to_unreachable() {
        let app = Router::new().route(
            "/status",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                r#"{"state": "LEADER"}"#
            }),
        );
        let (endpoint, server) = serve(app).await;

        let status = probe().status(&endpoint).await;
        assert_eq!(status.state, NodeState::Unreachable);
        server.abort();
    }

    #[tokio::test]
    async fn non_200_maps_to_error() {
        let app = Router::new().route(
            "/status",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "busy") }),
        );
        let (endpoint, server) = serve(app).await;

        let status = probe().status(&endpoint).await;
        assert_eq!(status.state, NodeState::Error);
        server.abort();
    }

    #[tokio::test]
    async fn undecodable_body_maps_to_error() {
        let app = Router::new().route(
            "/status",
            get(|| async {
                (
                    StatusCode::OK,
                    [(CONTENT_TYPE, "application/json")],
                    "not json",
                )
            }),
        );
        let (endpoint, server) = serve(app).await;

        let status = probe().status(&endpoint).await;
        assert_eq!(status.state, NodeState::Error);
        server.abort();
    }

    #[tokio::test]
    async fn health_reports_resource_error() {
        let app = Router::new().route(
            "/health",
            get(|| async {
                (
                    StatusCode::OK,
                    [(CONTENT_TYPE, "application/json")],
                    r#"{"ok": false, "resource_error": "OUT_OF_DISK"}"#,
                )
            }),
        );
        let (endpoint, server) = serve(app).await;

        let health = probe().health(&endpoint).await;
        assert!(!health.ok);
        assert_eq!(health.resource_error, Some(NodeResourceError::OutOfDisk));
        server.abort();
    }
}
