//! HTTP server wiring

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use cilikube_cluster::ClusterRegistry;
use cilikube_common::{Error, Result};

use crate::{gateway, handlers, streaming};

/// Prefix of every API route
pub const API_PREFIX: &str = "/api/v1";

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server
    pub addr: SocketAddr,
}

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Live cluster clients and the active selection
    pub registry: ClusterRegistry,
}

/// Full router with state applied
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .merge(handlers::routes())
        .merge(gateway::routes())
        .merge(streaming::routes());

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .nest(API_PREFIX, api)
        .with_state(state)
}

/// Serve until `shutdown` is cancelled, then drain in-flight requests
pub async fn start_server(
    config: ServerConfig,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(config.addr)
        .await
        .map_err(|e| Error::Config(format!("failed to bind {}: {}", config.addr, e)))?;

    info!(addr = %config.addr, "starting API server");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::internal(format!("server error: {}", e)))?;

    info!("API server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use http::Response;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use tower_test::mock::Handle;

    use cilikube_cluster::{
        BuiltClient, ClientFactory, ClusterClient, KubeconfigSource, MemoryClusterStore,
        NewCluster, ProbeOutcome, RegistrySettings,
    };

    use super::*;
    use crate::gateway::{CLUSTER_KINDS, NAMESPACED_KINDS};

    type KubeHandle = Handle<Request<kube::client::Body>, Response<kube::client::Body>>;

    struct StubFactory {
        client: Arc<ClusterClient>,
    }

    #[async_trait]
    impl ClientFactory for StubFactory {
        async fn build(&self, _source: &KubeconfigSource) -> Result<BuiltClient> {
            Ok(BuiltClient {
                client: self.client.clone(),
                probe: ProbeOutcome::Available {
                    version: "v1.32.0".into(),
                },
            })
        }

        async fn probe(&self, _client: &ClusterClient) -> ProbeOutcome {
            ProbeOutcome::Available {
                version: "v1.32.0".into(),
            }
        }
    }

    fn empty_state() -> (AppState, KubeHandle) {
        let (service, handle) =
            tower_test::mock::pair::<Request<kube::client::Body>, Response<kube::client::Body>>();
        let client = kube::Client::new(service, "default");
        let config = kube::Config::new("https://cluster.test:6443".parse().unwrap());
        let factory = StubFactory {
            client: Arc::new(ClusterClient::new(client, config, false)),
        };
        let registry = ClusterRegistry::new(
            Arc::new(MemoryClusterStore::new()),
            Arc::new(factory),
            RegistrySettings::default(),
        );
        (AppState { registry }, handle)
    }

    /// State with one active cluster named `lab`; returns its id
    async fn state_with_cluster() -> (AppState, KubeHandle, String) {
        let (state, handle) = empty_state();
        let status = state
            .registry
            .add(NewCluster {
                name: "lab".into(),
                kubeconfig: b"apiVersion: v1".to_vec(),
                ..NewCluster::default()
            })
            .await
            .unwrap();
        (state, handle, status.id)
    }

    async fn call(router: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn kube_response(status: u16, body: Value) -> Response<kube::client::Body> {
        Response::builder()
            .status(status)
            .body(kube::client::Body::from(body.to_string().into_bytes()))
            .unwrap()
    }

    fn not_found(name: &str) -> Value {
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": format!("pods \"{}\" not found", name),
            "reason": "NotFound",
            "code": 404
        })
    }

    #[tokio::test]
    async fn healthz() {
        let (state, _handle) = empty_state();
        let response = build_router(state).oneshot(get("/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cluster_lifecycle() {
        let (state, _handle) = empty_state();
        let router = build_router(state);

        let (status, body) = call(router.clone(), get("/api/v1/clusters/active")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 404);

        let (status, body) = call(
            router.clone(),
            json_request(
                "POST",
                "/api/v1/clusters",
                json!({"name": "lab", "kubeconfigData": STANDARD.encode("apiVersion: v1"), "environment": "dev"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["data"]["id"].as_str().unwrap().to_string();
        assert_eq!(body["data"]["environment"], "dev");

        let (status, _) = call(
            router.clone(),
            json_request(
                "POST",
                "/api/v1/clusters",
                json!({"name": "lab", "kubeconfigData": STANDARD.encode("apiVersion: v1")}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(
            router.clone(),
            json_request(
                "POST",
                "/api/v1/clusters",
                json!({"name": "other", "kubeconfigData": "%%%"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            router.clone(),
            json_request("POST", "/api/v1/clusters/active", json!({"name": "lab"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["id"], id.as_str());

        let (status, body) = call(router.clone(), get(&format!("/api/v1/clusters/{}", id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["name"], "lab");
        assert!(body["data"].get("kubeconfig").is_none());

        let (status, body) = call(router.clone(), get("/api/v1/clusters")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let delete = Request::builder()
            .method("DELETE")
            .uri(format!("/api/v1/clusters/{}", id))
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(router.clone(), delete).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(router, get("/api/v1/clusters/active")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn switch_active_requires_a_key() {
        let (state, _handle, _id) = state_with_cluster().await;
        let (status, _) = call(
            build_router(state),
            json_request("POST", "/api/v1/clusters/active", json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn requests_without_a_cluster_are_rejected() {
        let (state, _handle) = empty_state();
        let router = build_router(state);

        let (status, body) = call(router.clone(), get("/api/v1/nodes")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 400);

        let (status, _) = call(router, get("/api/v1/nodes?clusterId=missing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn lists_pods_from_the_active_cluster() {
        let (state, mut handle, _id) = state_with_cluster().await;

        let upstream = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::GET);
            assert_eq!(request.uri().path(), "/api/v1/namespaces/default/pods");
            assert!(request.uri().query().unwrap_or_default().contains("limit=2"));
            send.send_response(kube_response(
                200,
                json!({
                    "apiVersion": "v1",
                    "kind": "PodList",
                    "metadata": {"resourceVersion": "42", "continue": "next-page"},
                    "items": [{"metadata": {"name": "web", "namespace": "default"}}]
                }),
            ));
        });

        let (status, body) = call(
            build_router(state),
            get("/api/v1/namespaces/default/pods?limit=2"),
        )
        .await;
        upstream.await.unwrap();

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["items"][0]["metadata"]["name"], "web");
        assert_eq!(body["data"]["continue"], "next-page");
        assert_eq!(body["data"]["resourceVersion"], "42");
    }

    #[tokio::test]
    async fn upstream_not_found_passes_through_with_cluster() {
        let (state, mut handle, id) = state_with_cluster().await;

        let upstream = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.uri().path(), "/api/v1/namespaces/default/pods/ghost");
            send.send_response(kube_response(404, not_found("ghost")));
        });

        let (status, body) = call(
            build_router(state),
            get(&format!("/api/v1/namespaces/default/pods/ghost?clusterId={}", id)),
        )
        .await;
        upstream.await.unwrap();

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["details"]["cluster"], id.as_str());
    }

    #[tokio::test]
    async fn invalid_names_never_reach_the_cluster() {
        let (state, _handle, _id) = state_with_cluster().await;
        let (status, _) = call(
            build_router(state),
            get("/api/v1/namespaces/Not_Valid/pods"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn patch_merges_at_the_fetched_version() {
        let (state, mut handle, _id) = state_with_cluster().await;

        let upstream = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("get not called");
            assert_eq!(request.method(), http::Method::GET);
            send.send_response(kube_response(
                200,
                json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {
                        "name": "settings",
                        "namespace": "default",
                        "resourceVersion": "5",
                        "labels": {"app": "web", "tier": "front"}
                    },
                    "data": {"mode": "dev"}
                }),
            ));

            let (request, send) = handle.next_request().await.expect("replace not called");
            assert_eq!(request.method(), http::Method::PUT);
            assert_eq!(request.uri().path(), "/api/v1/namespaces/default/configmaps/settings");
            let bytes = axum::body::to_bytes(Body::new(request.into_body()), usize::MAX)
                .await
                .unwrap();
            let sent: Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(sent["metadata"]["resourceVersion"], "5");
            assert_eq!(sent["metadata"]["labels"], json!({"app": "web"}));
            assert_eq!(sent["data"], json!({"mode": "prod"}));
            send.send_response(kube_response(200, sent));
        });

        let (status, body) = call(
            build_router(state),
            json_request(
                "PATCH",
                "/api/v1/namespaces/default/configmaps/settings",
                json!({"metadata": {"labels": {"tier": null}}, "data": {"mode": "prod"}}),
            ),
        )
        .await;
        upstream.await.unwrap();

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["data"]["mode"], "prod");
    }

    #[tokio::test]
    async fn watch_streams_ndjson() {
        let (state, mut handle, _id) = state_with_cluster().await;

        let upstream = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            let query = request.uri().query().unwrap_or_default().to_string();
            assert!(query.contains("watch=true"), "{}", query);
            assert!(query.contains("timeoutSeconds=290"), "{}", query);
            let events = [
                json!({"type": "ADDED", "object": {"apiVersion": "v1", "kind": "Node", "metadata": {"name": "n1", "resourceVersion": "7"}}}),
                json!({"type": "ERROR", "object": {"kind": "Status", "apiVersion": "v1", "status": "Failure", "message": "too old resource version", "reason": "Gone", "code": 410}}),
            ];
            let body: String = events.iter().map(|e| format!("{}\n", e)).collect();
            send.send_response(
                Response::builder()
                    .body(kube::client::Body::from(body.into_bytes()))
                    .unwrap(),
            );
        });

        let response = build_router(state)
            .oneshot(get("/api/v1/nodes?watch=true&timeoutSeconds=900"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            crate::gateway::watch::NDJSON
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        upstream.await.unwrap();

        let frames: Vec<Value> = bytes
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_slice(line).unwrap())
            .collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["type"], "ADDED");
        assert_eq!(frames[0]["object"]["metadata"]["name"], "n1");
        assert_eq!(frames[1]["type"], "ERROR");
        assert_eq!(frames[1]["object"]["reason"], "Expired");
    }

    #[tokio::test]
    async fn proxy_strips_credentials_and_passes_status_through() {
        let (state, mut handle, id) = state_with_cluster().await;

        let upstream = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.uri().path(), "/api/v1/namespaces");
            assert_eq!(request.uri().query(), Some("limit=1"));
            assert!(request.headers().get("authorization").is_none());
            assert!(request.headers().get("impersonate-user").is_none());
            assert_eq!(request.headers()["accept"], "application/json");
            send.send_response(kube_response(
                403,
                json!({"kind": "Status", "code": 403, "reason": "Forbidden"}),
            ));
        });

        let request = Request::builder()
            .uri(format!(
                "/api/v1/proxy/api/v1/namespaces?clusterId={}&limit=1",
                id
            ))
            .header("authorization", "Bearer user-token")
            .header("impersonate-user", "admin")
            .header("accept", "application/json")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(build_router(state), request).await;
        upstream.await.unwrap();

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["reason"], "Forbidden");
    }

    #[tokio::test]
    async fn proxy_by_cluster_path() {
        let (state, mut handle, id) = state_with_cluster().await;

        let upstream = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.uri().path(), "/version");
            send.send_response(kube_response(200, json!({"gitVersion": "v1.32.0"})));
        });

        let (status, body) = call(
            build_router(state),
            get(&format!("/api/v1/clusters/{}/proxy/version", id)),
        )
        .await;
        upstream.await.unwrap();

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["gitVersion"], "v1.32.0");
    }

    #[tokio::test]
    async fn every_kind_has_a_list_route() {
        let (state, _handle) = empty_state();
        let router = build_router(state);
        for plural in NAMESPACED_KINDS.iter().chain(CLUSTER_KINDS) {
            // no cluster selected: the route exists and rejects with 400, not 404
            let (status, _) = call(router.clone(), get(&format!("/api/v1/{}", plural))).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", plural);
        }
    }
}
