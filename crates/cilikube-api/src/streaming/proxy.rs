//! Transparent API proxy through a cluster's own transport
//!
//! The client's credentials never reach the cluster: `Authorization` and
//! impersonation headers are dropped and the cluster client adds its own.
//! Protocol upgrades (SPDY, WebSocket) are bridged byte for byte.

use std::collections::HashMap;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::header::{self, HeaderMap, HeaderName};
use axum::http::{StatusCode, Uri};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};

use cilikube_cluster::{ClusterSelector, ResolvedCluster};
use cilikube_common::{Error, Result, UpstreamKind};

use super::websocket::has_connection_upgrade;
use crate::error::ApiError;
use crate::extract::TargetCluster;
use crate::server::AppState;

/// Maximum request body forwarded (10 MB)
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Query keys consumed by cluster selection
const SELECTION_KEYS: &[&str] = &["clusterId", "clusterName"];

/// Impersonation header names; `Impersonate-Extra-*` is matched by prefix
const IMPERSONATION_HEADERS: &[&str] = &["impersonate-user", "impersonate-group", "impersonate-uid"];

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers an upgrade must carry through
const UPGRADE_HEADERS: &[&str] = &["connection", "upgrade"];

fn is_impersonation(name: &HeaderName) -> bool {
    let name = name.as_str();
    IMPERSONATION_HEADERS.contains(&name) || name.starts_with("impersonate-extra-")
}

/// Whether `name` is forwarded to the cluster
fn forward_request_header(name: &HeaderName, upgrade: bool) -> bool {
    if name == header::HOST
        || name == header::AUTHORIZATION
        || name == header::CONTENT_LENGTH
        || is_impersonation(name)
    {
        return false;
    }
    if upgrade && UPGRADE_HEADERS.contains(&name.as_str()) {
        return true;
    }
    !HOP_BY_HOP.contains(&name.as_str())
}

/// Whether `name` is returned to the client
fn forward_response_header(name: &HeaderName, switching: bool) -> bool {
    if switching && UPGRADE_HEADERS.contains(&name.as_str()) {
        return true;
    }
    !HOP_BY_HOP.contains(&name.as_str())
}

/// Query string without the cluster selection keys, otherwise verbatim
fn strip_selection(query: Option<&str>) -> Option<String> {
    let kept: Vec<&str> = query?
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or_default();
            !SELECTION_KEYS.contains(&key)
        })
        .collect();
    (!kept.is_empty()).then(|| kept.join("&"))
}

fn upstream_uri(path: &str, query: Option<&str>) -> Result<Uri> {
    let path = path.trim_start_matches('/');
    let uri = match strip_selection(query) {
        Some(query) => format!("/{}?{}", path, query),
        None => format!("/{}", path),
    };
    uri.parse()
        .map_err(|e| Error::validation(format!("invalid proxy path {}: {}", uri, e)))
}

fn copy_headers(from: &HeaderMap, to: &mut HeaderMap, keep: impl Fn(&HeaderName) -> bool) {
    for (name, value) in from {
        if keep(name) {
            to.append(name.clone(), value.clone());
        }
    }
}

/// Buffer a request body, refusing anything over [`MAX_BODY_SIZE`]
async fn read_body(body: Body) -> Result<Bytes> {
    let mut stream = body.into_data_stream();
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk
            .map_err(|e| Error::validation(format!("failed to read request body: {}", e)))?;
        if buf.len() + chunk.len() > MAX_BODY_SIZE {
            return Err(Error::PayloadTooLarge(format!(
                "request body exceeds {} bytes",
                MAX_BODY_SIZE
            )));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Forward `request` to `cluster` at `path`
async fn forward(cluster: ResolvedCluster, path: &str, mut request: Request) -> Result<Response> {
    let upgrade = has_connection_upgrade(request.headers());
    let incoming_upgrade = upgrade.then(|| hyper::upgrade::on(&mut request));

    let uri = upstream_uri(path, request.uri().query())?;
    let (parts, body) = request.into_parts();
    let body = read_body(body).await?;

    let mut builder = http::Request::builder().method(parts.method.clone()).uri(&uri);
    if let Some(headers) = builder.headers_mut() {
        copy_headers(&parts.headers, headers, |name| {
            forward_request_header(name, upgrade)
        });
    }
    let upstream_request = builder
        .body(kube::client::Body::from(body.to_vec()))
        .map_err(|e| Error::internal(e.to_string()))?;

    debug!(
        cluster = %cluster.id,
        method = %parts.method,
        uri = %uri,
        upgrade,
        "proxying request"
    );

    let mut upstream = cluster
        .client
        .client()
        .send(upstream_request)
        .await
        .map_err(|e| Error::Upstream {
            cluster: cluster.id.clone(),
            kind: UpstreamKind::Other,
            message: e.to_string(),
        })?;

    let status = upstream.status();
    let switching = status == StatusCode::SWITCHING_PROTOCOLS;

    let mut response = Response::builder().status(status);
    if let Some(headers) = response.headers_mut() {
        copy_headers(upstream.headers(), headers, |name| {
            forward_response_header(name, switching)
        });
    }

    if switching {
        let Some(incoming_upgrade) = incoming_upgrade else {
            return Err(Error::Upstream {
                cluster: cluster.id.clone(),
                kind: UpstreamKind::Other,
                message: "cluster switched protocols on a non-upgrade request".into(),
            });
        };
        let upstream_upgrade = hyper::upgrade::on(&mut upstream);
        let cluster_id = cluster.id.clone();
        tokio::spawn(async move {
            let (incoming, outgoing) = match tokio::try_join!(incoming_upgrade, upstream_upgrade) {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(cluster = %cluster_id, error = %e, "proxy upgrade failed");
                    return;
                }
            };
            let mut incoming = TokioIo::new(incoming);
            let mut outgoing = TokioIo::new(outgoing);
            match tokio::io::copy_bidirectional(&mut incoming, &mut outgoing).await {
                Ok((to_cluster, to_client)) => debug!(
                    cluster = %cluster_id,
                    to_cluster,
                    to_client,
                    "proxy upgrade closed"
                ),
                Err(e) => debug!(cluster = %cluster_id, error = %e, "proxy upgrade ended"),
            }
        });
        return response
            .body(Body::empty())
            .map_err(|e| Error::internal(e.to_string()));
    }

    response
        .body(Body::new(upstream.into_body()))
        .map_err(|e| Error::internal(e.to_string()))
}

fn proxied_path(params: &HashMap<String, String>) -> &str {
    params.get("path").map(String::as_str).unwrap_or_default()
}

/// `ANY /proxy/{*path}`; cluster from the query or the active cluster
pub(crate) async fn proxy_selected(
    target: TargetCluster,
    Path(params): Path<HashMap<String, String>>,
    request: Request,
) -> std::result::Result<Response, ApiError> {
    Ok(forward(target.0, proxied_path(&params), request).await?)
}

/// `ANY /clusters/{id}/proxy/{*path}`
pub(crate) async fn proxy_by_id(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    request: Request,
) -> std::result::Result<Response, ApiError> {
    let id = params.get("id").map(String::as_str).unwrap_or_default();
    let cluster = state.registry.resolve(&ClusterSelector::id(id)).await?;
    Ok(forward(cluster, proxied_path(&params), request).await?)
}
