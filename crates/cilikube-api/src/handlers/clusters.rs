//! Cluster management endpoints

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use tracing::info;

use cilikube_cluster::{ClusterDetails, ClusterStatus, ClusterUpdate, NewCluster};
use cilikube_common::{Error, Result};

use crate::envelope::{created, message, ok, Envelope};
use crate::error::ApiError;
use crate::extract::ApiJson;
use crate::server::AppState;

/// Body of `POST /clusters`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateClusterRequest {
    /// Unique name
    pub name: String,
    /// Base64-encoded kubeconfig
    pub kubeconfig_data: String,
    /// Environment label
    #[serde(default)]
    pub environment: String,
    /// Provider label
    #[serde(default)]
    pub provider: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Region
    #[serde(default)]
    pub region: String,
}

/// Body of `PUT /clusters/{id}`; absent fields are left unchanged
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UpdateClusterRequest {
    /// New name
    pub name: Option<String>,
    /// Replacement base64-encoded kubeconfig
    pub kubeconfig_data: Option<String>,
    /// Environment label
    pub environment: Option<String>,
    /// Provider label
    pub provider: Option<String>,
    /// Description
    pub description: Option<String>,
    /// Region
    pub region: Option<String>,
}

/// Body of `POST /clusters/active`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SwitchActiveRequest {
    /// Cluster id
    pub id: Option<String>,
    /// Cluster name, used when no id is given
    pub name: Option<String>,
}

impl SwitchActiveRequest {
    fn key(&self) -> Result<&str> {
        [self.id.as_deref(), self.name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|k| !k.is_empty())
            .ok_or_else(|| Error::validation("either id or name is required"))
    }
}

fn decode_kubeconfig(data: &str) -> Result<Vec<u8>> {
    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| Error::validation(format!("kubeconfigData is not valid base64: {}", e)))?;
    if bytes.is_empty() {
        return Err(Error::validation("kubeconfigData is empty"));
    }
    Ok(bytes)
}

async fn list_clusters(State(state): State<AppState>) -> Json<Envelope<Vec<ClusterStatus>>> {
    ok(state.registry.list().await)
}

async fn create_cluster(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<CreateClusterRequest>,
) -> std::result::Result<(StatusCode, Json<Envelope<ClusterStatus>>), ApiError> {
    let kubeconfig = decode_kubeconfig(&req.kubeconfig_data)?;
    let status = state
        .registry
        .add(NewCluster {
            name: req.name,
            kubeconfig,
            environment: req.environment,
            provider: req.provider,
            description: req.description,
            region: req.region,
        })
        .await?;
    info!(cluster = %status.id, name = %status.name, "cluster registered");
    Ok(created(status))
}

async fn get_cluster(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<Envelope<ClusterDetails>>, ApiError> {
    Ok(ok(state.registry.get(&id).await?))
}

async fn update_cluster(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<UpdateClusterRequest>,
) -> std::result::Result<Json<Envelope<ClusterStatus>>, ApiError> {
    let kubeconfig = req
        .kubeconfig_data
        .as_deref()
        .map(decode_kubeconfig)
        .transpose()?;
    let status = state
        .registry
        .update(
            &id,
            ClusterUpdate {
                name: req.name,
                kubeconfig,
                environment: req.environment,
                provider: req.provider,
                description: req.description,
                region: req.region,
            },
        )
        .await?;
    Ok(ok(status))
}

async fn delete_cluster(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<Envelope<()>>, ApiError> {
    state.registry.remove(&id).await?;
    Ok(message(format!("cluster {} removed", id)))
}

async fn get_active(
    State(state): State<AppState>,
) -> std::result::Result<Json<Envelope<ClusterStatus>>, ApiError> {
    Ok(ok(state.registry.active_status().await?))
}

async fn set_active(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<SwitchActiveRequest>,
) -> std::result::Result<Json<Envelope<ClusterStatus>>, ApiError> {
    Ok(ok(state.registry.set_active(req.key()?).await?))
}

async fn refresh_cluster(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<Envelope<ClusterStatus>>, ApiError> {
    Ok(ok(state.registry.refresh_one(&id).await?))
}

pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/clusters", get(list_clusters).post(create_cluster))
        .route("/clusters/active", get(get_active).post(set_active))
        .route(
            "/clusters/{id}",
            get(get_cluster).put(update_cluster).delete(delete_cluster),
        )
        .route("/clusters/{id}/refresh", post(refresh_cluster))
}
