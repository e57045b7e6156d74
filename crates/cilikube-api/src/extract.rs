//! Per-request cluster resolution

use std::ops::Deref;

use axum::extract::{FromRequest, FromRequestParts, Query, Request};
use axum::http::request::Parts;
use axum::Json;
use serde::de::DeserializeOwned;
use tracing::debug;

use cilikube_cluster::{ClusterSelector, ResolvedCluster};
use cilikube_common::Error;

use crate::error::ApiError;
use crate::server::AppState;

/// The cluster a request targets, from `clusterId` / `clusterName` or the
/// active cluster
#[derive(Debug, Clone)]
pub struct TargetCluster(pub ResolvedCluster);

impl Deref for TargetCluster {
    type Target = ResolvedCluster;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromRequestParts<AppState> for TargetCluster {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let Query(selector) = Query::<ClusterSelector>::try_from_uri(&parts.uri)
            .map_err(|e| Error::validation(e.body_text()))?;
        let resolved = state.registry.resolve(&selector).await?;
        debug!(
            cluster = %resolved.id,
            method = %parts.method,
            path = %parts.uri.path(),
            "request routed"
        );
        Ok(Self(resolved))
    }
}

/// Query string extractor whose rejection renders as a validation envelope
#[derive(Debug, Clone, Default)]
pub struct ApiQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, ApiError> {
        let Query(value) =
            Query::<T>::try_from_uri(&parts.uri).map_err(|e| Error::validation(e.body_text()))?;
        Ok(Self(value))
    }
}

/// JSON body extractor whose rejection renders as a validation envelope
#[derive(Debug, Clone, Default)]
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, ApiError> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| Error::validation(e.body_text()))?;
        Ok(Self(value))
    }
}
