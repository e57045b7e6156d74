//! HTTP mapping of domain errors

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{error, warn};

use cilikube_common::{Error, UpstreamKind};

use crate::envelope::Envelope;

/// Domain error rendered as a JSON envelope
#[derive(Debug)]
pub struct ApiError(pub Error);

impl<E> From<E> for ApiError
where
    E: Into<Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// HTTP status for a domain error
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Validation(_) | Error::ClusterSelectionMissing | Error::ConfigInvalid(_) => {
            StatusCode::BAD_REQUEST
        }
        Error::ClusterNotFound(_) | Error::NotFound(_) | Error::NoActive => StatusCode::NOT_FOUND,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        Error::ClusterUnavailable { .. } | Error::Unreachable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        // 401 and 422 extend the base mapping, where everything else is 500
        Error::AuthFailed(_) => StatusCode::UNAUTHORIZED,
        Error::Upstream { kind, .. } => match kind {
            UpstreamKind::NotFound => StatusCode::NOT_FOUND,
            UpstreamKind::Conflict => StatusCode::CONFLICT,
            UpstreamKind::Forbidden => StatusCode::FORBIDDEN,
            UpstreamKind::Invalid => StatusCode::UNPROCESSABLE_ENTITY,
            UpstreamKind::Expired => StatusCode::GONE,
            UpstreamKind::Unauthorized => StatusCode::UNAUTHORIZED,
            UpstreamKind::Other => StatusCode::INTERNAL_SERVER_ERROR,
        },
        Error::StreamClosed
        | Error::Storage(_)
        | Error::Config(_)
        | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Upstream or registry reason carried in the envelope's `details`
fn details_for(err: &Error) -> Option<serde_json::Value> {
    match err {
        Error::Upstream {
            cluster,
            kind,
            message,
        } => Some(serde_json::json!({
            "cluster": cluster,
            "kind": kind.to_string(),
            "reason": message,
        })),
        Error::ClusterUnavailable { cluster, reason } => Some(serde_json::json!({
            "cluster": cluster,
            "reason": reason,
        })),
        _ => None,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(error = %self.0, status = status.as_u16(), "request failed");
        } else {
            warn!(error = %self.0, status = status.as_u16(), "request rejected");
        }
        let body: Envelope<()> = Envelope {
            code: status.as_u16(),
            message: self.0.to_string(),
            data: None,
            details: details_for(&self.0),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(kind: UpstreamKind) -> Error {
        Error::Upstream {
            cluster: "c1".into(),
            kind,
            message: "boom".into(),
        }
    }

    #[test]
    fn status_mapping() {
        let cases = [
            (Error::validation("x"), StatusCode::BAD_REQUEST),
            (Error::ClusterSelectionMissing, StatusCode::BAD_REQUEST),
            (Error::ClusterNotFound("x".into()), StatusCode::NOT_FOUND),
            (Error::NoActive, StatusCode::NOT_FOUND),
            (Error::Conflict("x".into()), StatusCode::CONFLICT),
            (Error::PayloadTooLarge("x".into()), StatusCode::PAYLOAD_TOO_LARGE),
            (Error::AuthFailed("x".into()), StatusCode::UNAUTHORIZED),
            (
                Error::ClusterUnavailable {
                    cluster: "x".into(),
                    reason: "down".into(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (upstream(UpstreamKind::NotFound), StatusCode::NOT_FOUND),
            (upstream(UpstreamKind::Forbidden), StatusCode::FORBIDDEN),
            (upstream(UpstreamKind::Conflict), StatusCode::CONFLICT),
            (upstream(UpstreamKind::Invalid), StatusCode::UNPROCESSABLE_ENTITY),
            (upstream(UpstreamKind::Expired), StatusCode::GONE),
            (upstream(UpstreamKind::Other), StatusCode::INTERNAL_SERVER_ERROR),
            (Error::internal("x"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(status_for(&err), expected, "{}", err);
        }
    }

    #[tokio::test]
    async fn renders_envelope_with_details() {
        let resp = ApiError(upstream(UpstreamKind::Forbidden)).into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], 403);
        assert_eq!(body["details"]["cluster"], "c1");
        assert_eq!(body["details"]["reason"], "boom");
        assert!(body.get("data").is_none());
    }
}
