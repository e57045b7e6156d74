//! Response envelope shared by every non-streaming endpoint

use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

/// `{code, message, data?, details?}`
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    /// HTTP status code
    pub code: u16,
    /// Human-readable message
    pub message: String,
    /// Payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Upstream reason for failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// 200 with a payload
pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        code: StatusCode::OK.as_u16(),
        message: "success".to_string(),
        data: Some(data),
        details: None,
    })
}

/// 201 with the created object
pub fn created<T: Serialize>(data: T) -> (StatusCode, Json<Envelope<T>>) {
    (
        StatusCode::CREATED,
        Json(Envelope {
            code: StatusCode::CREATED.as_u16(),
            message: "created".to_string(),
            data: Some(data),
            details: None,
        }),
    )
}

/// 200 with only a message
pub fn message(message: impl Into<String>) -> Json<Envelope<()>> {
    Json(Envelope {
        code: StatusCode::OK.as_u16(),
        message: message.into(),
        data: None,
        details: None,
    })
}
