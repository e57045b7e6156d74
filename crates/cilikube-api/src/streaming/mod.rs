//! Streaming gateway: pod logs, pod exec and the transparent proxy

pub mod exec;
pub mod logs;
pub mod proxy;
pub mod session;
pub mod stdin;
pub mod websocket;

use axum::routing::{any, get};
use axum::Router;

use crate::server::AppState;

pub use session::{CloseReason, SessionState, StreamKind, StreamSession};
pub use stdin::StdinReader;

/// Capacity of the per-session stdin and output channels
pub const STREAM_BUFFER: usize = 100;

pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/namespaces/{namespace}/pods/{name}/logs",
            get(logs::stream_logs),
        )
        .route("/namespaces/{namespace}/pods/{name}/exec", get(exec::exec))
        .route("/proxy/{*path}", any(proxy::proxy_selected))
        .route("/clusters/{id}/proxy/{*path}", any(proxy::proxy_by_id))
}
