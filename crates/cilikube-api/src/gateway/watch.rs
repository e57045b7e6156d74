//! Watch streams rendered as newline-delimited JSON

use std::convert::Infallible;
use std::fmt::Debug;

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::response::Response;
use bytes::Bytes;
use futures::{stream, StreamExt};
use kube::api::{Api, WatchEvent};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use cilikube_common::{Error, Result};

use super::params::ListQuery;

/// Content type of watch responses
pub const NDJSON: &str = "application/x-ndjson";

const FRAME_BUFFER: usize = 64;

/// Start a watch and stream `{type, object}` frames, one per line
///
/// A failure to open the watch is returned as an error so the caller can
/// answer with a status code. Once streaming, upstream errors become a final
/// `ERROR` frame; a 410 carries reason `Expired` so clients re-list.
pub(crate) async fn watch_response<K>(
    api: Api<K>,
    cluster: String,
    query: &ListQuery,
    name: Option<&str>,
) -> Result<Response>
where
    K: Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    let params = query.watch_params(name);
    let version = query.resource_version();
    let (opened_tx, opened_rx) = oneshot::channel::<Result<()>>();
    let (frame_tx, frame_rx) = mpsc::channel::<Bytes>(FRAME_BUFFER);

    tokio::spawn(async move {
        let events = match api.watch(&params, &version).await {
            Ok(events) => events,
            Err(e) => {
                let _ = opened_tx.send(Err(Error::upstream(&cluster, e)));
                return;
            }
        };
        if opened_tx.send(Ok(())).is_err() {
            return;
        }
        let mut events = std::pin::pin!(events);
        loop {
            let next = tokio::select! {
                _ = frame_tx.closed() => {
                    debug!(cluster = %cluster, "watch client went away");
                    return;
                }
                next = events.next() => next,
            };
            let Some(event) = next else {
                debug!(cluster = %cluster, "watch ended");
                return;
            };
            let (frame, last) = match event {
                Ok(event) => {
                    let last = matches!(event, WatchEvent::Error(_));
                    (event_frame(event), last)
                }
                Err(e) => {
                    warn!(cluster = %cluster, error = %e, "watch stream failed");
                    (stream_error_frame(&e), true)
                }
            };
            if frame_tx.send(encode_line(&frame)).await.is_err() || last {
                return;
            }
        }
    });

    match opened_rx.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(Error::internal("watch task ended before opening")),
    }

    let body = stream::unfold(frame_rx, |mut rx| async move {
        rx.recv().await.map(|frame| (Ok::<_, Infallible>(frame), rx))
    });
    Response::builder()
        .header(CONTENT_TYPE, NDJSON)
        .body(Body::from_stream(body))
        .map_err(|e| Error::internal(e.to_string()))
}

fn event_frame<K: Serialize>(event: WatchEvent<K>) -> Value {
    match event {
        WatchEvent::Added(object) => json!({"type": "ADDED", "object": object}),
        WatchEvent::Modified(object) => json!({"type": "MODIFIED", "object": object}),
        WatchEvent::Deleted(object) => json!({"type": "DELETED", "object": object}),
        WatchEvent::Bookmark(bookmark) => json!({
            "type": "BOOKMARK",
            "object": {
                "kind": bookmark.types.kind,
                "apiVersion": bookmark.types.api_version,
                "metadata": {"resourceVersion": bookmark.metadata.resource_version},
            }
        }),
        WatchEvent::Error(status) => error_frame(status.code, &status.reason, &status.message),
    }
}

fn stream_error_frame(err: &kube::Error) -> Value {
    match err {
        kube::Error::Api(status) => error_frame(status.code, &status.reason, &status.message),
        other => error_frame(500, "InternalError", &other.to_string()),
    }
}

pub(crate) fn error_frame(code: u16, reason: &str, message: &str) -> Value {
    let reason = if code == 410 { "Expired" } else { reason };
    json!({
        "type": "ERROR",
        "object": {
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "code": code,
            "reason": reason,
            "message": message,
        }
    })
}

fn encode_line(frame: &Value) -> Bytes {
    let mut line = frame.to_string().into_bytes();
    line.push(b'\n');
    Bytes::from(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;

    fn pod(name: &str) -> Pod {
        serde_json::from_value(json!({"metadata": {"name": name}})).unwrap()
    }

    #[test]
    fn frames_carry_type_and_object() {
        let frame = event_frame(WatchEvent::Added(pod("web")));
        assert_eq!(frame["type"], "ADDED");
        assert_eq!(frame["object"]["metadata"]["name"], "web");

        let frame = event_frame(WatchEvent::Deleted(pod("web")));
        assert_eq!(frame["type"], "DELETED");
    }

    #[test]
    fn gone_is_reported_as_expired() {
        let frame = error_frame(410, "Gone", "too old resource version");
        assert_eq!(frame["type"], "ERROR");
        assert_eq!(frame["object"]["reason"], "Expired");
        assert_eq!(frame["object"]["code"], 410);

        let frame = error_frame(500, "InternalError", "boom");
        assert_eq!(frame["object"]["reason"], "InternalError");
    }

    #[test]
    fn lines_are_newline_terminated() {
        let line = encode_line(&json!({"type": "ADDED"}));
        assert!(line.ends_with(b"\n"));
        let parsed: Value = serde_json::from_slice(&line[..line.len() - 1]).unwrap();
        assert_eq!(parsed["type"], "ADDED");
    }
}
