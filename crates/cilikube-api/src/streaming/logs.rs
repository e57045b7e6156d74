//! Pod log tail over a WebSocket, one text frame per line

use std::io;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::Path;
use axum::response::Response;
use futures::{stream, AsyncBufRead, AsyncBufReadExt, Sink, SinkExt, Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, LogParams};
use serde::Deserialize;
use tracing::{debug, warn};

use cilikube_common::validation::{validate_namespace, validate_resource_name};
use cilikube_common::{Error, Result};

use super::session::{CloseReason, StreamKind, StreamSession};
use super::websocket::{send_close_normal, send_error_and_close};
use crate::error::ApiError;
use crate::extract::{ApiQuery, TargetCluster};

/// Lines returned when `tailLines` is not given
pub const DEFAULT_TAIL_LINES: i64 = 1000;

/// Query of the logs endpoint
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogQuery {
    /// Container to read; required
    pub container: Option<String>,
    /// Keep streaming new lines
    pub follow: bool,
    /// Prefix lines with timestamps
    pub timestamps: bool,
    /// Lines from the end to start with
    pub tail_lines: Option<i64>,
    /// Read the previous container instance
    pub previous: bool,
    /// Only lines newer than this many seconds
    pub since_seconds: Option<i64>,
}

impl LogQuery {
    fn container(&self) -> Result<&str> {
        self.container
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::validation("container is required"))
    }

    fn log_params(&self, container: &str) -> Result<LogParams> {
        let tail_lines = match self.tail_lines {
            None => DEFAULT_TAIL_LINES,
            Some(n) if n < 0 => {
                return Err(Error::validation("tailLines must not be negative"));
            }
            Some(n) => n,
        };
        Ok(LogParams {
            container: Some(container.to_string()),
            follow: self.follow,
            timestamps: self.timestamps,
            tail_lines: Some(tail_lines),
            previous: self.previous,
            since_seconds: self.since_seconds.filter(|s| *s > 0),
            ..LogParams::default()
        })
    }
}

/// Whether `pod` has `container` among its containers or init containers
pub(crate) fn pod_has_container(pod: &Pod, container: &str) -> bool {
    pod.spec.as_ref().is_some_and(|spec| {
        spec.containers.iter().any(|c| c.name == container)
            || spec
                .init_containers
                .iter()
                .flatten()
                .any(|c| c.name == container)
    })
}

/// Fetch the pod and make sure `container` exists in it
pub(crate) async fn check_container(
    pods: &Api<Pod>,
    cluster: &str,
    namespace: &str,
    name: &str,
    container: &str,
) -> Result<()> {
    let pod = pods.get(name).await.map_err(|e| Error::upstream(cluster, e))?;
    if pod_has_container(&pod, container) {
        Ok(())
    } else {
        Err(Error::NotFound(format!(
            "container {} not found in pod {}/{}",
            container, namespace, name
        )))
    }
}

pub(crate) async fn stream_logs(
    target: TargetCluster,
    Path((namespace, name)): Path<(String, String)>,
    ApiQuery(query): ApiQuery<LogQuery>,
    ws: WebSocketUpgrade,
) -> std::result::Result<Response, ApiError> {
    validate_namespace(&namespace)?;
    validate_resource_name(&name)?;
    let container = query.container()?.to_string();
    let params = query.log_params(&container)?;

    let pods: Api<Pod> = Api::namespaced(target.client.client().clone(), &namespace);
    check_container(&pods, &target.id, &namespace, &name, &container).await?;

    let session = Arc::new(StreamSession::new(
        StreamKind::Logs,
        target.id.clone(),
        format!("{}/{}/{}", namespace, name, container),
    ));
    Ok(ws.on_upgrade(move |socket| run_logs(socket, pods, name, params, session)))
}

async fn run_logs(
    socket: WebSocket,
    pods: Api<Pod>,
    name: String,
    params: LogParams,
    session: Arc<StreamSession>,
) {
    let (mut sender, receiver) = socket.split();

    let stream = match pods.log_stream(&name, &params).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(session = %session.id(), error = %e, "failed to open log stream");
            session.close(CloseReason::Error(e.to_string()));
            send_error_and_close(&mut sender, format!("failed to open log stream: {}", e)).await;
            return;
        }
    };
    session.mark_running();
    pump_logs(sender, receiver, lossy_lines(stream), session).await;
}

/// Lines of `reader` without their terminator; invalid UTF-8 is replaced
/// rather than ending the stream
fn lossy_lines<R>(reader: R) -> impl Stream<Item = io::Result<String>>
where
    R: AsyncBufRead + Unpin,
{
    stream::unfold((reader, Vec::new()), |(mut reader, mut buf)| async move {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => None,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                Some((Ok(line), (reader, buf)))
            }
            Err(e) => Some((Err(e), (reader, buf))),
        }
    })
}

/// Forward `lines` as text frames until either side ends
async fn pump_logs<S, C, L>(mut sender: S, mut client: C, lines: L, session: Arc<StreamSession>)
where
    S: Sink<Message> + Unpin,
    C: Stream<Item = std::result::Result<Message, axum::Error>> + Unpin + Send + 'static,
    L: Stream<Item = io::Result<String>>,
{
    // The client never sends data; reading only detects the disconnect.
    let watcher = tokio::spawn({
        let session = session.clone();
        async move {
            loop {
                let msg = tokio::select! {
                    _ = session.cancelled() => break,
                    msg = client.next() => msg,
                };
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        session.close(CloseReason::ClientClose);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    });

    let mut lines = std::pin::pin!(lines);
    loop {
        let next = tokio::select! {
            _ = session.cancelled() => break,
            next = lines.next() => next,
        };
        match next {
            Some(Ok(line)) => {
                if sender.send(Message::Text(line.into())).await.is_err() {
                    session.close(CloseReason::ClientClose);
                    break;
                }
            }
            Some(Err(e)) => {
                if session.close(CloseReason::Error(e.to_string())) {
                    send_error_and_close(&mut sender, format!("log stream failed: {}", e)).await;
                }
                break;
            }
            None => {
                if session.close(CloseReason::UpstreamEnd) {
                    send_close_normal(&mut sender, "log stream ended").await;
                }
                break;
            }
        }
    }

    session.close(CloseReason::ClientClose);
    let _ = watcher.await;
    debug!(session = %session.id(), "log pumps finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::channel::mpsc;
    use serde_json::json;

    use crate::streaming::session::SessionState;

    type ClientFrames = mpsc::UnboundedReceiver<std::result::Result<Message, axum::Error>>;

    fn session() -> Arc<StreamSession> {
        Arc::new(StreamSession::new(StreamKind::Logs, "c1", "default/web/nginx"))
    }

    fn text_frames(frames: Vec<Message>) -> Vec<String> {
        frames
            .into_iter()
            .filter_map(|m| match m {
                Message::Text(t) => Some(t.as_str().to_string()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn invalid_utf8_does_not_end_the_stream() {
        let reader = futures::io::Cursor::new(b"ok\n\xff\nafter\r\nlast".to_vec());
        let lines: Vec<String> = lossy_lines(reader)
            .map(|line| line.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["ok", "\u{FFFD}", "after", "last"]);
    }

    #[tokio::test]
    async fn every_line_is_forwarded_then_closed_normally() {
        let (out_tx, out_rx) = mpsc::unbounded::<Message>();
        let (_client_tx, client_rx): (_, ClientFrames) = mpsc::unbounded();
        let session = session();
        let reader = futures::io::Cursor::new(b"ok\n\xff\nafter\n".to_vec());

        pump_logs(out_tx, client_rx, lossy_lines(reader), session.clone()).await;

        let frames: Vec<Message> = out_rx.collect().await;
        assert!(matches!(frames.last(), Some(Message::Close(Some(_)))));
        assert_eq!(text_frames(frames), vec!["ok", "\u{FFFD}", "after"]);
        assert_eq!(session.close_reason(), Some(&CloseReason::UpstreamEnd));
    }

    #[tokio::test]
    async fn client_disconnect_stops_a_following_stream() {
        let (out_tx, _out_rx) = mpsc::unbounded::<Message>();
        let (client_tx, client_rx): (_, ClientFrames) = mpsc::unbounded();
        let session = session();
        let following = stream::iter(vec![Ok::<_, io::Error>("first".to_string())]).chain(stream::pending());

        let pump = tokio::spawn(pump_logs(out_tx, client_rx, following, session.clone()));
        drop(client_tx);

        tokio::time::timeout(Duration::from_secs(5), pump)
            .await
            .expect("pump stops after the client leaves")
            .unwrap();
        assert_eq!(session.close_reason(), Some(&CloseReason::ClientClose));
        assert_eq!(session.state(), SessionState::Closed);
    }

    fn pod() -> Pod {
        serde_json::from_value(json!({
            "metadata": {"name": "web", "namespace": "default"},
            "spec": {
                "containers": [{"name": "nginx"}],
                "initContainers": [{"name": "init-db"}]
            }
        }))
        .unwrap()
    }

    #[test]
    fn containers_and_init_containers_are_found() {
        let pod = pod();
        assert!(pod_has_container(&pod, "nginx"));
        assert!(pod_has_container(&pod, "init-db"));
        assert!(!pod_has_container(&pod, "sidecar"));
        assert!(!pod_has_container(&Pod::default(), "nginx"));
    }

    #[test]
    fn tail_defaults_to_a_thousand_lines() {
        let query = LogQuery {
            container: Some("nginx".into()),
            follow: true,
            ..LogQuery::default()
        };
        let params = query.log_params(query.container().unwrap()).unwrap();
        assert_eq!(params.tail_lines, Some(DEFAULT_TAIL_LINES));
        assert_eq!(params.container.as_deref(), Some("nginx"));
        assert!(params.follow);
        assert!(!params.timestamps);
    }

    #[test]
    fn container_is_required() {
        assert!(matches!(
            LogQuery::default().container(),
            Err(Error::Validation(_))
        ));
        let query = LogQuery {
            tail_lines: Some(-1),
            ..LogQuery::default()
        };
        assert!(matches!(query.log_params("c"), Err(Error::Validation(_))));
    }
}
