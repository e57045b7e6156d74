//! Interactive pod exec over a WebSocket
//!
//! Two pumps per session. The inbound pump feeds client frames into a
//! bounded stdin channel and handles resize frames; the outbound pump
//! drains stdout/stderr into binary frames. Both stop on the session's
//! cancellation.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::Path;
use axum::response::Response;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, AttachedProcess, TerminalSize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use cilikube_common::validation::{validate_namespace, validate_resource_name};
use cilikube_common::{Error, Result};

use super::logs::check_container;
use super::session::{CloseReason, StreamKind, StreamSession};
use super::stdin::StdinReader;
use super::websocket::{
    forward_reader_to_channel, parse_k8s_message, send_close_normal, send_error_and_close,
    K8sMessage,
};
use super::STREAM_BUFFER;
use crate::error::ApiError;
use crate::extract::{ApiQuery, TargetCluster};

/// Command run when none is given
pub const DEFAULT_SHELL: &str = "/bin/sh";

const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Parsed exec query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOptions {
    /// Target container; the pod's default when absent
    pub container: Option<String>,
    /// Command vector
    pub command: Vec<String>,
    /// Attach stdin
    pub stdin: bool,
    /// Attach stdout
    pub stdout: bool,
    /// Attach stderr; always off with a tty since the streams are merged
    pub stderr: bool,
    /// Allocate a terminal
    pub tty: bool,
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(Error::validation(format!(
            "{} must be true or false, got {}",
            key, other
        ))),
    }
}

impl ExecOptions {
    /// Parse repeated `command` plus `container`, `shell` and the stream flags
    pub fn from_pairs(pairs: &[(String, String)]) -> Result<Self> {
        let mut container = None;
        let mut command = Vec::new();
        let mut shell = DEFAULT_SHELL.to_string();
        let (mut stdin, mut stdout, mut stderr, mut tty) = (true, true, true, true);

        for (key, value) in pairs {
            match key.as_str() {
                "container" if !value.trim().is_empty() => container = Some(value.trim().to_string()),
                "command" if !value.is_empty() => command.push(value.clone()),
                "shell" if !value.trim().is_empty() => shell = value.trim().to_string(),
                "stdin" => stdin = parse_flag(key, value)?,
                "stdout" => stdout = parse_flag(key, value)?,
                "stderr" => stderr = parse_flag(key, value)?,
                "tty" => tty = parse_flag(key, value)?,
                _ => {}
            }
        }
        if command.is_empty() {
            command.push(shell);
        }
        Ok(Self {
            container,
            command,
            stdin,
            stdout,
            stderr: stderr && !tty,
            tty,
        })
    }

    fn attach_params(&self) -> AttachParams {
        let params = AttachParams::default()
            .stdin(self.stdin)
            .stdout(self.stdout)
            .stderr(self.stderr)
            .tty(self.tty);
        match &self.container {
            Some(container) => params.container(container.clone()),
            None => params,
        }
    }
}

pub(crate) async fn exec(
    target: TargetCluster,
    Path((namespace, name)): Path<(String, String)>,
    ApiQuery(pairs): ApiQuery<Vec<(String, String)>>,
    ws: WebSocketUpgrade,
) -> std::result::Result<Response, ApiError> {
    validate_namespace(&namespace)?;
    validate_resource_name(&name)?;
    let options = ExecOptions::from_pairs(&pairs)?;

    let pods: Api<Pod> = Api::namespaced(target.client.client().clone(), &namespace);
    if let Some(container) = &options.container {
        check_container(&pods, &target.id, &namespace, &name, container).await?;
    }

    let session = Arc::new(StreamSession::new(
        StreamKind::Exec,
        target.id.clone(),
        format!("{}/{}", namespace, name),
    ));
    Ok(ws.on_upgrade(move |socket| run_exec(socket, pods, name, options, session)))
}

async fn run_exec(
    socket: WebSocket,
    pods: Api<Pod>,
    name: String,
    options: ExecOptions,
    session: Arc<StreamSession>,
) {
    let (mut sender, receiver) = socket.split();

    let mut attached = match pods
        .exec(&name, options.command.clone(), &options.attach_params())
        .await
    {
        Ok(attached) => attached,
        Err(e) => {
            warn!(session = %session.id(), error = %e, "failed to start exec");
            session.close(CloseReason::Error(e.to_string()));
            send_error_and_close(&mut sender, format!("exec failed: {}", e)).await;
            return;
        }
    };
    session.mark_running();
    info!(session = %session.id(), command = ?options.command, tty = options.tty, "exec started");

    let (output_tx, mut output_rx) = mpsc::channel::<Bytes>(STREAM_BUFFER);
    let mut readers = Vec::new();
    if let Some(stdout) = attached.stdout() {
        readers.push(tokio::spawn(forward_reader_to_channel(stdout, output_tx.clone())));
    }
    if let Some(stderr) = attached.stderr() {
        readers.push(tokio::spawn(forward_reader_to_channel(stderr, output_tx.clone())));
    }
    drop(output_tx);

    let (stdin_tx, stdin_rx) = mpsc::channel::<Bytes>(STREAM_BUFFER);
    let stdin_task = attached.stdin().map(|mut writer| {
        tokio::spawn(async move {
            let mut reader = StdinReader::new(stdin_rx);
            if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
                debug!(error = %e, "stdin copy stopped");
            }
            let _ = writer.shutdown().await;
        })
    });

    let inbound = tokio::spawn(inbound_pump(
        receiver,
        stdin_tx,
        attached.terminal_size(),
        session.clone(),
    ));

    outbound_pump(&mut sender, &mut output_rx, &session).await;

    if client_went_away(&session) {
        attached.abort();
    } else {
        if let Some(message) = exit_failure(&mut attached).await {
            let _ = sender.send(Message::Text(message.into())).await;
        }
        send_close_normal(&mut sender, "exec session ended").await;
    }

    let _ = inbound.await;
    if let Some(task) = stdin_task {
        task.abort();
    }
    for reader in readers {
        reader.abort();
    }
    debug!(session = %session.id(), "exec pumps finished");
}

/// Upstream output into binary frames until the output ends, the client
/// stops accepting frames, or the session closes
async fn outbound_pump<S>(
    sender: &mut S,
    output_rx: &mut mpsc::Receiver<Bytes>,
    session: &StreamSession,
) where
    S: Sink<Message> + Unpin,
{
    loop {
        let chunk = tokio::select! {
            _ = session.cancelled() => break,
            chunk = output_rx.recv() => chunk,
        };
        let Some(chunk) = chunk else {
            session.close(CloseReason::UpstreamEnd);
            break;
        };
        if sender.send(Message::Binary(chunk)).await.is_err() {
            session.close(CloseReason::ClientClose);
            break;
        }
    }
}

/// Whether the process must be torn down rather than waited on
fn client_went_away(session: &StreamSession) -> bool {
    session.close_reason() == Some(&CloseReason::ClientClose)
}

/// Client frames into stdin and resize requests
async fn inbound_pump<C>(
    mut receiver: C,
    stdin_tx: mpsc::Sender<Bytes>,
    mut resize: Option<futures::channel::mpsc::Sender<TerminalSize>>,
    session: Arc<StreamSession>,
) where
    C: Stream<Item = std::result::Result<Message, axum::Error>> + Unpin,
{
    let mut stdin = Some(stdin_tx);
    loop {
        let msg = tokio::select! {
            _ = session.cancelled() => break,
            msg = receiver.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => {
                forward_stdin(&mut stdin, Bytes::copy_from_slice(text.as_bytes()), &session).await;
            }
            Some(Ok(Message::Binary(data))) => match parse_k8s_message(&data) {
                Some(K8sMessage::Resize { width, height }) => {
                    if let Some(tx) = resize.as_mut() {
                        let _ = tx.send(TerminalSize { width, height }).await;
                    }
                }
                Some(K8sMessage::Stdin(payload)) | Some(K8sMessage::Raw(payload)) => {
                    forward_stdin(&mut stdin, Bytes::from(payload), &session).await;
                }
                None => {}
            },
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => {}
        }
    }
    // closes the stdin channel exactly once
    drop(stdin.take());
    session.close(CloseReason::ClientClose);
}

/// A stalled stdin consumer never outlives the session
async fn forward_stdin(
    stdin: &mut Option<mpsc::Sender<Bytes>>,
    payload: Bytes,
    session: &StreamSession,
) {
    let Some(tx) = stdin.as_ref() else {
        return;
    };
    let sent = tokio::select! {
        _ = session.cancelled() => false,
        sent = tx.send(payload) => sent.is_ok(),
    };
    if !sent {
        *stdin = None;
    }
}

/// Message for a non-successful exit, if the process reported one
async fn exit_failure(attached: &mut AttachedProcess) -> Option<String> {
    let status = attached.take_status()?;
    let status = tokio::time::timeout(STATUS_TIMEOUT, status).await.ok()??;
    if status.status.as_deref() == Some("Success") {
        return None;
    }
    Some(
        serde_json::json!({
            "status": status.status,
            "reason": status.reason,
            "message": status.message,
        })
        .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    type ClientFrames = futures::channel::mpsc::UnboundedReceiver<std::result::Result<Message, axum::Error>>;

    fn session() -> Arc<StreamSession> {
        Arc::new(StreamSession::new(StreamKind::Exec, "c1", "default/web"))
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_command_runs_the_shell() {
        let options = ExecOptions::from_pairs(&[]).unwrap();
        assert_eq!(options.command, vec![DEFAULT_SHELL.to_string()]);
        assert!(options.stdin && options.stdout && options.tty);
        assert!(!options.stderr, "stderr is merged into the tty");

        let options = ExecOptions::from_pairs(&pairs(&[("shell", "/bin/bash")])).unwrap();
        assert_eq!(options.command, vec!["/bin/bash".to_string()]);
    }

    #[test]
    fn repeated_command_keeps_order() {
        let options = ExecOptions::from_pairs(&pairs(&[
            ("container", "app"),
            ("command", "ls"),
            ("command", "-la"),
            ("command", "/tmp"),
            ("tty", "false"),
            ("clusterId", "c1"),
        ]))
        .unwrap();
        assert_eq!(options.container.as_deref(), Some("app"));
        assert_eq!(options.command, vec!["ls", "-la", "/tmp"]);
        assert!(!options.tty);
        assert!(options.stderr);
    }

    #[test]
    fn bad_flags_are_rejected() {
        let err = ExecOptions::from_pairs(&pairs(&[("stdin", "maybe")])).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn attach_params_follow_options() {
        let options = ExecOptions::from_pairs(&pairs(&[("container", "app"), ("stdin", "0")])).unwrap();
        let params = options.attach_params();
        assert_eq!(params.container.as_deref(), Some("app"));
        assert!(!params.stdin);
        assert!(params.tty);
        assert!(!params.stderr);
    }

    #[tokio::test]
    async fn client_disconnect_closes_stdin_once_and_tears_down() {
        let (client_tx, client_rx): (_, ClientFrames) = futures::channel::mpsc::unbounded();
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Bytes>(STREAM_BUFFER);
        let session = session();

        client_tx
            .unbounded_send(Ok(Message::Text("ls\n".into())))
            .unwrap();
        client_tx
            .unbounded_send(Ok(Message::Binary(Bytes::from_static(&[0, b'p', b'w', b'd']))))
            .unwrap();
        drop(client_tx);

        inbound_pump(client_rx, stdin_tx, None, session.clone()).await;

        assert_eq!(stdin_rx.recv().await.as_deref(), Some(&b"ls\n"[..]));
        assert_eq!(stdin_rx.recv().await.as_deref(), Some(&b"pwd"[..]));
        assert!(stdin_rx.recv().await.is_none(), "stdin channel is closed");
        assert!(client_went_away(&session));
    }

    #[tokio::test]
    async fn resize_frames_reach_the_terminal() {
        let (client_tx, client_rx): (_, ClientFrames) = futures::channel::mpsc::unbounded();
        let (stdin_tx, _stdin_rx) = mpsc::channel::<Bytes>(STREAM_BUFFER);
        let (resize_tx, mut resize_rx) = futures::channel::mpsc::channel::<TerminalSize>(4);

        client_tx
            .unbounded_send(Ok(Message::Binary(Bytes::from_static(&[4, 0x50, 0x00, 0x18, 0x00]))))
            .unwrap();
        drop(client_tx);
        inbound_pump(client_rx, stdin_tx, Some(resize_tx), session()).await;

        let size = resize_rx.next().await.unwrap();
        assert_eq!((size.width, size.height), (80, 24));
    }

    #[tokio::test]
    async fn stalled_stdin_does_not_outlive_the_session() {
        let (client_tx, client_rx): (_, ClientFrames) = futures::channel::mpsc::unbounded();
        // capacity one and nobody reading: the second frame blocks
        let (stdin_tx, _stdin_rx) = mpsc::channel::<Bytes>(1);
        let session = session();
        for _ in 0..3 {
            client_tx
                .unbounded_send(Ok(Message::Text("x".into())))
                .unwrap();
        }

        let pump = tokio::spawn(inbound_pump(client_rx, stdin_tx, None, session.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.close(CloseReason::UpstreamEnd);

        tokio::time::timeout(Duration::from_secs(5), pump)
            .await
            .expect("inbound pump stops with the session")
            .unwrap();
        assert!(!client_went_away(&session));
        drop(client_tx);
    }

    #[tokio::test]
    async fn outbound_stops_when_the_client_goes_away() {
        let (out_tx, out_rx) = futures::channel::mpsc::unbounded::<Message>();
        let (output_tx, mut output_rx) = mpsc::channel::<Bytes>(STREAM_BUFFER);
        let session = session();

        output_tx.send(Bytes::from_static(b"hello")).await.unwrap();
        drop(out_rx);
        output_tx.send(Bytes::from_static(b"world")).await.unwrap();

        let mut out_tx = out_tx;
        tokio::time::timeout(
            Duration::from_secs(5),
            outbound_pump(&mut out_tx, &mut output_rx, &session),
        )
        .await
        .expect("outbound pump stops");
        assert!(client_went_away(&session));
        drop(output_tx);
    }

    #[tokio::test]
    async fn outbound_drains_output_then_reports_upstream_end() {
        let (mut out_tx, out_rx) = futures::channel::mpsc::unbounded::<Message>();
        let (output_tx, mut output_rx) = mpsc::channel::<Bytes>(STREAM_BUFFER);
        let session = session();

        output_tx.send(Bytes::from_static(b"one")).await.unwrap();
        output_tx.send(Bytes::from_static(b"two")).await.unwrap();
        drop(output_tx);

        outbound_pump(&mut out_tx, &mut output_rx, &session).await;
        drop(out_tx);

        let frames: Vec<Message> = out_rx.collect().await;
        let payloads: Vec<Bytes> = frames
            .into_iter()
            .filter_map(|m| match m {
                Message::Binary(b) => Some(b),
                _ => None,
            })
            .collect();
        assert_eq!(payloads, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
        assert_eq!(session.close_reason(), Some(&CloseReason::UpstreamEnd));
        assert!(!client_went_away(&session));
    }
}
