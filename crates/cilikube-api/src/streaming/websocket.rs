//! WebSocket framing helpers for logs and exec
//!
//! Binary frames from exec clients may carry the Kubernetes channel byte
//! as their first byte; text frames are always stdin.

use axum::extract::ws::{CloseFrame, Message};
use bytes::Bytes;
use futures::{Sink, SinkExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

/// Kubernetes stream channel ids
pub mod channel {
    /// Channel 0: stdin
    pub const STDIN: u8 = 0;
    /// Channel 1: stdout
    pub const STDOUT: u8 = 1;
    /// Channel 2: stderr
    pub const STDERR: u8 = 2;
    /// Channel 3: error
    pub const ERROR: u8 = 3;
    /// Channel 4: terminal resize
    pub const RESIZE: u8 = 4;
}

/// WebSocket close codes
pub mod close_code {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Server hit an unexpected condition
    pub const INTERNAL_ERROR: u16 = 1011;
}

const READ_CHUNK: usize = 4096;

/// Parsed client frame
#[derive(Debug, PartialEq, Eq)]
pub enum K8sMessage {
    /// Stdin data
    Stdin(Vec<u8>),
    /// Terminal resize
    Resize {
        /// Columns
        width: u16,
        /// Rows
        height: u16,
    },
    /// Frame without a recognized channel byte
    Raw(Vec<u8>),
}

/// Parse a binary client frame
///
/// A resize payload is four bytes: width then height, little-endian `u16`.
/// Server-only channels sent by a client are treated as stdin.
pub fn parse_k8s_message(data: &[u8]) -> Option<K8sMessage> {
    let (&channel, payload) = data.split_first()?;
    match channel {
        channel::RESIZE if payload.len() >= 4 => Some(K8sMessage::Resize {
            width: u16::from_le_bytes([payload[0], payload[1]]),
            height: u16::from_le_bytes([payload[2], payload[3]]),
        }),
        channel::STDIN => Some(K8sMessage::Stdin(payload.to_vec())),
        channel::STDOUT | channel::STDERR | channel::ERROR => {
            tracing::warn!(
                channel,
                "received server-only channel from client, treating as stdin"
            );
            Some(K8sMessage::Stdin(payload.to_vec()))
        }
        _ => Some(K8sMessage::Raw(data.to_vec())),
    }
}

/// Send a close frame
pub async fn send_close<S>(sender: &mut S, code: u16, reason: impl Into<String>)
where
    S: Sink<Message> + Unpin,
{
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into().into(),
        })))
        .await;
}

/// Send a normal close frame
pub async fn send_close_normal<S>(sender: &mut S, reason: impl Into<String>)
where
    S: Sink<Message> + Unpin,
{
    send_close(sender, close_code::NORMAL, reason).await;
}

/// Send the error as a final text frame, then close
pub async fn send_error_and_close<S>(sender: &mut S, error: impl Into<String>)
where
    S: Sink<Message> + Unpin,
{
    let _ = sender.send(Message::Text(error.into().into())).await;
    send_close(sender, close_code::INTERNAL_ERROR, "stream failed").await;
}

/// Whether `Connection` lists `upgrade`
pub fn has_connection_upgrade(headers: &axum::http::HeaderMap) -> bool {
    headers
        .get_all("connection")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
}

/// Read `reader` in chunks into `tx` until EOF, an error or the receiver
/// going away
pub async fn forward_reader_to_channel<R>(mut reader: R, tx: mpsc::Sender<Bytes>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            }
        }
    }
}
