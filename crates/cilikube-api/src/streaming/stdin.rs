//! Byte-stream view over message-framed stdin

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

/// Reads stdin frames from a channel as one continuous byte stream
///
/// A frame larger than the caller's buffer is consumed across several
/// reads; the unread tail is kept until the next call. The stream ends
/// when every sender is dropped.
#[derive(Debug)]
pub struct StdinReader {
    frames: mpsc::Receiver<Bytes>,
    remainder: Bytes,
}

impl StdinReader {
    /// Reader over the receiving half of the stdin channel
    pub fn new(frames: mpsc::Receiver<Bytes>) -> Self {
        Self {
            frames,
            remainder: Bytes::new(),
        }
    }
}

impl AsyncRead for StdinReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.remainder.is_empty() {
                let n = self.remainder.len().min(buf.remaining());
                let chunk = self.remainder.split_to(n);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
            match ready!(self.frames.poll_recv(cx)) {
                Some(frame) => self.remainder = frame,
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}
