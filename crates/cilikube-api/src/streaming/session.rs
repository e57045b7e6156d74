//! Lifecycle of one streaming connection

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::info;
use uuid::Uuid;

/// What a session streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Pod log tail
    Logs,
    /// Interactive exec
    Exec,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Logs => f.write_str("logs"),
            Self::Exec => f.write_str("exec"),
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed or dropped the connection
    ClientClose,
    /// The upstream stream finished
    UpstreamEnd,
    /// Either side failed
    Error(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientClose => f.write_str("client closed"),
            Self::UpstreamEnd => f.write_str("upstream ended"),
            Self::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// `Opening -> Running -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Upstream call not yet established
    Opening = 0,
    /// Both directions pumping
    Running = 1,
    /// Terminal
    Closed = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Opening,
            1 => Self::Running,
            _ => Self::Closed,
        }
    }
}

/// Binds a client connection to an upstream stream
///
/// Both pumps share the cancellation token. [`StreamSession::close`] is
/// safe to call from either side; only the first call takes effect.
#[derive(Debug)]
pub struct StreamSession {
    id: Uuid,
    kind: StreamKind,
    cluster: String,
    target: String,
    cancel: CancellationToken,
    state: AtomicU8,
    reason: OnceLock<CloseReason>,
}

impl StreamSession {
    /// New session in the `Opening` state
    pub fn new(kind: StreamKind, cluster: impl Into<String>, target: impl Into<String>) -> Self {
        let session = Self {
            id: Uuid::new_v4(),
            kind,
            cluster: cluster.into(),
            target: target.into(),
            cancel: CancellationToken::new(),
            state: AtomicU8::new(SessionState::Opening as u8),
            reason: OnceLock::new(),
        };
        info!(
            session = %session.id,
            kind = %session.kind,
            cluster = %session.cluster,
            target = %session.target,
            "stream session opened"
        );
        session
    }

    /// Session id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move `Opening -> Running`; false when already closed
    pub fn mark_running(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Opening as u8,
                SessionState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Close the session; returns true only for the call that closed it
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.reason.set(reason).is_err() {
            return false;
        }
        self.state
            .store(SessionState::Closed as u8, Ordering::Release);
        self.cancel.cancel();
        info!(
            session = %self.id,
            kind = %self.kind,
            cluster = %self.cluster,
            target = %self.target,
            reason = %self.reason.get().map(ToString::to_string).unwrap_or_default(),
            "stream session closed"
        );
        true
    }

    /// Reason recorded by the first close
    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.reason.get()
    }

    /// Whether the session has been closed
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Resolves once the session is closed
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.close(CloseReason::Error("session dropped".into()));
    }
}
