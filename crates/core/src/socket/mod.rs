/// Socket and readiness-notification layer
///
/// The connection manager never touches sockets itself. It asks a
/// `SocketLayer` to start non-blocking connects, to watch sockets for
/// readiness and to tear them down. Completion is reported later as an
/// `IoEvent`, which the manager checks against the record's close mark
/// before acting on it.

mod scripted;
mod tokio_layer;

pub use scripted::{ScriptedConnect, ScriptedSocketLayer};
pub use tokio_layer::TokioSocketLayer;

use crate::connection::ConnectionId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Opaque socket owned by the socket layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SocketToken(pub u64);

impl fmt::Display for SocketToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket#{}", self.0)
    }
}

/// Handle of one readiness registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventHandle(pub u64);

/// Readiness a registration waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interest {
    Readable,
    Writable,
}

/// Why a connect attempt failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectFailure {
    pub kind: io::ErrorKind,
    pub message: String,
}

impl ConnectFailure {
    pub fn new(kind: io::ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timed_out() -> Self {
        Self::new(io::ErrorKind::TimedOut, "connect timed out")
    }

    /// No event loop to drive the connect
    pub fn no_runtime() -> Self {
        Self::new(io::ErrorKind::Unsupported, "no event loop running")
    }
}

impl From<&io::Error> for ConnectFailure {
    fn from(err: &io::Error) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.message, self.kind)
    }
}

/// Immediate result of a non-blocking connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Connected before the call returned
    Connected(SocketToken),

    /// Completion will arrive as an `IoEvent`
    InProgress(SocketToken),

    Failed(ConnectFailure),
}

/// Deferred notification from the socket layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoEvent {
    Connected {
        conn: ConnectionId,
        socket: SocketToken,
    },
    ConnectFailed {
        conn: ConnectionId,
        error: ConnectFailure,
    },
    Readable {
        conn: ConnectionId,
        handle: EventHandle,
    },
    Writable {
        conn: ConnectionId,
        handle: EventHandle,
    },
}

impl IoEvent {
    pub fn connection(&self) -> ConnectionId {
        match self {
            Self::Connected { conn, .. }
            | Self::ConnectFailed { conn, .. }
            | Self::Readable { conn, .. }
            | Self::Writable { conn, .. } => *conn,
        }
    }
}

/// Capability the connection manager uses to reach the network
pub trait SocketLayer {
    /// Start connecting `conn` to `target` without blocking
    fn connect_nonblocking(&mut self, conn: ConnectionId, target: SocketAddr) -> ConnectOutcome;

    /// Watch `socket` for `interest`
    ///
    /// Returns `None` when no event loop is available; callers carry on
    /// without a registration.
    fn register(
        &mut self,
        conn: ConnectionId,
        socket: SocketToken,
        interest: Interest,
    ) -> Option<EventHandle>;

    /// Drop a registration; unknown or already released handles are ignored
    fn unregister(&mut self, handle: EventHandle);

    /// Tear down a socket; closing twice is a no-op
    fn close(&mut self, socket: SocketToken);
}
