/// Connection identifiers, kinds, states and purposes
///
/// Each kind has its own state enum; `ConnectionState` tags them so a record
/// can never hold a state of another kind.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process-unique identifier of a connection record
///
/// Assigned by the registry in increasing order and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Conn({})", self.0)
    }
}

/// Kind of endpoint a connection represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConnectionKind {
    /// Onion-relay link to another relay
    Or,

    /// Exit stream toward a destination
    Exit,

    /// Application proxy stream (SOCKS client side)
    Ap,

    /// Directory protocol connection
    Dir,

    /// Controller connection
    Control,
}

impl ConnectionKind {
    pub const ALL: [ConnectionKind; 5] = [
        ConnectionKind::Or,
        ConnectionKind::Exit,
        ConnectionKind::Ap,
        ConnectionKind::Dir,
        ConnectionKind::Control,
    ];

    /// Whether `open` can start an outbound socket connect for this kind
    pub fn is_outbound(&self) -> bool {
        matches!(self, Self::Or | Self::Exit | Self::Dir)
    }

    /// State a freshly allocated record starts in
    pub fn initial_state(&self) -> ConnectionState {
        match self {
            Self::Or => ConnectionState::Or(OrState::Connecting),
            Self::Exit => ConnectionState::Exit(ExitState::Connecting),
            Self::Ap => ConnectionState::Ap(ApState::SocksWait),
            Self::Dir => ConnectionState::Dir(DirState::Connecting),
            Self::Control => ConnectionState::Control(ControlState::Open),
        }
    }

    /// State once the transport is usable (connected socket or linked peer)
    pub fn connected_state(&self) -> ConnectionState {
        match self {
            Self::Or => ConnectionState::Or(OrState::Handshaking),
            Self::Exit => ConnectionState::Exit(ExitState::Open),
            Self::Ap => ConnectionState::Ap(ApState::CircuitWait),
            Self::Dir => ConnectionState::Dir(DirState::ClientSending),
            Self::Control => ConnectionState::Control(ControlState::Open),
        }
    }

    pub fn failed_state(&self) -> ConnectionState {
        match self {
            Self::Or => ConnectionState::Or(OrState::Failed),
            Self::Exit => ConnectionState::Exit(ExitState::Failed),
            Self::Ap => ConnectionState::Ap(ApState::Failed),
            Self::Dir => ConnectionState::Dir(DirState::Failed),
            Self::Control => ConnectionState::Control(ControlState::Failed),
        }
    }

    /// Whether `purpose` is meaningful for this kind
    pub fn accepts_purpose(&self, purpose: Purpose) -> bool {
        match (self, purpose) {
            (Self::Dir, Purpose::Dir(_)) => true,
            (Self::Exit, Purpose::Exit(_)) => true,
            (Self::Or | Self::Ap | Self::Control, Purpose::Unspecified) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Or => "OR",
            Self::Exit => "Exit",
            Self::Ap => "Socks",
            Self::Dir => "Directory",
            Self::Control => "Control",
        };
        f.write_str(name)
    }
}

/// Directory client states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DirState {
    /// Waiting for the non-blocking connect to finish
    Connecting,

    /// Sending the request
    ClientSending,

    /// Reading the response
    ClientReading,

    /// Response fully received
    ClientFinished,

    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrState {
    Connecting,
    Handshaking,
    Open,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitState {
    Connecting,
    Open,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApState {
    /// Waiting for the SOCKS request
    SocksWait,

    /// Waiting for a usable circuit
    CircuitWait,

    /// Waiting for the exit to confirm the stream
    ConnectWait,

    Open,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlState {
    Open,
    Failed,
}

/// Kind-tagged connection state
///
/// The tag always agrees with the owning record's kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Or(OrState),
    Exit(ExitState),
    Ap(ApState),
    Dir(DirState),
    Control(ControlState),
}

impl ConnectionState {
    pub fn kind(&self) -> ConnectionKind {
        match self {
            Self::Or(_) => ConnectionKind::Or,
            Self::Exit(_) => ConnectionKind::Exit,
            Self::Ap(_) => ConnectionKind::Ap,
            Self::Dir(_) => ConnectionKind::Dir,
            Self::Control(_) => ConnectionKind::Control,
        }
    }

    /// Still waiting on the transport to come up
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            Self::Or(OrState::Connecting)
                | Self::Exit(ExitState::Connecting)
                | Self::Dir(DirState::Connecting)
        )
    }

    /// No further transitions are legal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Dir(DirState::ClientFinished | DirState::Failed)
                | Self::Or(OrState::Failed)
                | Self::Exit(ExitState::Failed)
                | Self::Ap(ApState::Failed)
                | Self::Control(ControlState::Failed)
        )
    }

    pub fn is_failed(&self) -> bool {
        *self == self.kind().failed_state()
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        if *self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }

        match (self, next) {
            (Self::Dir(from), Self::Dir(to)) => matches!(
                (from, to),
                (DirState::Connecting, DirState::ClientSending)
                    | (DirState::ClientSending, DirState::ClientReading)
                    | (DirState::ClientReading, DirState::ClientFinished)
                    | (_, DirState::Failed)
            ),
            (Self::Or(from), Self::Or(to)) => matches!(
                (from, to),
                (OrState::Connecting, OrState::Handshaking)
                    | (OrState::Handshaking, OrState::Open)
                    | (_, OrState::Failed)
            ),
            (Self::Exit(_), Self::Exit(to)) => matches!(to, ExitState::Open | ExitState::Failed),
            (Self::Ap(from), Self::Ap(to)) => matches!(
                (from, to),
                (ApState::SocksWait, ApState::CircuitWait)
                    | (ApState::CircuitWait, ApState::ConnectWait)
                    | (ApState::ConnectWait, ApState::Open)
                    | (_, ApState::Failed)
            ),
            (Self::Control(_), Self::Control(to)) => to == ControlState::Failed,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Or(s) => write!(f, "OR/{:?}", s),
            Self::Exit(s) => write!(f, "Exit/{:?}", s),
            Self::Ap(s) => write!(f, "Socks/{:?}", s),
            Self::Dir(s) => write!(f, "Directory/{:?}", s),
            Self::Control(s) => write!(f, "Control/{:?}", s),
        }
    }
}

/// What a directory connection is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DirPurpose {
    FetchConsensus,
    FetchCertificate,
    FetchServerDesc,
    FetchMicrodesc,
    UploadDir,

    /// Fetching a hidden service descriptor
    FetchRendDesc,

    /// The descriptor fetch succeeded; no further retries
    HasFetchedRendDesc,

    UploadRendDesc,
}

impl DirPurpose {
    /// Purposes that carry a rendezvous query
    pub fn is_rend_fetch(&self) -> bool {
        matches!(self, Self::FetchRendDesc | Self::HasFetchedRendDesc)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitPurpose {
    Connect,
    Resolve,
}

/// Intent of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Purpose {
    Unspecified,
    Dir(DirPurpose),
    Exit(ExitPurpose),
}

impl Purpose {
    pub fn is_rend_fetch(&self) -> bool {
        matches!(self, Self::Dir(p) if p.is_rend_fetch())
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unspecified => f.write_str("unspecified"),
            Self::Dir(p) => write!(f, "dir:{:?}", p),
            Self::Exit(p) => write!(f, "exit:{:?}", p),
        }
    }
}
