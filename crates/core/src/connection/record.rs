/// Connection record
///
/// One endpoint tracked by the registry: either backed by a socket from
/// the socket layer or linked in-process to a peer record. Kind-specific
/// data lives in `KindData`, so only directory records can carry a
/// rendezvous query.

use super::kind::{ConnectionId, ConnectionKind, ConnectionState, DirPurpose, Purpose};
use super::rend::RendQuery;
use crate::socket::{EventHandle, Interest, SocketToken};
use std::net::IpAddr;
use veilnet_common::{Fingerprint, Timestamp};

/// What carries a connection's bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportHandle {
    /// No socket yet
    Unconnected,

    /// Socket owned by the socket layer
    Socket(SocketToken),

    /// In-process link, no socket
    Linked,

    /// Socket torn down
    Closed,
}

/// Readiness registrations held with the socket layer
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EventRegistrations {
    read: Option<EventHandle>,
    write: Option<EventHandle>,
}

impl EventRegistrations {
    pub fn get(&self, interest: Interest) -> Option<EventHandle> {
        match interest {
            Interest::Readable => self.read,
            Interest::Writable => self.write,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }

    /// Store a handle, returning the one it replaces
    pub(crate) fn set(&mut self, interest: Interest, handle: EventHandle) -> Option<EventHandle> {
        match interest {
            Interest::Readable => self.read.replace(handle),
            Interest::Writable => self.write.replace(handle),
        }
    }

    /// Forget a handle that already fired
    pub(crate) fn clear(&mut self, handle: EventHandle) -> bool {
        if self.read == Some(handle) {
            self.read = None;
            true
        } else if self.write == Some(handle) {
            self.write = None;
            true
        } else {
            false
        }
    }

    /// Take every handle; a second call yields nothing
    pub(crate) fn take_all(&mut self) -> Vec<EventHandle> {
        self.read.take().into_iter().chain(self.write.take()).collect()
    }
}

/// Two-phase lifecycle of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Usable and visible to every lookup
    Live,

    /// Marked for close, waiting for the next sweep
    Closing,

    /// Removed from the registry
    Reclaimed,
}

/// Directory connection data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirData {
    /// Opaque resource name from the request builder (e.g. a consensus flavor)
    pub resource: Option<String>,

    rend_query: Option<RendQuery>,
}

impl DirData {
    pub fn rend_query(&self) -> Option<&RendQuery> {
        self.rend_query.as_ref()
    }
}

/// Onion-relay link data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrData {
    /// Identity of the relay at the other end, once known
    pub identity: Option<Fingerprint>,
}

/// Kind-specific extension data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KindData {
    Or(OrData),
    Exit,
    Ap,
    Dir(DirData),
    Control,
}

impl KindData {
    fn for_kind(kind: ConnectionKind) -> Self {
        match kind {
            ConnectionKind::Or => Self::Or(OrData::default()),
            ConnectionKind::Exit => Self::Exit,
            ConnectionKind::Ap => Self::Ap,
            ConnectionKind::Dir => Self::Dir(DirData::default()),
            ConnectionKind::Control => Self::Control,
        }
    }

    fn kind(&self) -> ConnectionKind {
        match self {
            Self::Or(_) => ConnectionKind::Or,
            Self::Exit => ConnectionKind::Exit,
            Self::Ap => ConnectionKind::Ap,
            Self::Dir(_) => ConnectionKind::Dir,
            Self::Control => ConnectionKind::Control,
        }
    }
}

/// A tracked connection
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    kind: ConnectionKind,
    state: ConnectionState,
    purpose: Purpose,
    address: Option<IpAddr>,
    port: u16,
    pub(crate) transport: TransportHandle,
    pub(crate) linked_peer: Option<ConnectionId>,
    pub(crate) events: EventRegistrations,
    marked_for_close: bool,
    pub(crate) lifecycle: Lifecycle,
    data: KindData,
    created_at: Timestamp,
    marked_at: Option<Timestamp>,
    close_reason: Option<String>,
}

impl Connection {
    /// Allocate a record in the kind's initial state
    pub fn new(id: ConnectionId, kind: ConnectionKind, purpose: Purpose) -> Self {
        Self {
            id,
            kind,
            state: kind.initial_state(),
            purpose,
            address: None,
            port: 0,
            transport: TransportHandle::Unconnected,
            linked_peer: None,
            events: EventRegistrations::default(),
            marked_for_close: false,
            lifecycle: Lifecycle::Live,
            data: KindData::for_kind(kind),
            created_at: Timestamp::now(),
            marked_at: None,
            close_reason: None,
        }
    }

    /// Allocate a directory record fetching a hidden service descriptor
    pub fn new_rend_fetch(id: ConnectionId, query: RendQuery) -> Self {
        let mut conn = Self::new(
            id,
            ConnectionKind::Dir,
            Purpose::Dir(DirPurpose::FetchRendDesc),
        );
        conn.data = KindData::Dir(DirData {
            resource: None,
            rend_query: Some(query),
        });
        conn
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn address(&self) -> Option<IpAddr> {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn transport(&self) -> TransportHandle {
        self.transport
    }

    pub fn linked_peer(&self) -> Option<ConnectionId> {
        self.linked_peer
    }

    /// Whether this record was created as half of an in-process pair
    pub fn is_linked(&self) -> bool {
        self.transport == TransportHandle::Linked
    }

    pub fn events(&self) -> &EventRegistrations {
        &self.events
    }

    pub fn is_marked_for_close(&self) -> bool {
        self.marked_for_close
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn marked_at(&self) -> Option<Timestamp> {
        self.marked_at
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    /// Eligible for "find a reusable connection" lookups
    pub fn is_active(&self) -> bool {
        !self.marked_for_close && self.lifecycle == Lifecycle::Live
    }

    pub fn data(&self) -> &KindData {
        &self.data
    }

    pub fn dir_data(&self) -> Option<&DirData> {
        match &self.data {
            KindData::Dir(data) => Some(data),
            _ => None,
        }
    }

    pub fn or_data_mut(&mut self) -> Option<&mut OrData> {
        match &mut self.data {
            KindData::Or(data) => Some(data),
            _ => None,
        }
    }

    pub fn resource(&self) -> Option<&str> {
        self.dir_data().and_then(|d| d.resource.as_deref())
    }

    /// Set the opaque request resource of a directory record
    pub fn set_resource(&mut self, resource: impl Into<String>) -> Result<(), StateError> {
        match &mut self.data {
            KindData::Dir(data) => {
                data.resource = Some(resource.into());
                Ok(())
            }
            _ => Err(StateError::NotDirectory(self.kind)),
        }
    }

    pub fn rend_query(&self) -> Option<&RendQuery> {
        self.dir_data().and_then(DirData::rend_query)
    }

    /// Mutable access for recording tried directories
    pub fn rend_query_mut(&mut self) -> Option<&mut RendQuery> {
        match &mut self.data {
            KindData::Dir(data) => data.rend_query.as_mut(),
            _ => None,
        }
    }

    /// Move to `next`, rejecting transitions the kind does not allow
    pub fn set_state(&mut self, next: ConnectionState) -> Result<(), StateError> {
        if next.kind() != self.kind {
            return Err(StateError::KindMismatch {
                kind: self.kind,
                state: next,
            });
        }
        if !self.state.can_transition_to(next) {
            return Err(StateError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Change the purpose, keeping the rendezvous query invariant
    ///
    /// A directory record with a rendezvous query may only move between the
    /// fetch purposes; one without a query may never enter them.
    pub fn set_purpose(&mut self, purpose: Purpose) -> Result<(), StateError> {
        if !self.kind.accepts_purpose(purpose) {
            return Err(StateError::PurposeMismatch {
                kind: self.kind,
                purpose,
            });
        }
        if self.rend_query().is_some() != purpose.is_rend_fetch() {
            return Err(StateError::RendPurpose(purpose));
        }
        // A fetched descriptor is never fetched again on the same connection
        if self.purpose == Purpose::Dir(DirPurpose::HasFetchedRendDesc)
            && purpose == Purpose::Dir(DirPurpose::FetchRendDesc)
        {
            return Err(StateError::RendPurpose(purpose));
        }
        self.purpose = purpose;
        Ok(())
    }

    pub(crate) fn set_endpoint(&mut self, address: IpAddr, port: u16) {
        self.address = Some(address);
        self.port = port;
    }

    pub(crate) fn force_failed(&mut self) {
        self.state = self.kind.failed_state();
    }

    /// Returns false if the record was already marked
    pub(crate) fn mark(&mut self, reason: Option<&str>) -> bool {
        if self.marked_for_close {
            return false;
        }
        self.marked_for_close = true;
        self.lifecycle = Lifecycle::Closing;
        self.marked_at = Some(Timestamp::now());
        self.close_reason = reason.map(str::to_string);
        true
    }

    /// Check the record's internal invariants
    pub fn check_invariants(&self) -> Result<(), StateError> {
        if self.state.kind() != self.kind || self.data.kind() != self.kind {
            return Err(StateError::KindMismatch {
                kind: self.kind,
                state: self.state,
            });
        }
        if !self.kind.accepts_purpose(self.purpose) {
            return Err(StateError::PurposeMismatch {
                kind: self.kind,
                purpose: self.purpose,
            });
        }
        if self.rend_query().is_some() != self.purpose.is_rend_fetch() {
            return Err(StateError::RendPurpose(self.purpose));
        }
        if self.linked_peer.is_some() && self.transport != TransportHandle::Linked {
            return Err(StateError::Inconsistent(
                "linked peer on a socket-backed connection",
            ));
        }
        if self.linked_peer == Some(self.id) {
            return Err(StateError::Inconsistent("connection linked to itself"));
        }
        if self.marked_for_close != (self.lifecycle != Lifecycle::Live) {
            return Err(StateError::Inconsistent(
                "close mark disagrees with lifecycle",
            ));
        }
        Ok(())
    }
}

/// Errors from mutating a record
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("State {state} does not belong to a {kind} connection")]
    KindMismatch {
        kind: ConnectionKind,
        state: ConnectionState,
    },

    #[error("Illegal transition from {from} to {to}")]
    IllegalTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("Purpose {purpose} is not valid for a {kind} connection")]
    PurposeMismatch { kind: ConnectionKind, purpose: Purpose },

    #[error("Purpose {0} disagrees with the rendezvous query")]
    RendPurpose(Purpose),

    #[error("{0} connection has no directory data")]
    NotDirectory(ConnectionKind),

    #[error("Inconsistent connection: {0}")]
    Inconsistent(&'static str),
}
