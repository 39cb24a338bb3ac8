/// Connection lifecycle manager
///
/// Owns the registry and the socket layer and drives each record through
/// open, connect completion, mark-for-close and sweep:
/// - `open` registers the record before connecting so concurrent lookups
///   see it in flight
/// - `mark_for_close` only flags and queues; nothing is freed inline
/// - `sweep` is the single place records leave the registry, releasing
///   event registrations and severing linked peers as it goes
/// - deferred socket events are dropped for records already marked

use super::kind::{ConnectionId, ConnectionKind, ConnectionState, DirPurpose, Purpose};
use super::record::{Connection, StateError, TransportHandle};
use super::registry::{ConnectionRegistry, RegistryError, RegistryStats};
use super::rend::{RendQuery, RendQueryError};
use crate::socket::{ConnectOutcome, Interest, IoEvent, SocketLayer};
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, info, warn};
use veilnet_common::{connection, Fingerprint, NodeConfig, VeilNetError};

/// Limits for the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Maximum number of records, marked ones included
    pub max_connections: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_connections: connection::MAX_CONNECTIONS,
        }
    }
}

impl From<&NodeConfig> for ManagerConfig {
    fn from(config: &NodeConfig) -> Self {
        Self {
            max_connections: config.max_connections,
        }
    }
}

/// Everything needed to open an outbound connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub kind: ConnectionKind,
    pub address: IpAddr,
    pub port: u16,
    pub purpose: Purpose,

    /// Opaque directory resource, kept for lookups and logging
    pub resource: Option<String>,

    /// Present only for hidden service descriptor fetches
    pub rend_query: Option<RendQuery>,
}

impl OpenRequest {
    pub fn new(kind: ConnectionKind, address: IpAddr, port: u16, purpose: Purpose) -> Self {
        Self {
            kind,
            address,
            port,
            purpose,
            resource: None,
            rend_query: None,
        }
    }

    /// Directory request with the given purpose
    pub fn directory(address: IpAddr, port: u16, purpose: DirPurpose) -> Self {
        Self::new(ConnectionKind::Dir, address, port, Purpose::Dir(purpose))
    }

    /// Hidden service descriptor fetch from one directory
    pub fn rend_fetch(address: IpAddr, port: u16, query: RendQuery) -> Self {
        let mut request = Self::directory(address, port, DirPurpose::FetchRendDesc);
        request.rend_query = Some(query);
        request
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn target(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    fn validate(&self) -> Result<(), ConnectionError> {
        if !self.kind.is_outbound() {
            return Err(ConnectionError::NotOutbound(self.kind));
        }
        if self.port == 0 {
            return Err(ConnectionError::InvalidTarget(self.target()));
        }
        if !self.kind.accepts_purpose(self.purpose) {
            return Err(StateError::PurposeMismatch {
                kind: self.kind,
                purpose: self.purpose,
            }
            .into());
        }
        let wants_query = self.purpose == Purpose::Dir(DirPurpose::FetchRendDesc);
        if self.rend_query.is_some() != wants_query {
            return Err(StateError::RendPurpose(self.purpose).into());
        }
        if self.resource.is_some() && self.kind != ConnectionKind::Dir {
            return Err(StateError::NotDirectory(self.kind).into());
        }
        Ok(())
    }
}

/// What one sweep reclaimed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepStats {
    pub reclaimed: usize,
    pub released_events: usize,
    pub closed_sockets: usize,
    pub severed_links: usize,

    /// Severed peers that were not themselves marked for close
    pub dangling_peers: usize,
}

/// Connection lifecycle manager
pub struct ConnectionManager<S: SocketLayer> {
    registry: ConnectionRegistry,
    socket: S,
    config: ManagerConfig,
}

impl<S: SocketLayer> ConnectionManager<S> {
    /// Create a manager with a fresh, empty registry
    pub fn new(socket: S, config: ManagerConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            socket,
            config,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ConnectionRegistry {
        &mut self.registry
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    fn ensure_capacity(&self, needed: usize) -> Result<(), ConnectionError> {
        if self.registry.len() + needed > self.config.max_connections {
            return Err(ConnectionError::CapacityReached(self.config.max_connections));
        }
        Ok(())
    }

    /// Open an outbound connection
    ///
    /// The record is registered before the connect starts. A connect that
    /// fails right away still yields `Ok`: the record is left in its failed
    /// state and marked for close, so callers must check
    /// `is_marked_for_close` before using it.
    pub fn open(&mut self, request: OpenRequest) -> Result<ConnectionId, ConnectionError> {
        request.validate()?;
        self.ensure_capacity(1)?;

        let target = request.target();
        let id = self.registry.allocate_id()?;
        let mut conn = match request.rend_query {
            Some(query) => Connection::new_rend_fetch(id, query),
            None => Connection::new(id, request.kind, request.purpose),
        };
        conn.set_endpoint(request.address, request.port);
        if let Some(resource) = request.resource {
            conn.set_resource(resource)?;
        }
        self.registry.register(conn)?;

        debug!("Opening {} {} to {} ({})", request.kind, id, target, request.purpose);

        let outcome = self.socket.connect_nonblocking(id, target);
        let conn = self
            .registry
            .get_mut(id)
            .ok_or(ConnectionError::NotFound(id))?;

        match outcome {
            ConnectOutcome::Connected(socket) => {
                conn.transport = TransportHandle::Socket(socket);
                conn.set_state(request.kind.connected_state())?;
                debug!("{} connected immediately on {}", id, socket);
            }
            ConnectOutcome::InProgress(socket) => {
                conn.transport = TransportHandle::Socket(socket);
            }
            ConnectOutcome::Failed(error) => {
                info!("Connect for {} to {} failed: {}", id, target, error);
                conn.force_failed();
                conn.mark(Some("connect failed"));
                self.registry.enqueue_close(id);
            }
        }

        Ok(id)
    }

    /// Create two socketless records that exchange data in-process
    pub fn open_linked_pair(
        &mut self,
        first: (ConnectionKind, Purpose),
        second: (ConnectionKind, Purpose),
    ) -> Result<(ConnectionId, ConnectionId), ConnectionError> {
        for (kind, purpose) in [first, second] {
            if !kind.accepts_purpose(purpose) {
                return Err(StateError::PurposeMismatch { kind, purpose }.into());
            }
            if purpose.is_rend_fetch() {
                return Err(StateError::RendPurpose(purpose).into());
            }
        }
        self.ensure_capacity(2)?;

        let a = self.registry.allocate_id()?;
        let b = self.registry.allocate_id()?;

        let mut conn_a = Connection::new(a, first.0, first.1);
        let mut conn_b = Connection::new(b, second.0, second.1);
        for (conn, peer) in [(&mut conn_a, b), (&mut conn_b, a)] {
            conn.transport = TransportHandle::Linked;
            conn.linked_peer = Some(peer);
            conn.set_state(conn.kind().connected_state())?;
        }

        self.registry.register(conn_a)?;
        if let Err(err) = self.registry.register(conn_b) {
            // Never leave half a pair behind
            self.registry.unregister(a);
            return Err(err.into());
        }

        debug!("Linked {} ({}) with {} ({})", a, first.0, b, second.0);
        Ok((a, b))
    }

    /// Break a link on both sides at once
    ///
    /// Returns the former peer, if there was one.
    pub fn unlink(&mut self, id: ConnectionId) -> Result<Option<ConnectionId>, ConnectionError> {
        let conn = self
            .registry
            .get_mut(id)
            .ok_or(ConnectionError::NotFound(id))?;
        let Some(peer_id) = conn.linked_peer.take() else {
            return Ok(None);
        };

        if let Some(peer) = self.registry.get_mut(peer_id) {
            if peer.linked_peer == Some(id) {
                peer.linked_peer = None;
            }
        }
        debug!("Unlinked {} from {}", id, peer_id);
        Ok(Some(peer_id))
    }

    /// Move a record to a new state
    pub fn set_state(
        &mut self,
        id: ConnectionId,
        state: ConnectionState,
    ) -> Result<(), ConnectionError> {
        let conn = self
            .registry
            .get_mut(id)
            .ok_or(ConnectionError::NotFound(id))?;
        conn.set_state(state)?;
        Ok(())
    }

    /// Change a record's purpose
    pub fn set_purpose(&mut self, id: ConnectionId, purpose: Purpose) -> Result<(), ConnectionError> {
        let conn = self
            .registry
            .get_mut(id)
            .ok_or(ConnectionError::NotFound(id))?;
        conn.set_purpose(purpose)?;
        Ok(())
    }

    /// Put a record in its failed state and mark it for close
    pub fn fail(&mut self, id: ConnectionId, reason: &str) -> Result<(), ConnectionError> {
        let conn = self
            .registry
            .get_mut(id)
            .ok_or(ConnectionError::NotFound(id))?;
        if conn.is_marked_for_close() {
            return Ok(());
        }
        if !conn.state().is_terminal() {
            conn.force_failed();
        }
        self.mark_for_close_with_reason(id, Some(reason))?;
        Ok(())
    }

    /// Ask the socket layer to watch a record's socket
    ///
    /// Returns false when no registration could be made (no socket yet,
    /// or no event loop).
    pub fn register_events(
        &mut self,
        id: ConnectionId,
        interest: Interest,
    ) -> Result<bool, ConnectionError> {
        let conn = self
            .registry
            .get_mut(id)
            .ok_or(ConnectionError::NotFound(id))?;
        if !conn.is_active() {
            return Err(ConnectionError::MarkedForClose(id));
        }
        let TransportHandle::Socket(socket) = conn.transport else {
            return Ok(false);
        };

        let Some(handle) = self.socket.register(id, socket, interest) else {
            return Ok(false);
        };
        if let Some(replaced) = conn.events.set(interest, handle) {
            self.socket.unregister(replaced);
        }
        Ok(true)
    }

    /// Flag a record for close; it is freed at the next sweep
    ///
    /// Returns false if it was already marked. The linked peer, if any, is
    /// left alone.
    pub fn mark_for_close(&mut self, id: ConnectionId) -> Result<bool, ConnectionError> {
        self.mark_for_close_with_reason(id, None)
    }

    pub fn mark_for_close_with_reason(
        &mut self,
        id: ConnectionId,
        reason: Option<&str>,
    ) -> Result<bool, ConnectionError> {
        let conn = self
            .registry
            .get_mut(id)
            .ok_or(ConnectionError::NotFound(id))?;

        if !conn.mark(reason) {
            debug!("Duplicate mark for close of {}", id);
            return Ok(false);
        }
        self.registry.enqueue_close(id);

        debug!(
            "Marked {} {} for close{}",
            id,
            self.registry.get(id).map_or(String::new(), |c| c.kind().to_string()),
            reason.map(|r| format!(": {}", r)).unwrap_or_default()
        );
        Ok(true)
    }

    /// Stop a record's events and socket now, without freeing it
    pub fn close_immediate(&mut self, id: ConnectionId) -> Result<(), ConnectionError> {
        let conn = self
            .registry
            .get_mut(id)
            .ok_or(ConnectionError::NotFound(id))?;
        release_transport(&mut self.socket, conn);
        Ok(())
    }

    /// Reclaim every record marked for close
    ///
    /// Must only run once all callbacks of the current round are done.
    pub fn sweep(&mut self) -> SweepStats {
        let mut stats = SweepStats::default();

        for id in self.registry.take_closeable() {
            let Some(mut conn) = self.registry.unregister(id) else {
                continue;
            };

            let (events, sockets) = release_transport(&mut self.socket, &mut conn);
            stats.released_events += events;
            stats.closed_sockets += sockets;

            if let Some(peer_id) = conn.linked_peer.take() {
                if let Some(peer) = self.registry.get_mut(peer_id) {
                    if peer.linked_peer == Some(id) {
                        peer.linked_peer = None;
                        stats.severed_links += 1;
                        if !peer.is_marked_for_close() {
                            warn!(
                                "Reclaimed {} while linked {} is still open",
                                id, peer_id
                            );
                            stats.dangling_peers += 1;
                        }
                    }
                }
            }

            stats.reclaimed += 1;
            debug!("Reclaimed {} {}", conn.kind(), id);
        }

        stats
    }

    /// Apply a deferred notification from the socket layer
    ///
    /// Returns true if the event was acted upon. Events for records that are
    /// gone or already marked for close are dropped.
    pub fn handle_io_event(&mut self, event: IoEvent) -> bool {
        let id = event.connection();
        let active = self
            .registry
            .get(id)
            .map_or(false, Connection::is_active);

        if !active {
            debug!("Ignoring {:?} for closed {}", event, id);
            if let IoEvent::Connected { socket, .. } = event {
                let owned = self
                    .registry
                    .get(id)
                    .map_or(false, |c| c.transport() == TransportHandle::Socket(socket));
                if !owned {
                    self.socket.close(socket);
                }
            }
            return false;
        }

        match event {
            IoEvent::Connected { socket, .. } => {
                let Some(conn) = self.registry.get_mut(id) else {
                    return false;
                };
                if conn.transport != TransportHandle::Socket(socket) {
                    debug!("{} does not own {}, closing it", id, socket);
                    self.socket.close(socket);
                    return false;
                }
                if !conn.state().is_connecting() {
                    debug!("{} got a second connect completion", id);
                    return false;
                }
                if let Err(err) = conn.set_state(conn.kind().connected_state()) {
                    warn!("Cannot advance {}: {}", id, err);
                    return false;
                }
                debug!("{} connected on {}", id, socket);
                true
            }
            IoEvent::ConnectFailed { error, .. } => {
                let connecting = self
                    .registry
                    .get(id)
                    .map_or(false, |c| c.state().is_connecting());
                if !connecting {
                    return false;
                }
                info!("Connect for {} failed: {}", id, error);
                self.fail(id, "connect failed").is_ok()
            }
            IoEvent::Readable { handle, .. } | IoEvent::Writable { handle, .. } => self
                .registry
                .get_mut(id)
                .map_or(false, |conn| conn.events.clear(handle)),
        }
    }

    /// Retry a descriptor fetch against another hidden service directory
    ///
    /// The previous record's query, tried list included, is copied into a
    /// new directory connection; the previous record is marked for close and
    /// its copy of the query is dropped when the next sweep reclaims it.
    pub fn retry_rend_fetch(
        &mut self,
        previous: ConnectionId,
        directory: Fingerprint,
        address: IpAddr,
        port: u16,
    ) -> Result<ConnectionId, ConnectionError> {
        let conn = self
            .registry
            .get(previous)
            .ok_or(ConnectionError::NotFound(previous))?;
        if conn.purpose() != Purpose::Dir(DirPurpose::FetchRendDesc) {
            return Err(ConnectionError::NotRendFetch(previous));
        }
        let query = conn
            .rend_query()
            .ok_or(ConnectionError::NotRendFetch(previous))?
            .retry_with(directory)?;

        let next = self.open(OpenRequest::rend_fetch(address, port, query))?;
        self.mark_for_close_with_reason(previous, Some("retrying descriptor fetch"))?;

        info!(
            "Retrying descriptor fetch from {} as {} via {}",
            previous, next, directory
        );
        Ok(next)
    }

    /// Mark everything and sweep; the registry is empty afterwards
    pub fn shutdown(&mut self) -> SweepStats {
        for id in self.registry.ids() {
            if let Some(conn) = self.registry.get_mut(id) {
                if conn.mark(Some("shutting down")) {
                    self.registry.enqueue_close(id);
                }
            }
        }
        let stats = self.sweep();
        info!("Closed {} connections on shutdown", stats.reclaimed);
        stats
    }
}

/// Release a record's event registrations and socket
///
/// Safe to call any number of times; returns how many registrations and
/// sockets were actually released.
fn release_transport<S: SocketLayer>(socket_layer: &mut S, conn: &mut Connection) -> (usize, usize) {
    let handles = conn.events.take_all();
    let released = handles.len();
    for handle in handles {
        socket_layer.unregister(handle);
    }

    let mut closed = 0;
    if let TransportHandle::Socket(socket) = conn.transport {
        socket_layer.close(socket);
        conn.transport = TransportHandle::Closed;
        closed = 1;
    }
    (released, closed)
}

/// Connection manager errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection {0} not found")]
    NotFound(ConnectionId),

    #[error("Connection {0} is marked for close")]
    MarkedForClose(ConnectionId),

    #[error("{0} connections cannot be opened outbound")]
    NotOutbound(ConnectionKind),

    #[error("Invalid target {0}")]
    InvalidTarget(SocketAddr),

    #[error("Connection limit of {0} reached")]
    CapacityReached(usize),

    #[error("Connection {0} is not fetching a descriptor")]
    NotRendFetch(ConnectionId),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    RendQuery(#[from] RendQueryError),
}

impl ConnectionError {
    /// Whether the registry can no longer be trusted
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Registry(_))
    }
}

impl From<ConnectionError> for VeilNetError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::NotFound(id) => VeilNetError::ConnectionNotFound(id.as_u64()),
            ConnectionError::InvalidTarget(addr) => VeilNetError::InvalidAddress(addr.to_string()),
            err if err.is_fatal() => VeilNetError::invariant(err.to_string()),
            err => VeilNetError::network(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::kind::DirState;
    use crate::connection::record::Lifecycle;
    use crate::socket::{EventHandle, ScriptedConnect, ScriptedSocketLayer, SocketToken};
    use std::io;

    const TEST_PORT: u16 = 12345;

    fn manager() -> ConnectionManager<ScriptedSocketLayer> {
        ConnectionManager::new(ScriptedSocketLayer::new(), ManagerConfig::default())
    }

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    fn fingerprint(byte: u8) -> Fingerprint {
        Fingerprint::from_bytes([byte; 20])
    }

    #[test]
    fn test_open_immediate_connect() {
        let mut manager = manager();
        let id = manager
            .open(OpenRequest::directory(localhost(), TEST_PORT, DirPurpose::FetchConsensus))
            .unwrap();

        let conn = manager.registry().get(id).unwrap();
        assert_eq!(conn.state(), ConnectionState::Dir(DirState::ClientSending));
        assert_eq!(conn.transport(), TransportHandle::Socket(SocketToken(50)));
        assert_eq!(conn.address(), Some(localhost()));
        assert_eq!(conn.port(), TEST_PORT);
        assert!(!conn.is_marked_for_close());
        assert_eq!(manager.socket().connect_calls().len(), 1);
        assert!(manager.registry().check_consistency().is_ok());
    }

    #[test]
    fn test_open_in_progress_then_connected() {
        let mut manager = manager();
        manager.socket_mut().push(ScriptedConnect::InProgress);
        let id = manager
            .open(OpenRequest::directory(localhost(), TEST_PORT, DirPurpose::FetchConsensus))
            .unwrap();

        assert_eq!(
            manager.registry().get(id).unwrap().state(),
            ConnectionState::Dir(DirState::Connecting)
        );

        let applied = manager.handle_io_event(IoEvent::Connected {
            conn: id,
            socket: SocketToken(50),
        });
        assert!(applied);
        assert_eq!(
            manager.registry().get(id).unwrap().state(),
            ConnectionState::Dir(DirState::ClientSending)
        );

        // A second completion changes nothing
        assert!(!manager.handle_io_event(IoEvent::Connected {
            conn: id,
            socket: SocketToken(50),
        }));
    }

    #[test]
    fn test_open_immediate_failure_is_registered_and_marked() {
        let mut manager = manager();
        manager
            .socket_mut()
            .push(ScriptedConnect::Fail(io::ErrorKind::ConnectionRefused));

        let id = manager
            .open(OpenRequest::directory(localhost(), TEST_PORT, DirPurpose::FetchConsensus))
            .unwrap();

        let conn = manager.registry().get(id).unwrap();
        assert!(conn.is_marked_for_close());
        assert_eq!(conn.state(), ConnectionState::Dir(DirState::Failed));
        assert_eq!(manager.registry().closeable(), &[id]);
        assert!(manager.registry().by_kind(ConnectionKind::Dir).is_none());

        let stats = manager.sweep();
        assert_eq!(stats.reclaimed, 1);
        assert!(manager.registry().get(id).is_none());
    }

    #[test]
    fn test_open_rejects_bad_requests() {
        let mut manager = manager();

        let err = manager
            .open(OpenRequest::directory(localhost(), 0, DirPurpose::FetchConsensus))
            .unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidTarget(_)));

        let err = manager
            .open(OpenRequest::new(
                ConnectionKind::Ap,
                localhost(),
                TEST_PORT,
                Purpose::Unspecified,
            ))
            .unwrap_err();
        assert_eq!(err, ConnectionError::NotOutbound(ConnectionKind::Ap));

        // A descriptor fetch needs a query
        let err = manager
            .open(OpenRequest::directory(localhost(), TEST_PORT, DirPurpose::FetchRendDesc))
            .unwrap_err();
        assert!(matches!(err, ConnectionError::State(StateError::RendPurpose(_))));

        // Nothing was registered for any of them
        assert!(manager.registry().is_empty());
        assert!(manager.socket().connect_calls().is_empty());
    }

    #[test]
    fn test_open_respects_capacity() {
        let mut manager = ConnectionManager::new(
            ScriptedSocketLayer::new(),
            ManagerConfig { max_connections: 1 },
        );
        manager
            .open(OpenRequest::directory(localhost(), TEST_PORT, DirPurpose::FetchConsensus))
            .unwrap();
        let err = manager
            .open(OpenRequest::directory(localhost(), TEST_PORT, DirPurpose::FetchMicrodesc))
            .unwrap_err();
        assert_eq!(err, ConnectionError::CapacityReached(1));
    }

    #[test]
    fn test_open_keeps_resource() {
        let mut manager = manager();
        let id = manager
            .open(
                OpenRequest::directory(localhost(), TEST_PORT, DirPurpose::FetchConsensus)
                    .with_resource("microdesc"),
            )
            .unwrap();

        let found = manager
            .registry()
            .dir_by_purpose_and_resource(DirPurpose::FetchConsensus, Some("microdesc"));
        assert_eq!(found.map(Connection::id), Some(id));
        assert!(manager
            .registry()
            .dir_by_purpose_and_resource(DirPurpose::FetchConsensus, Some("ns"))
            .is_none());
    }

    #[test]
    fn test_mark_for_close_twice() {
        let mut manager = manager();
        let id = manager
            .open(OpenRequest::directory(localhost(), TEST_PORT, DirPurpose::FetchConsensus))
            .unwrap();

        assert_eq!(manager.mark_for_close(id), Ok(true));
        let after_first = manager.stats();
        assert_eq!(manager.mark_for_close(id), Ok(false));
        assert_eq!(manager.stats(), after_first);
        assert_eq!(manager.registry().closeable(), &[id]);

        let conn = manager.registry().get(id).unwrap();
        assert_eq!(conn.lifecycle(), Lifecycle::Closing);
        // Marking does not touch the socket
        assert!(matches!(conn.transport(), TransportHandle::Socket(_)));
    }

    #[test]
    fn test_mark_unknown_connection() {
        let mut manager = manager();
        assert_eq!(
            manager.mark_for_close(ConnectionId(99)),
            Err(ConnectionError::NotFound(ConnectionId(99)))
        );
    }

    #[test]
    fn test_close_immediate_then_sweep_releases_once() {
        let mut manager = manager();
        let id = manager
            .open(OpenRequest::directory(localhost(), TEST_PORT, DirPurpose::FetchConsensus))
            .unwrap();
        assert_eq!(manager.register_events(id, Interest::Readable), Ok(true));
        assert_eq!(manager.register_events(id, Interest::Writable), Ok(true));

        manager.close_immediate(id).unwrap();
        manager.close_immediate(id).unwrap();
        assert_eq!(manager.socket().released().len(), 2);
        assert_eq!(manager.socket().closed_sockets(), &[SocketToken(50)]);

        // Still tracked; close_immediate does not free
        assert!(manager.registry().get(id).is_some());

        manager.mark_for_close(id).unwrap();
        let stats = manager.sweep();
        assert_eq!(stats.reclaimed, 1);
        assert_eq!(stats.released_events, 0);
        assert_eq!(stats.closed_sockets, 0);
        assert_eq!(manager.socket().released().len(), 2);
    }

    #[test]
    fn test_register_events_without_event_loop() {
        let mut manager = ConnectionManager::new(
            ScriptedSocketLayer::new().without_event_loop(),
            ManagerConfig::default(),
        );
        let id = manager
            .open(OpenRequest::directory(localhost(), TEST_PORT, DirPurpose::FetchConsensus))
            .unwrap();

        assert_eq!(manager.register_events(id, Interest::Readable), Ok(false));
        assert!(manager.registry().get(id).unwrap().events().is_empty());

        manager.mark_for_close(id).unwrap();
        assert_eq!(manager.sweep().reclaimed, 1);
    }

    #[test]
    fn test_connect_after_close_immediate_is_ignored() {
        let mut manager = manager();
        manager.socket_mut().push(ScriptedConnect::InProgress);
        let id = manager
            .open(OpenRequest::directory(localhost(), TEST_PORT, DirPurpose::FetchConsensus))
            .unwrap();
        manager.close_immediate(id).unwrap();

        let applied = manager.handle_io_event(IoEvent::Connected {
            conn: id,
            socket: SocketToken(50),
        });
        assert!(!applied);

        let conn = manager.registry().get(id).unwrap();
        assert_eq!(conn.transport(), TransportHandle::Closed);
        assert_eq!(conn.state(), ConnectionState::Dir(DirState::Connecting));
        assert!(manager.socket().open_sockets().is_empty());
    }

    #[test]
    fn test_events_for_marked_connection_are_ignored() {
        let mut manager = manager();
        manager.socket_mut().push(ScriptedConnect::InProgress);
        let id = manager
            .open(OpenRequest::directory(localhost(), TEST_PORT, DirPurpose::FetchConsensus))
            .unwrap();
        manager.mark_for_close(id).unwrap();

        assert!(!manager.handle_io_event(IoEvent::Connected {
            conn: id,
            socket: SocketToken(50),
        }));
        assert!(!manager.handle_io_event(IoEvent::ConnectFailed {
            conn: id,
            error: crate::socket::ConnectFailure::timed_out(),
        }));

        let conn = manager.registry().get(id).unwrap();
        assert_eq!(conn.state(), ConnectionState::Dir(DirState::Connecting));

        // Events for ids that were never registered are dropped too
        assert!(!manager.handle_io_event(IoEvent::Readable {
            conn: ConnectionId(1234),
            handle: EventHandle(1),
        }));
    }

    #[test]
    fn test_deferred_connect_failure() {
        let mut manager = manager();
        manager.socket_mut().push(ScriptedConnect::InProgress);
        let id = manager
            .open(OpenRequest::directory(localhost(), TEST_PORT, DirPurpose::FetchConsensus))
            .unwrap();

        assert!(manager.handle_io_event(IoEvent::ConnectFailed {
            conn: id,
            error: crate::socket::ConnectFailure::timed_out(),
        }));

        let conn = manager.registry().get(id).unwrap();
        assert!(conn.is_marked_for_close());
        assert!(conn.state().is_failed());
        assert_eq!(conn.close_reason(), Some("connect failed"));
    }

    #[test]
    fn test_readable_event_clears_registration() {
        let mut manager = manager();
        let id = manager
            .open(OpenRequest::directory(localhost(), TEST_PORT, DirPurpose::FetchConsensus))
            .unwrap();
        manager.register_events(id, Interest::Readable).unwrap();
        let handle = manager
            .registry()
            .get(id)
            .unwrap()
            .events()
            .get(Interest::Readable)
            .unwrap();

        assert!(manager.handle_io_event(IoEvent::Readable { conn: id, handle }));
        assert!(manager.registry().get(id).unwrap().events().is_empty());
    }

    #[test]
    fn test_linked_pair_teardown() {
        let mut manager = manager();
        let (r, p) = manager
            .open_linked_pair(
                (ConnectionKind::Dir, Purpose::Dir(DirPurpose::FetchConsensus)),
                (ConnectionKind::Ap, Purpose::Unspecified),
            )
            .unwrap();

        assert_eq!(manager.registry().get(r).unwrap().linked_peer(), Some(p));
        assert_eq!(manager.registry().get(p).unwrap().linked_peer(), Some(r));
        assert!(manager.registry().check_consistency().is_ok());

        manager.mark_for_close(r).unwrap();
        let stats = manager.sweep();
        assert_eq!(stats.reclaimed, 1);
        assert_eq!(stats.severed_links, 1);
        assert_eq!(stats.dangling_peers, 1);

        let peer = manager.registry().get(p).unwrap();
        assert!(peer.linked_peer().is_none());
        assert!(!peer.is_marked_for_close());
        assert!(manager.registry().check_consistency().is_ok());
    }

    #[test]
    fn test_linked_pair_symmetric_close() {
        let mut manager = manager();
        let (r, p) = manager
            .open_linked_pair(
                (ConnectionKind::Dir, Purpose::Dir(DirPurpose::FetchConsensus)),
                (ConnectionKind::Ap, Purpose::Unspecified),
            )
            .unwrap();

        manager.mark_for_close(r).unwrap();
        manager.mark_for_close(p).unwrap();
        let stats = manager.sweep();

        assert_eq!(stats.reclaimed, 2);
        assert_eq!(stats.dangling_peers, 0);
        assert!(manager.registry().is_empty());
    }

    #[test]
    fn test_unlink_is_atomic() {
        let mut manager = manager();
        let (a, b) = manager
            .open_linked_pair(
                (ConnectionKind::Dir, Purpose::Dir(DirPurpose::FetchConsensus)),
                (ConnectionKind::Ap, Purpose::Unspecified),
            )
            .unwrap();

        assert_eq!(manager.unlink(b), Ok(Some(a)));
        assert!(manager.registry().get(a).unwrap().linked_peer().is_none());
        assert!(manager.registry().get(b).unwrap().linked_peer().is_none());
        assert_eq!(manager.unlink(a), Ok(None));
        assert!(manager.registry().check_consistency().is_ok());
    }

    #[test]
    fn test_linked_pair_starts_connected() {
        let mut manager = manager();
        let (dir, ap) = manager
            .open_linked_pair(
                (ConnectionKind::Dir, Purpose::Dir(DirPurpose::FetchServerDesc)),
                (ConnectionKind::Ap, Purpose::Unspecified),
            )
            .unwrap();

        let dir = manager.registry().get(dir).unwrap();
        assert_eq!(dir.state(), ConnectionState::Dir(DirState::ClientSending));
        assert!(dir.is_linked());
        assert!(dir.address().is_none());
        assert_eq!(
            manager.registry().get(ap).unwrap().state(),
            ConnectionKind::Ap.connected_state()
        );
        // No socket was ever requested
        assert!(manager.socket().connect_calls().is_empty());
    }

    #[test]
    fn test_fail_marks_and_sets_failed() {
        let mut manager = manager();
        let id = manager
            .open(OpenRequest::directory(localhost(), TEST_PORT, DirPurpose::FetchConsensus))
            .unwrap();

        manager.fail(id, "bad response").unwrap();
        manager.fail(id, "again").unwrap();

        let conn = manager.registry().get(id).unwrap();
        assert!(conn.state().is_failed());
        assert_eq!(conn.close_reason(), Some("bad response"));
    }

    #[test]
    fn test_retry_rend_fetch_carries_history() {
        let mut manager = manager();
        let first = manager
            .open(OpenRequest::rend_fetch(
                localhost(),
                TEST_PORT,
                RendQuery::new("cfs3rltphxxvabci"),
            ))
            .unwrap();
        manager
            .registry_mut()
            .get_mut(first)
            .unwrap()
            .rend_query_mut()
            .unwrap()
            .note_tried(fingerprint(1));

        let second = manager
            .retry_rend_fetch(first, fingerprint(2), "127.0.0.2".parse().unwrap(), TEST_PORT)
            .unwrap();

        let query = manager.registry().get(second).unwrap().rend_query().unwrap();
        assert_eq!(query.onion_address(), "cfs3rltphxxvabci");
        assert_eq!(query.tried_directories(), &[fingerprint(1), fingerprint(2)]);
        assert!(manager.registry().get(first).unwrap().is_marked_for_close());

        // The new attempt is the one active lookups find
        let found = manager.registry().by_kind_state_rendquery(
            ConnectionKind::Dir,
            ConnectionState::Dir(DirState::ClientSending),
            "cfs3rltphxxvabci",
        );
        assert_eq!(found.map(Connection::id), Some(second));

        let err = manager
            .retry_rend_fetch(second, fingerprint(1), localhost(), TEST_PORT)
            .unwrap_err();
        assert_eq!(
            err,
            ConnectionError::RendQuery(RendQueryError::AlreadyTried(fingerprint(1)))
        );
    }

    #[test]
    fn test_retry_requires_rend_fetch() {
        let mut manager = manager();
        let id = manager
            .open(OpenRequest::directory(localhost(), TEST_PORT, DirPurpose::FetchConsensus))
            .unwrap();
        assert_eq!(
            manager.retry_rend_fetch(id, fingerprint(1), localhost(), TEST_PORT),
            Err(ConnectionError::NotRendFetch(id))
        );
    }

    #[test]
    fn test_ids_never_reused_after_sweep() {
        let mut manager = manager();
        let first = manager
            .open(OpenRequest::directory(localhost(), TEST_PORT, DirPurpose::FetchConsensus))
            .unwrap();
        manager.mark_for_close(first).unwrap();
        manager.sweep();

        let second = manager
            .open(OpenRequest::directory(localhost(), TEST_PORT, DirPurpose::FetchConsensus))
            .unwrap();
        assert!(second > first);
        assert!(manager.registry().get(first).is_none());
    }

    #[test]
    fn test_shutdown_empties_registry() {
        let mut manager = manager();
        for _ in 0..3 {
            manager
                .open(OpenRequest::directory(localhost(), TEST_PORT, DirPurpose::FetchConsensus))
                .unwrap();
        }
        manager
            .open_linked_pair(
                (ConnectionKind::Dir, Purpose::Dir(DirPurpose::FetchConsensus)),
                (ConnectionKind::Ap, Purpose::Unspecified),
            )
            .unwrap();

        let stats = manager.shutdown();
        assert_eq!(stats.reclaimed, 5);
        assert_eq!(stats.dangling_peers, 0);
        assert!(manager.registry().is_empty());
        assert!(manager.socket().open_sockets().is_empty());
    }

    #[test]
    fn test_error_conversion() {
        let err: VeilNetError = ConnectionError::Registry(RegistryError::DuplicateId(ConnectionId(1))).into();
        assert!(err.is_fatal());

        let err: VeilNetError = ConnectionError::NotFound(ConnectionId(5)).into();
        assert!(matches!(err, VeilNetError::ConnectionNotFound(5)));
    }
}
