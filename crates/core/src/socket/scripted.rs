use super::{ConnectFailure, ConnectOutcome, EventHandle, Interest, SocketLayer, SocketToken};
use crate::connection::ConnectionId;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use veilnet_common::connection::SCRIPTED_SOCKET_BASE;

/// Scripted result for one connect call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedConnect {
    Connect,
    InProgress,
    Fail(io::ErrorKind),
}

/// Socket layer double that never touches the network
///
/// Connect results come from a script (falling back to a default), socket
/// numbers are handed out from a fixed base, and every call is recorded so
/// tests can assert on what the manager did.
#[derive(Debug)]
pub struct ScriptedSocketLayer {
    script: VecDeque<ScriptedConnect>,
    default_outcome: ScriptedConnect,
    event_loop: bool,
    next_socket: u64,
    next_handle: u64,
    connect_calls: Vec<(ConnectionId, SocketAddr)>,
    open_sockets: Vec<SocketToken>,
    closed_sockets: Vec<SocketToken>,
    registrations: HashMap<EventHandle, (ConnectionId, SocketToken, Interest)>,
    released: Vec<EventHandle>,
}

impl ScriptedSocketLayer {
    /// Every connect succeeds immediately
    pub fn new() -> Self {
        Self::with_default(ScriptedConnect::Connect)
    }

    pub fn with_default(default_outcome: ScriptedConnect) -> Self {
        Self {
            script: VecDeque::new(),
            default_outcome,
            event_loop: true,
            next_socket: SCRIPTED_SOCKET_BASE,
            next_handle: 1,
            connect_calls: Vec::new(),
            open_sockets: Vec::new(),
            closed_sockets: Vec::new(),
            registrations: HashMap::new(),
            released: Vec::new(),
        }
    }

    /// Behave as if the process event loop was never initialized
    pub fn without_event_loop(mut self) -> Self {
        self.event_loop = false;
        self
    }

    /// Queue the outcome of the next connect call
    pub fn push(&mut self, outcome: ScriptedConnect) {
        self.script.push_back(outcome);
    }

    pub fn connect_calls(&self) -> &[(ConnectionId, SocketAddr)] {
        &self.connect_calls
    }

    pub fn open_sockets(&self) -> &[SocketToken] {
        &self.open_sockets
    }

    pub fn closed_sockets(&self) -> &[SocketToken] {
        &self.closed_sockets
    }

    /// Handles released exactly once, in release order
    pub fn released(&self) -> &[EventHandle] {
        &self.released
    }

    pub fn live_registrations(&self) -> usize {
        self.registrations.len()
    }

    pub fn registration(&self, handle: EventHandle) -> Option<(ConnectionId, SocketToken, Interest)> {
        self.registrations.get(&handle).copied()
    }

    fn allocate_socket(&mut self) -> SocketToken {
        let token = SocketToken(self.next_socket);
        self.next_socket += 1;
        self.open_sockets.push(token);
        token
    }
}

impl Default for ScriptedSocketLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketLayer for ScriptedSocketLayer {
    fn connect_nonblocking(&mut self, conn: ConnectionId, target: SocketAddr) -> ConnectOutcome {
        self.connect_calls.push((conn, target));

        let outcome = self
            .script
            .pop_front()
            .unwrap_or_else(|| self.default_outcome.clone());

        match outcome {
            ScriptedConnect::Connect => ConnectOutcome::Connected(self.allocate_socket()),
            ScriptedConnect::InProgress => ConnectOutcome::InProgress(self.allocate_socket()),
            ScriptedConnect::Fail(kind) => {
                ConnectOutcome::Failed(ConnectFailure::new(kind, "scripted connect failure"))
            }
        }
    }

    fn register(
        &mut self,
        conn: ConnectionId,
        socket: SocketToken,
        interest: Interest,
    ) -> Option<EventHandle> {
        if !self.event_loop || !self.open_sockets.contains(&socket) {
            return None;
        }
        let handle = EventHandle(self.next_handle);
        self.next_handle += 1;
        self.registrations.insert(handle, (conn, socket, interest));
        Some(handle)
    }

    fn unregister(&mut self, handle: EventHandle) {
        if self.registrations.remove(&handle).is_some() {
            self.released.push(handle);
        }
    }

    fn close(&mut self, socket: SocketToken) {
        if let Some(pos) = self.open_sockets.iter().position(|s| *s == socket) {
            self.open_sockets.remove(pos);
            self.closed_sockets.push(socket);
            self.registrations.retain(|_, (_, s, _)| *s != socket);
        }
    }
}
