use super::{ConnectFailure, ConnectOutcome, EventHandle, Interest, IoEvent, SocketLayer, SocketToken};
use crate::connection::ConnectionId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

type StreamMap = Arc<Mutex<HashMap<SocketToken, Arc<TcpStream>>>>;

/// Socket layer backed by tokio TCP streams
///
/// Connects and readiness waits run as tasks on the runtime that was
/// current when the layer was built; their results come back through the
/// event channel returned by `new`.
pub struct TokioSocketLayer {
    runtime: Option<Handle>,
    events: mpsc::UnboundedSender<IoEvent>,
    streams: StreamMap,
    pending: HashMap<SocketToken, JoinHandle<()>>,
    watchers: HashMap<EventHandle, (SocketToken, JoinHandle<()>)>,
    next_socket: u64,
    next_handle: u64,
    connect_timeout: Duration,
}

impl TokioSocketLayer {
    /// Create the layer and the receiver its events are delivered on
    pub fn new(connect_timeout: Duration) -> (Self, mpsc::UnboundedReceiver<IoEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let layer = Self {
            runtime: Handle::try_current().ok(),
            events,
            streams: Arc::new(Mutex::new(HashMap::new())),
            pending: HashMap::new(),
            watchers: HashMap::new(),
            next_socket: 1,
            next_handle: 1,
            connect_timeout,
        };
        (layer, receiver)
    }

    /// Whether a runtime was available when the layer was built
    pub fn has_event_loop(&self) -> bool {
        self.runtime.is_some()
    }

    /// The connected stream behind `socket`, if the connect finished
    pub fn stream(&self, socket: SocketToken) -> Option<Arc<TcpStream>> {
        lock(&self.streams).get(&socket).cloned()
    }

    /// Number of connects still in flight
    pub fn pending_connects(&self) -> usize {
        self.pending.values().filter(|task| !task.is_finished()).count()
    }
}

fn lock(streams: &StreamMap) -> std::sync::MutexGuard<'_, HashMap<SocketToken, Arc<TcpStream>>> {
    streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SocketLayer for TokioSocketLayer {
    fn connect_nonblocking(&mut self, conn: ConnectionId, target: SocketAddr) -> ConnectOutcome {
        let Some(runtime) = self.runtime.as_ref() else {
            return ConnectOutcome::Failed(ConnectFailure::no_runtime());
        };

        self.pending.retain(|_, task| !task.is_finished());

        let socket = SocketToken(self.next_socket);
        self.next_socket += 1;

        let events = self.events.clone();
        let streams = self.streams.clone();
        let timeout = self.connect_timeout;

        let task = runtime.spawn(async move {
            let event = match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
                Ok(Ok(stream)) => {
                    lock(&streams).insert(socket, Arc::new(stream));
                    IoEvent::Connected { conn, socket }
                }
                Ok(Err(err)) => IoEvent::ConnectFailed {
                    conn,
                    error: ConnectFailure::from(&err),
                },
                Err(_) => IoEvent::ConnectFailed {
                    conn,
                    error: ConnectFailure::timed_out(),
                },
            };
            // Receiver gone means the node is shutting down
            let _ = events.send(event);
        });
        self.pending.insert(socket, task);

        debug!("{} connecting to {} on {}", conn, target, socket);
        ConnectOutcome::InProgress(socket)
    }

    fn register(
        &mut self,
        conn: ConnectionId,
        socket: SocketToken,
        interest: Interest,
    ) -> Option<EventHandle> {
        let runtime = self.runtime.as_ref()?;
        let stream = self.stream(socket)?;

        let handle = EventHandle(self.next_handle);
        self.next_handle += 1;

        let events = self.events.clone();
        let task = runtime.spawn(async move {
            let ready = match interest {
                Interest::Readable => stream.readable().await,
                Interest::Writable => stream.writable().await,
            };
            if ready.is_ok() {
                let event = match interest {
                    Interest::Readable => IoEvent::Readable { conn, handle },
                    Interest::Writable => IoEvent::Writable { conn, handle },
                };
                let _ = events.send(event);
            }
        });
        self.watchers.insert(handle, (socket, task));

        trace!("{} watching {} for {:?}", conn, socket, interest);
        Some(handle)
    }

    fn unregister(&mut self, handle: EventHandle) {
        if let Some((_, task)) = self.watchers.remove(&handle) {
            task.abort();
        }
    }

    fn close(&mut self, socket: SocketToken) {
        if let Some(task) = self.pending.remove(&socket) {
            task.abort();
        }

        let watching: Vec<EventHandle> = self
            .watchers
            .iter()
            .filter(|(_, (s, _))| *s == socket)
            .map(|(handle, _)| *handle)
            .collect();
        for handle in watching {
            self.unregister(handle);
        }

        if lock(&self.streams).remove(&socket).is_some() {
            debug!("Closed {}", socket);
        }
    }
}

impl Drop for TokioSocketLayer {
    fn drop(&mut self) {
        for (_, task) in self.pending.drain() {
            task.abort();
        }
        for (_, (_, task)) in self.watchers.drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_connect_without_runtime_fails() {
        let (mut layer, _events) = TokioSocketLayer::new(Duration::from_secs(1));
        assert!(!layer.has_event_loop());

        let outcome = layer.connect_nonblocking(ConnectionId(1), "127.0.0.1:9".parse().unwrap());
        assert_eq!(outcome, ConnectOutcome::Failed(ConnectFailure::no_runtime()));
        assert!(layer
            .register(ConnectionId(1), SocketToken(1), Interest::Readable)
            .is_none());
    }

    #[tokio::test]
    async fn test_connect_reports_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (mut layer, mut events) = TokioSocketLayer::new(Duration::from_secs(5));
        let socket = match layer.connect_nonblocking(ConnectionId(7), addr) {
            ConnectOutcome::InProgress(socket) => socket,
            other => panic!("unexpected outcome {:?}", other),
        };

        let (_accepted, _) = listener.accept().await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            IoEvent::Connected {
                conn: ConnectionId(7),
                socket
            }
        );
        assert!(layer.stream(socket).is_some());

        // A fresh connection is writable right away
        let handle = layer
            .register(ConnectionId(7), socket, Interest::Writable)
            .unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            IoEvent::Writable {
                conn: ConnectionId(7),
                handle
            }
        );

        layer.close(socket);
        layer.close(socket);
        assert!(layer.stream(socket).is_none());
    }

    #[tokio::test]
    async fn test_connect_refused_reports_failure() {
        // Grab a free port and release it so nothing listens there
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let (mut layer, mut events) = TokioSocketLayer::new(Duration::from_secs(5));
        layer.connect_nonblocking(ConnectionId(3), addr);

        match events.recv().await.unwrap() {
            IoEvent::ConnectFailed { conn, .. } => assert_eq!(conn, ConnectionId(3)),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
