pub mod connection;
pub mod socket;

// Re-export connection types
pub use connection::{
    Connection, ConnectionError, ConnectionId, ConnectionKind, ConnectionManager,
    ConnectionRegistry, ConnectionState, DirPurpose, DirState, Lifecycle, ManagerConfig,
    OpenRequest, Purpose, RegistryError, RegistryStats, RendQuery, RendQueryError, StateError,
    SweepStats, TransportHandle,
};

// Re-export socket layer types
pub use socket::{
    ConnectFailure, ConnectOutcome, EventHandle, Interest, IoEvent, ScriptedConnect,
    ScriptedSocketLayer, SocketLayer, SocketToken, TokioSocketLayer,
};
