/// Connection tracking
///
/// Records for every connection the node holds, the registry that indexes
/// them, and the manager that opens, marks and reclaims them.

mod kind;
mod manager;
mod record;
mod registry;
mod rend;

pub use kind::{
    ApState, ConnectionId, ConnectionKind, ConnectionState, ControlState, DirPurpose, DirState,
    ExitPurpose, ExitState, OrState, Purpose,
};
pub use manager::{ConnectionError, ConnectionManager, ManagerConfig, OpenRequest, SweepStats};
pub use record::{
    Connection, DirData, EventRegistrations, KindData, Lifecycle, OrData, StateError,
    TransportHandle,
};
pub use registry::{ConnectionRegistry, RegistryError, RegistryStats};
pub use rend::{RendQuery, RendQueryError};
