/// Connection registry
///
/// The authoritative set of live connection records. Records are keyed by
/// their global id; a per-kind index keeps registration order so "first
/// match" lookups are deterministic and never scan other kinds. Every
/// lookup except `get` skips records marked for close.

use super::kind::{ConnectionId, ConnectionKind, ConnectionState, DirPurpose, DirState, Purpose};
use super::record::{Connection, Lifecycle};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use tracing::trace;

/// Registry of every connection the process manages
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    /// Records by global id
    connections: HashMap<ConnectionId, Connection>,

    /// Ids per kind, in registration order
    by_kind: HashMap<ConnectionKind, Vec<ConnectionId>>,

    /// Records marked for close, waiting for a sweep
    closeable: Vec<ConnectionId>,

    /// Last id handed out
    last_id: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out the next global id
    ///
    /// Fails once the id space is used up; ids are never handed out twice.
    pub fn allocate_id(&mut self) -> Result<ConnectionId, RegistryError> {
        self.last_id = self
            .last_id
            .checked_add(1)
            .ok_or(RegistryError::IdsExhausted)?;
        Ok(ConnectionId(self.last_id))
    }

    /// Add a freshly created record
    pub fn register(&mut self, conn: Connection) -> Result<ConnectionId, RegistryError> {
        let id = conn.id();
        if self.connections.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        // Keep the allocator ahead of ids created elsewhere
        self.last_id = self.last_id.max(id.as_u64());

        let marked = conn.is_marked_for_close();
        self.by_kind.entry(conn.kind()).or_default().push(id);
        self.connections.insert(id, conn);
        if marked {
            self.closeable.push(id);
        }

        trace!("Registered {}", id);
        Ok(id)
    }

    /// Remove a record from every index
    pub(crate) fn unregister(&mut self, id: ConnectionId) -> Option<Connection> {
        let mut conn = self.connections.remove(&id)?;

        if let Some(ids) = self.by_kind.get_mut(&conn.kind()) {
            ids.retain(|other| *other != id);
        }
        self.closeable.retain(|other| *other != id);
        conn.lifecycle = Lifecycle::Reclaimed;

        trace!("Unregistered {}", id);
        Some(conn)
    }

    /// Queue a marked record for the next sweep
    pub(crate) fn enqueue_close(&mut self, id: ConnectionId) {
        if !self.closeable.contains(&id) {
            self.closeable.push(id);
        }
    }

    /// Drain the sweep queue
    pub(crate) fn take_closeable(&mut self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.closeable)
    }

    /// Records waiting for the next sweep
    pub fn closeable(&self) -> &[ConnectionId] {
        &self.closeable
    }

    /// Look up a record by id, whether or not it is marked for close
    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    /// Same as `get`
    pub fn by_id(&self, id: ConnectionId) -> Option<&Connection> {
        self.get(id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Every record, in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Active records of one kind, in registration order
    fn active_of_kind(&self, kind: ConnectionKind) -> impl Iterator<Item = &Connection> {
        self.by_kind
            .get(&kind)
            .into_iter()
            .flatten()
            .filter_map(|id| self.connections.get(id))
            .filter(|conn| conn.is_active())
    }

    /// First active record of `kind`
    pub fn by_kind(&self, kind: ConnectionKind) -> Option<&Connection> {
        self.active_of_kind(kind).next()
    }

    /// First active record in exactly `state`
    pub fn by_kind_state(
        &self,
        kind: ConnectionKind,
        state: ConnectionState,
    ) -> Option<&Connection> {
        self.active_of_kind(kind).find(|conn| conn.state() == state)
    }

    /// Every active record in exactly `state`
    pub fn list_by_kind_state(
        &self,
        kind: ConnectionKind,
        state: ConnectionState,
    ) -> Vec<&Connection> {
        self.active_of_kind(kind)
            .filter(|conn| conn.state() == state)
            .collect()
    }

    /// First active record to exactly this endpoint with exactly this purpose
    ///
    /// Used to reuse an outbound connection instead of opening a new one.
    pub fn by_kind_address_port_purpose(
        &self,
        kind: ConnectionKind,
        address: &IpAddr,
        port: u16,
        purpose: Purpose,
    ) -> Option<&Connection> {
        self.active_of_kind(kind).find(|conn| {
            conn.address().as_ref() == Some(address)
                && conn.port() == port
                && conn.purpose() == purpose
        })
    }

    /// First active directory record in `state` still fetching `onion_address`
    ///
    /// Records whose fetch already succeeded no longer match.
    pub fn by_kind_state_rendquery(
        &self,
        kind: ConnectionKind,
        state: ConnectionState,
        onion_address: &str,
    ) -> Option<&Connection> {
        if kind != ConnectionKind::Dir {
            return None;
        }
        self.active_of_kind(kind).find(|conn| {
            conn.state() == state
                && conn.purpose() == Purpose::Dir(DirPurpose::FetchRendDesc)
                && conn
                    .rend_query()
                    .map_or(false, |query| query.matches(onion_address))
        })
    }

    /// First active directory record with this purpose and resource
    pub fn dir_by_purpose_and_resource(
        &self,
        purpose: DirPurpose,
        resource: Option<&str>,
    ) -> Option<&Connection> {
        self.active_of_kind(ConnectionKind::Dir)
            .find(|conn| dir_matches(conn, purpose, resource))
    }

    pub fn dir_list_by_purpose_and_resource(
        &self,
        purpose: DirPurpose,
        resource: Option<&str>,
    ) -> Vec<&Connection> {
        self.active_of_kind(ConnectionKind::Dir)
            .filter(|conn| dir_matches(conn, purpose, resource))
            .collect()
    }

    /// Count active directory records with this purpose and resource,
    /// optionally restricted to one state
    pub fn dir_count_by_purpose_and_resource(
        &self,
        purpose: DirPurpose,
        resource: Option<&str>,
        state: Option<DirState>,
    ) -> usize {
        self.active_of_kind(ConnectionKind::Dir)
            .filter(|conn| dir_matches(conn, purpose, resource))
            .filter(|conn| match state {
                Some(state) => conn.state() == ConnectionState::Dir(state),
                None => true,
            })
            .count()
    }

    /// Verify every record and the cross-record invariants
    pub fn check_consistency(&self) -> Result<(), RegistryError> {
        for (id, conn) in &self.connections {
            if conn.id() != *id {
                return Err(RegistryError::Corrupt(format!("{} stored under {}", conn.id(), id)));
            }
            conn.check_invariants()
                .map_err(|err| RegistryError::Corrupt(format!("{}: {}", id, err)))?;

            let indexed = self
                .by_kind
                .get(&conn.kind())
                .map_or(false, |ids| ids.contains(id));
            if !indexed {
                return Err(RegistryError::Corrupt(format!("{} missing from kind index", id)));
            }

            if conn.is_marked_for_close() != self.closeable.contains(id) {
                return Err(RegistryError::Corrupt(format!(
                    "{} close mark disagrees with sweep queue",
                    id
                )));
            }

            if let Some(peer_id) = conn.linked_peer() {
                let reciprocal = self
                    .connections
                    .get(&peer_id)
                    .and_then(|peer| peer.linked_peer());
                if reciprocal != Some(*id) {
                    return Err(RegistryError::AsymmetricLink(*id, peer_id));
                }
            }
        }

        let indexed_total: usize = self.by_kind.values().map(Vec::len).sum();
        if indexed_total != self.connections.len() {
            return Err(RegistryError::Corrupt(format!(
                "kind index holds {} ids for {} records",
                indexed_total,
                self.connections.len()
            )));
        }

        Ok(())
    }

    /// Statistics about tracked connections
    pub fn stats(&self) -> RegistryStats {
        let mut by_kind = BTreeMap::new();
        for kind in ConnectionKind::ALL {
            let count = self.by_kind.get(&kind).map_or(0, Vec::len);
            if count > 0 {
                by_kind.insert(kind.to_string(), count);
            }
        }

        RegistryStats {
            total: self.connections.len(),
            active: self.connections.values().filter(|c| c.is_active()).count(),
            marked_for_close: self.closeable.len(),
            connecting: self
                .connections
                .values()
                .filter(|c| c.is_active() && c.state().is_connecting())
                .count(),
            linked: self
                .connections
                .values()
                .filter(|c| c.linked_peer().is_some())
                .count(),
            by_kind,
        }
    }
}

fn dir_matches(conn: &Connection, purpose: DirPurpose, resource: Option<&str>) -> bool {
    conn.purpose() == Purpose::Dir(purpose) && conn.resource() == resource
}

/// Statistics about the registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub active: usize,
    pub marked_for_close: usize,
    pub connecting: usize,
    pub linked: usize,
    pub by_kind: BTreeMap<String, usize>,
}

/// Registry errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Connection id {0} is already registered")]
    DuplicateId(ConnectionId),

    #[error("Link between {0} and {1} is not symmetric")]
    AsymmetricLink(ConnectionId, ConnectionId),

    #[error("Connection ids exhausted")]
    IdsExhausted,

    #[error("Registry corrupt: {0}")]
    Corrupt(String),
}
