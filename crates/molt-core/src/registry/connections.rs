//! Connection registry and the serializable connection record.
//!
//! The registry tracks which connections are alive in this process; the
//! [`ConnectionRecord`] is the portable part of a connection: everything
//! the receiving process needs, besides the descriptor itself, to resume
//! serving exactly where the sender stopped.

use std::collections::HashMap;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Relocatable state of one live connection.
///
/// `unread` holds bytes the old instance read off the socket but had not
/// yet consumed; they are replayed to the protocol layer in the new
/// instance before it reads from the socket again, so the peer observes
/// no loss and no duplication. `continuation` is opaque protocol-layer
/// state; `None` marks a connection the protocol layer considers unsafe
/// to relocate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Unique connection id.
    pub id: Uuid,
    /// Remote peer address.
    pub peer_addr: SocketAddr,
    /// Local address the connection was accepted on.
    pub local_addr: SocketAddr,
    /// Protocol tag from the accepting listener.
    pub protocol: String,
    /// Bytes read from the socket but not yet consumed.
    pub unread: Vec<u8>,
    /// Opaque protocol continuation state, if the protocol layer can
    /// produce one.
    pub continuation: Option<Vec<u8>>,
    /// Last I/O activity on this connection.
    pub last_activity: DateTime<Utc>,
}

impl ConnectionRecord {
    /// Create a record for a freshly accepted connection.
    #[must_use]
    pub fn new(peer_addr: SocketAddr, local_addr: SocketAddr, protocol: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer_addr,
            local_addr,
            protocol: protocol.into(),
            unread: Vec::new(),
            continuation: Some(Vec::new()),
            last_activity: Utc::now(),
        }
    }

    /// Whether the protocol layer has declared this connection safe to
    /// relocate.
    #[must_use]
    pub const fn is_relocatable(&self) -> bool {
        self.continuation.is_some()
    }

    /// Record I/O activity now.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

/// Table of connections alive in this process.
///
/// Insert on accept, remove on close or on acknowledged transfer. The
/// union of connections accepted by the new instance and connections
/// transferred to it covers every connection ever active, with no
/// duplicates.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: HashMap<Uuid, ConnectionRecord>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a connection.
    pub fn insert(&mut self, record: ConnectionRecord) {
        self.entries.insert(record.id, record);
    }

    /// Stop tracking a connection (closed locally or handed over).
    pub fn remove(&mut self, id: Uuid) -> Option<ConnectionRecord> {
        self.entries.remove(&id)
    }

    /// Look up a connection.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<&ConnectionRecord> {
        self.entries.get(&id)
    }

    /// Mutable lookup, for the owning worker only.
    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut ConnectionRecord> {
        self.entries.get_mut(&id)
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no connections remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids of all live connections, for the drain scan.
    #[must_use]
    pub fn ids(&self) -> Vec<Uuid> {
        self.entries.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ConnectionRecord {
        ConnectionRecord::new(
            "10.0.0.1:50000".parse().unwrap(),
            "127.0.0.1:12101".parse().unwrap(),
            "echo",
        )
    }

    #[test]
    fn test_insert_remove() {
        let mut registry = ConnectionRegistry::new();
        let rec = record();
        let id = rec.id;

        registry.insert(rec);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(id).is_some());

        let removed = registry.remove(id).unwrap();
        assert_eq!(removed.id, id);
        assert!(registry.is_empty());
        assert!(registry.remove(id).is_none());
    }

    #[test]
    fn test_record_serialization_round_trip() {
        let mut rec = record();
        rec.unread = vec![1, 2, 3];
        rec.continuation = Some(vec![9, 9]);

        let json = serde_json::to_string(&rec).unwrap();
        let parsed: ConnectionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, rec.id);
        assert_eq!(parsed.unread, vec![1, 2, 3]);
        assert_eq!(parsed.continuation, Some(vec![9, 9]));
        assert_eq!(parsed.peer_addr, rec.peer_addr);
    }

    #[test]
    fn test_relocatable_flag() {
        let mut rec = record();
        assert!(rec.is_relocatable());
        rec.continuation = None;
        assert!(!rec.is_relocatable());
    }
}
