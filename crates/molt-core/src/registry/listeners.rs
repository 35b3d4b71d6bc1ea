//! Listener registry.
//!
//! Tracks the listening sockets this process currently owns. During a
//! handoff the whole table is drained out, sent across the listener
//! channel, and either destroyed (on acknowledgement) or restored (on
//! abort). An entry's descriptor is owned by exactly one process at any
//! instant.

use std::net::SocketAddr;
use std::os::fd::OwnedFd;

/// A bound listening socket together with its addressing metadata.
#[derive(Debug)]
pub struct ListenerEntry {
    /// Address the socket is bound to.
    pub address: SocketAddr,
    /// Protocol tag for the protocol layer.
    pub protocol: String,
    /// The listening descriptor itself.
    pub socket: OwnedFd,
}

/// Table of listeners owned by this process.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    entries: Vec<ListenerEntry>,
}

impl ListenerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener this process owns.
    pub fn insert(&mut self, entry: ListenerEntry) {
        self.entries.push(entry);
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Addresses of all registered listeners.
    #[must_use]
    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.entries.iter().map(|e| e.address).collect()
    }

    /// Take every entry out of the registry for transfer.
    ///
    /// The caller becomes responsible for either closing the descriptors
    /// (after acknowledged handoff) or restoring them via [`Self::restore`]
    /// (on abort).
    pub fn take_all(&mut self) -> Vec<ListenerEntry> {
        std::mem::take(&mut self.entries)
    }

    /// Put entries back after an aborted handoff.
    pub fn restore(&mut self, entries: Vec<ListenerEntry>) {
        self.entries.extend(entries);
    }
}
