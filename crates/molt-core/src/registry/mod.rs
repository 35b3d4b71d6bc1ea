//! Per-process listener and connection registries.
//!
//! Registries are explicitly owned state, constructed by the process and
//! handed to the transfer coordinator, never ambient globals. Record
//! content is mutated only by the worker that owns the record; the
//! registries themselves only need mutual exclusion around insert and
//! remove (the caller wraps them in `tokio::sync::RwLock`).

pub mod connections;
pub mod listeners;

pub use connections::{ConnectionRecord, ConnectionRegistry};
pub use listeners::{ListenerEntry, ListenerRegistry};
