//! molt-core - Zero-Downtime Handoff Core
//!
//! This library implements the process-to-process handoff machinery that
//! lets a new instance of a long-running proxy take over all listening
//! sockets, all live connections, and accumulated stats from an old
//! instance without dropping traffic.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  Transfer Session (state machine)        │
//! ├──────────────┬───────────────┬──────────────┬────────────┤
//! │  Listener    │  Connection   │   Stats      │ Reconfigure│
//! │  Transfer    │  Transfer     │   Transfer   │    Ack     │
//! ├──────────────┴───────────────┴──────────────┴────────────┤
//! │        Domain Channels (length-prefixed frames,          │
//! │        SCM_RIGHTS descriptor passing where needed)       │
//! ├──────────────────────────────────────────────────────────┤
//! │                  Unix domain sockets                     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`channel`]: domain channel transport: framing, connect/bind with
//!   retry, and descriptor passing over ancillary data
//! - [`config`]: handoff configuration (socket paths, grace period,
//!   per-phase timeouts)
//! - [`registry`]: per-process listener and connection registries
//! - [`session`]: the transfer session state machine shared by the old
//!   and new instance coordinators
//! - [`stats`]: serializable stats snapshots and the cross-restart merge
//!   rule
//! - [`transfer`]: the four wire protocols that move listeners,
//!   connections, and stats between instances
//!
//! # Ownership Invariants
//!
//! At every instant each listening descriptor and each connection is owned
//! by at most one process. Transfer moves ownership exactly once, on
//! acknowledgement; an aborted session leaves everything not yet
//! acknowledged with the old instance.

pub mod channel;
pub mod config;
pub mod registry;
pub mod session;
pub mod stats;
pub mod transfer;

pub use channel::{ChannelError, ChannelPurpose, ChannelResult};
pub use config::{ConfigError, HandoffConfig};
pub use session::{HandoffState, SessionError, TransferSession};
