//! molt-proxy - Proxy Runtime with Zero-Downtime Restart
//!
//! This library holds the runtime half of molt: the worker engine that
//! accepts and serves connections, the coordinators that drive a handoff
//! from the old (source) and new (taker) side, and the signal-driven
//! reload trigger.
//!
//! The `moltd` binary wires these together; integration tests drive them
//! directly with two engines inside one process.
//!
//! # Modules
//!
//! - [`engine`]: accept loops, per-connection workers, drain and adopt
//! - [`coordinator`]: source-side and taker-side handoff orchestration
//! - [`reload`]: reload signal handling and successor spawning

pub mod coordinator;
pub mod engine;
pub mod reload;

/// Environment marker set on a spawned successor so it runs the takeover
/// path instead of a cold start.
pub const INHERIT_ENV: &str = "MOLT_INHERIT";
