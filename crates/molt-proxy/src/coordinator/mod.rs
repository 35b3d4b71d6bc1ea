//! Handoff coordination for both ends of a restart.
//!
//! The source coordinator runs in the instance giving up its resources;
//! the taker coordinator runs in the freshly started instance claiming
//! them. Between them sit the four domain channels:
//!
//! ```text
//!   source (old)                              taker (new)
//!     bind reconfig.sock  <-- announce ------  connect
//!     connect  ----------- listeners + fds --> bind listen.sock
//!     connect  ----------- connections + fds > bind conn.sock
//!     connect  ----------- stats snapshot ---> bind stats.sock
//!     report DrainComplete ------------------> Goodbye, source exits
//! ```
//!
//! The source side drives a [`TransferSession`] through its phases and
//! aborts it on any failure, restoring whatever it still owns.

pub mod source;
pub mod taker;

pub use source::{HandoffReport, run_source};
pub use taker::{TakeoverOutcome, run_taker};

use molt_core::channel::ChannelError;
use molt_core::session::SessionError;
use molt_core::transfer::TransferError;

use crate::engine::EngineError;

/// Errors raised while coordinating a handoff.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// Session state machine refused a transition.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A transfer phase failed.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Channel setup or teardown failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Engine could not apply a transferred resource.
    #[error(transparent)]
    Engine(#[from] EngineError),
}
