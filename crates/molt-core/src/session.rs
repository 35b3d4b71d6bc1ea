//! Transfer session state machine.
//!
//! Both instances drive a copy of this machine through the ordered
//! phases of a handoff:
//!
//! ```text
//! Idle → Spawning → ListenersTransferring → Draining
//!      → ConnectionsTransferring → StatsTransferring → Complete
//! ```
//!
//! `Aborted` is reachable from every non-terminal state. Abort is
//! idempotent and purely a state change; resource ownership is restored
//! by the transfer protocols themselves, which never give anything up
//! before acknowledgement.
//!
//! At most one session is active per process; reload triggers are
//! handled serially, so a second trigger waits for the session in flight.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Phases of a handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffState {
    /// No handoff in progress.
    Idle,
    /// New process image spawned, waiting for first contact.
    Spawning,
    /// Listener descriptors moving to the taker.
    ListenersTransferring,
    /// Not accepting; serving existing connections until empty or the
    /// grace deadline.
    Draining,
    /// Remaining connections moving to the taker.
    ConnectionsTransferring,
    /// Final stats snapshot moving to the taker.
    StatsTransferring,
    /// Handoff finished; the source exits, the taker is sole owner.
    Complete,
    /// Handoff failed; the source keeps everything it still owns.
    Aborted,
}

impl HandoffState {
    /// Whether the machine can leave this state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Aborted)
    }

    /// Legal successor states.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Spawning)
                | (Self::Spawning, Self::ListenersTransferring)
                | (Self::ListenersTransferring, Self::Draining)
                | (Self::Draining, Self::ConnectionsTransferring)
                | (Self::ConnectionsTransferring, Self::StatsTransferring)
                | (Self::StatsTransferring, Self::Complete)
        )
    }
}

impl std::fmt::Display for HandoffState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Spawning => "spawning",
            Self::ListenersTransferring => "listeners_transferring",
            Self::Draining => "draining",
            Self::ConnectionsTransferring => "connections_transferring",
            Self::StatsTransferring => "stats_transferring",
            Self::Complete => "complete",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// One handoff attempt between an old and a new instance.
#[derive(Debug)]
pub struct TransferSession {
    id: Uuid,
    state: HandoffState,
    started_at: Instant,
    drain_deadline: Option<Instant>,
}

impl TransferSession {
    /// Start a new session in `Idle`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: HandoffState::Idle,
            started_at: Instant::now(),
            drain_deadline: None,
        }
    }

    /// Session id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> HandoffState {
        self.state
    }

    /// Time since the session started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Move to the next phase.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::IllegalTransition`] for any transition the
    /// machine does not allow.
    pub fn advance(&mut self, next: HandoffState) -> Result<(), SessionError> {
        if !self.state.can_advance_to(next) {
            return Err(SessionError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        info!(session = %self.id, from = %self.state, to = %next, "handoff phase change");
        self.state = next;
        Ok(())
    }

    /// Arm the drain deadline; call when entering `Draining`.
    pub fn arm_drain_deadline(&mut self, grace_period: Duration) {
        self.drain_deadline = Some(Instant::now() + grace_period);
    }

    /// Remaining drain budget, if armed. Zero once expired.
    #[must_use]
    pub fn drain_budget(&self) -> Option<Duration> {
        self.drain_deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Abort the session. Idempotent; a no-op when already aborted.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::IllegalTransition`] only when the session
    /// already completed; a finished handoff cannot be taken back.
    pub fn abort(&mut self) -> Result<(), SessionError> {
        match self.state {
            HandoffState::Aborted => Ok(()),
            HandoffState::Complete => Err(SessionError::IllegalTransition {
                from: self.state,
                to: HandoffState::Aborted,
            }),
            _ => {
                warn!(session = %self.id, from = %self.state, "handoff aborted");
                self.state = HandoffState::Aborted;
                Ok(())
            },
        }
    }

    /// Whether the session is still in flight.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        !matches!(self.state, HandoffState::Idle) && !self.state.is_terminal()
    }
}

impl Default for TransferSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The requested state change is not allowed.
    #[error("illegal handoff transition: {from} -> {to}")]
    IllegalTransition {
        /// State the machine was in.
        from: HandoffState,
        /// State that was requested.
        to: HandoffState,
    },
}
