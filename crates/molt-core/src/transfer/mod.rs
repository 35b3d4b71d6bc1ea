//! Wire protocols for the four domain channels.
//!
//! Each channel speaks its own small message set, JSON-encoded inside
//! length-prefixed frames. The listener and connection channels carry
//! descriptors as `SCM_RIGHTS` ancillary data alongside their offer
//! messages and run over [`FdStream`](crate::channel::FdStream); the
//! stats and reconfigure-ack channels never move descriptors and run over
//! `Framed<UnixStream, FrameCodec>`.
//!
//! # Protocol Roles
//!
//! The *source* side is the old instance giving resources up; the *taker*
//! side is the new instance receiving them. Every transfer moves ownership
//! on acknowledgement: anything unacknowledged when a channel fails stays
//! with the source.

pub mod connection;
pub mod listener;
pub mod reconfigure;
pub mod stats;

use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use uuid::Uuid;

use crate::channel::{ChannelError, FrameCodec};
use crate::registry::ConnectionRecord;
use crate::stats::StatsSnapshot;

/// Messages on the listener transfer channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ListenerMessage {
    /// Taker requests the full listener set.
    Request,
    /// Source announces how many offers will follow.
    Announce {
        /// Number of listeners about to be offered.
        count: u32,
    },
    /// One listener; the descriptor rides as ancillary data.
    Offer {
        /// Bind address of the listener.
        address: SocketAddr,
        /// Protocol tag.
        protocol: String,
    },
    /// Taker confirms it owns the listener for `address`.
    Ack {
        /// Address being acknowledged.
        address: SocketAddr,
    },
}

/// Messages on the connection transfer channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionMessage {
    /// One connection; the descriptor rides as ancillary data.
    Offer {
        /// The relocatable connection state.
        record: ConnectionRecord,
    },
    /// Taker confirms it owns connection `id`.
    Ack {
        /// Connection id being acknowledged.
        id: Uuid,
    },
    /// Source has no more connections to move.
    Done,
}

/// Messages on the stats transfer channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatsMessage {
    /// Taker requests the final snapshot.
    Request,
    /// Source's snapshot, captured after connection transfer.
    Snapshot {
        /// The snapshot to merge.
        snapshot: StatsSnapshot,
    },
}

/// Messages on the reconfigure acknowledgement channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReconfigureMessage {
    /// Taker announces it is alive and starting takeover.
    TakeoverStarted {
        /// OS pid of the taker, for logs.
        pid: u32,
    },
    /// Source accepts; the taker may proceed to the listener channel.
    TakeoverAccepted,
    /// Source refuses (a session is already in flight); taker must exit.
    TakeoverRejected {
        /// Human-readable refusal reason.
        reason: String,
    },
    /// Source finished draining and transferring; it exits after the
    /// taker's goodbye.
    DrainComplete,
    /// Taker's final acknowledgement.
    Goodbye,
}

/// Errors from the transfer protocols.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Transport-level failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Peer sent a message that is illegal in the current phase.
    #[error("unexpected message during {phase}: {detail}")]
    UnexpectedMessage {
        /// Phase name.
        phase: &'static str,
        /// What arrived.
        detail: String,
    },

    /// An offer arrived without its descriptor.
    #[error("offer for {what} arrived without a descriptor")]
    MissingDescriptor {
        /// What was being offered.
        what: String,
    },

    /// A phase exceeded its deadline.
    #[error("{phase} timed out after {duration_ms} ms")]
    PhaseTimeout {
        /// Phase name.
        phase: &'static str,
        /// Elapsed bound in milliseconds.
        duration_ms: u64,
    },

    /// The source refused the takeover.
    #[error("takeover rejected: {reason}")]
    Rejected {
        /// Refusal reason from the source.
        reason: String,
    },
}

impl TransferError {
    pub(crate) fn unexpected(phase: &'static str, msg: &impl std::fmt::Debug) -> Self {
        Self::UnexpectedMessage {
            phase,
            detail: format!("{msg:?}"),
        }
    }

    pub(crate) fn phase_timeout(phase: &'static str, duration: std::time::Duration) -> Self {
        Self::PhaseTimeout {
            phase,
            duration_ms: duration.as_millis().try_into().unwrap_or(u64::MAX),
        }
    }
}

/// Result type for transfer operations.
pub type TransferResult<T> = Result<T, TransferError>;

/// Send a typed message over a framed (non-descriptor) channel.
///
/// # Errors
///
/// Returns a serialization or transport error.
pub async fn send_framed<T, S>(framed: &mut Framed<S, FrameCodec>, msg: &T) -> TransferResult<()>
where
    T: Serialize,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(msg).map_err(ChannelError::from)?;
    framed.send(payload.into()).await?;
    Ok(())
}

/// Receive a typed message from a framed (non-descriptor) channel.
///
/// # Errors
///
/// Returns [`ChannelError::Closed`] if the peer hung up, otherwise a
/// deserialization or transport error.
pub async fn recv_framed<T, S>(framed: &mut Framed<S, FrameCodec>) -> TransferResult<T>
where
    T: DeserializeOwned,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = framed
        .next()
        .await
        .ok_or(ChannelError::Closed)?
        .map_err(TransferError::Channel)?;
    Ok(serde_json::from_slice(&frame).map_err(ChannelError::from)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_message_tags() {
        let json = serde_json::to_string(&ListenerMessage::Request).unwrap();
        assert!(json.contains("\"request\""));

        let offer = ListenerMessage::Offer {
            address: "127.0.0.1:12101".parse().unwrap(),
            protocol: "echo".to_string(),
        };
        let json = serde_json::to_string(&offer).unwrap();
        assert!(json.contains("\"offer\""));
        assert!(json.contains("12101"));

        let parsed: ListenerMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, ListenerMessage::Offer { protocol, .. } if protocol == "echo"));
    }

    #[test]
    fn test_reconfigure_message_round_trip() {
        let msg = ReconfigureMessage::TakeoverRejected {
            reason: "session in flight".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: ReconfigureMessage = serde_json::from_str(&json).unwrap();
        assert!(
            matches!(parsed, ReconfigureMessage::TakeoverRejected { reason } if reason.contains("in flight"))
        );
    }

    #[tokio::test]
    async fn test_framed_helpers_round_trip() {
        let (a, b) = tokio::net::UnixStream::pair().unwrap();
        let mut tx = Framed::new(a, FrameCodec::new());
        let mut rx = Framed::new(b, FrameCodec::new());

        send_framed(&mut tx, &StatsMessage::Request).await.unwrap();
        let msg: StatsMessage = recv_framed(&mut rx).await.unwrap();
        assert!(matches!(msg, StatsMessage::Request));
    }

    #[tokio::test]
    async fn test_recv_framed_on_closed_peer() {
        let (a, b) = tokio::net::UnixStream::pair().unwrap();
        let mut rx = Framed::new(b, FrameCodec::new());
        drop(a);

        let err = recv_framed::<StatsMessage, _>(&mut rx).await.unwrap_err();
        assert!(matches!(err, TransferError::Channel(ChannelError::Closed)));
    }
}
