//! Stats transfer protocol.
//!
//! A single request/response over the stats channel, run after connection
//! transfer so the snapshot covers activity during the handover window.
//! A failure here degrades rather than aborting the session: the taker
//! simply starts from fresh stats.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::debug;

use super::{StatsMessage, TransferError, TransferResult, recv_framed, send_framed};
use crate::channel::FrameCodec;
use crate::stats::StatsSnapshot;

const PHASE: &str = "stats transfer";

/// Source side: answer the taker's single snapshot request.
///
/// # Errors
///
/// Returns a transport error, a timeout waiting for the request, or an
/// unexpected message.
pub async fn serve_stats<S>(
    framed: &mut Framed<S, FrameCodec>,
    snapshot: StatsSnapshot,
    timeout: Duration,
) -> TransferResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = tokio::time::timeout(timeout, recv_framed::<StatsMessage, _>(framed))
        .await
        .map_err(|_| TransferError::phase_timeout(PHASE, timeout))??;

    if !matches!(request, StatsMessage::Request) {
        return Err(TransferError::unexpected(PHASE, &request));
    }

    debug!(metrics = snapshot.metrics.len(), "serving stats snapshot");
    send_framed(framed, &StatsMessage::Snapshot { snapshot }).await
}

/// Taker side: fetch the source's final snapshot.
///
/// # Errors
///
/// Returns a transport error, a timeout, or an unexpected message.
pub async fn fetch_stats<S>(
    framed: &mut Framed<S, FrameCodec>,
    timeout: Duration,
) -> TransferResult<StatsSnapshot>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_framed(framed, &StatsMessage::Request).await?;

    let reply = tokio::time::timeout(timeout, recv_framed::<StatsMessage, _>(framed))
        .await
        .map_err(|_| TransferError::phase_timeout(PHASE, timeout))??;

    match reply {
        StatsMessage::Snapshot { snapshot } => {
            debug!(metrics = snapshot.metrics.len(), "stats snapshot received");
            Ok(snapshot)
        },
        other => Err(TransferError::unexpected(PHASE, &other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::StatsRegistry;

    #[tokio::test]
    async fn test_stats_exchange() {
        let (a, b) = tokio::net::UnixStream::pair().unwrap();
        let mut source = Framed::new(a, FrameCodec::new());
        let mut taker = Framed::new(b, FrameCodec::new());

        let mut registry = StatsRegistry::new();
        registry.incr_counter("requests_total", 99);
        let snapshot = registry.snapshot();

        let source_task = tokio::spawn(async move {
            serve_stats(&mut source, snapshot, Duration::from_secs(1))
                .await
                .unwrap();
        });

        let received = fetch_stats(&mut taker, Duration::from_secs(1))
            .await
            .unwrap();
        source_task.await.unwrap();

        let mut fresh = StatsRegistry::new();
        fresh.merge(&received);
        assert_eq!(fresh.counter("requests_total"), 99);
    }

    #[tokio::test]
    async fn test_fetch_times_out_on_silent_source() {
        let (_a, b) = tokio::net::UnixStream::pair().unwrap();
        let mut taker = Framed::new(b, FrameCodec::new());

        let err = fetch_stats(&mut taker, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::PhaseTimeout { .. }));
    }
}
