//! Reconfigure acknowledgement protocol.
//!
//! The fourth channel brackets the whole session. The taker announces
//! itself before touching any other channel; this is also how a directly
//! spawned instance (no signal involved) initiates a session in the
//! source. At the end, the source reports `DrainComplete` and waits for
//! the taker's `Goodbye` before exiting, so the taker is never surprised
//! by the source vanishing mid-protocol.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, info};

use super::{ReconfigureMessage, TransferError, TransferResult, recv_framed, send_framed};
use crate::channel::FrameCodec;

const PHASE: &str = "reconfigure ack";

/// Taker side: announce the takeover and wait for the verdict.
///
/// # Errors
///
/// Returns [`TransferError::Rejected`] if the source declines the
/// takeover, otherwise transport or unexpected-message errors.
pub async fn announce_takeover<S>(
    framed: &mut Framed<S, FrameCodec>,
    pid: u32,
    timeout: Duration,
) -> TransferResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_framed(framed, &ReconfigureMessage::TakeoverStarted { pid }).await?;

    let verdict = tokio::time::timeout(timeout, recv_framed::<ReconfigureMessage, _>(framed))
        .await
        .map_err(|_| TransferError::phase_timeout(PHASE, timeout))??;

    match verdict {
        ReconfigureMessage::TakeoverAccepted => {
            debug!("takeover accepted by source");
            Ok(())
        },
        ReconfigureMessage::TakeoverRejected { reason } => Err(TransferError::Rejected { reason }),
        other => Err(TransferError::unexpected(PHASE, &other)),
    }
}

/// Source side: receive the taker's announcement.
///
/// Returns the taker's pid; the caller decides acceptance and answers
/// with [`answer_takeover`].
///
/// # Errors
///
/// Returns transport or unexpected-message errors.
pub async fn await_announcement<S>(framed: &mut Framed<S, FrameCodec>) -> TransferResult<u32>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let msg = recv_framed::<ReconfigureMessage, _>(framed).await?;
    match msg {
        ReconfigureMessage::TakeoverStarted { pid } => {
            info!(taker_pid = pid, "takeover announced");
            Ok(pid)
        },
        other => Err(TransferError::unexpected(PHASE, &other)),
    }
}

/// Source side: accept or reject the announced takeover.
///
/// # Errors
///
/// Returns a transport error.
pub async fn answer_takeover<S>(
    framed: &mut Framed<S, FrameCodec>,
    verdict: Result<(), String>,
) -> TransferResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let msg = match verdict {
        Ok(()) => ReconfigureMessage::TakeoverAccepted,
        Err(reason) => ReconfigureMessage::TakeoverRejected { reason },
    };
    send_framed(framed, &msg).await
}

/// Source side: report completion and wait for the taker's goodbye.
///
/// # Errors
///
/// Returns transport, timeout, or unexpected-message errors. A failure
/// here no longer endangers any resource: everything has already been
/// handed over.
pub async fn report_complete<S>(
    framed: &mut Framed<S, FrameCodec>,
    timeout: Duration,
) -> TransferResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_framed(framed, &ReconfigureMessage::DrainComplete).await?;

    let goodbye = tokio::time::timeout(timeout, recv_framed::<ReconfigureMessage, _>(framed))
        .await
        .map_err(|_| TransferError::phase_timeout(PHASE, timeout))??;

    match goodbye {
        ReconfigureMessage::Goodbye => {
            info!("taker confirmed completion");
            Ok(())
        },
        other => Err(TransferError::unexpected(PHASE, &other)),
    }
}

/// Taker side: wait for the source's completion report and answer it.
///
/// # Errors
///
/// Returns transport, timeout, or unexpected-message errors.
pub async fn await_complete<S>(
    framed: &mut Framed<S, FrameCodec>,
    timeout: Duration,
) -> TransferResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let msg = tokio::time::timeout(timeout, recv_framed::<ReconfigureMessage, _>(framed))
        .await
        .map_err(|_| TransferError::phase_timeout(PHASE, timeout))??;

    match msg {
        ReconfigureMessage::DrainComplete => {
            send_framed(framed, &ReconfigureMessage::Goodbye).await?;
            Ok(())
        },
        other => Err(TransferError::unexpected(PHASE, &other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (
        Framed<tokio::net::UnixStream, FrameCodec>,
        Framed<tokio::net::UnixStream, FrameCodec>,
    ) {
        let (a, b) = tokio::net::UnixStream::pair().unwrap();
        (
            Framed::new(a, FrameCodec::new()),
            Framed::new(b, FrameCodec::new()),
        )
    }

    #[tokio::test]
    async fn test_accepted_takeover_and_completion() {
        let (mut source, mut taker) = pair();

        let source_task = tokio::spawn(async move {
            let pid = await_announcement(&mut source).await.unwrap();
            assert!(pid > 0);
            answer_takeover(&mut source, Ok(())).await.unwrap();
            report_complete(&mut source, Duration::from_secs(1))
                .await
                .unwrap();
        });

        announce_takeover(&mut taker, std::process::id(), Duration::from_secs(1))
            .await
            .unwrap();
        await_complete(&mut taker, Duration::from_secs(1))
            .await
            .unwrap();
        source_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_takeover() {
        let (mut source, mut taker) = pair();

        let source_task = tokio::spawn(async move {
            await_announcement(&mut source).await.unwrap();
            answer_takeover(&mut source, Err("session in flight".to_string()))
                .await
                .unwrap();
        });

        let err = announce_takeover(&mut taker, 1234, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Rejected { .. }));
        source_task.await.unwrap();
    }
}
