//! Taker side of a handoff: the new instance claiming resources.

use std::time::Duration;

use molt_core::channel::{ChannelEndpoint, ChannelError, ChannelPurpose, connect_framed_with_retry};
use molt_core::config::{HandoffConfig, HandoffSettings};
use molt_core::transfer::{connection, listener, reconfigure, stats};
use tracing::{info, warn};

use super::CoordinatorError;
use crate::engine::Engine;

/// What the taker received from the source.
#[derive(Debug)]
pub struct TakeoverOutcome {
    /// Listeners adopted and now accepting.
    pub listeners_adopted: usize,
    /// Live connections adopted mid-stream.
    pub connections_adopted: usize,
    /// Metrics carried in the source's final snapshot.
    pub stats_metrics_merged: usize,
}

/// Run the taker side end to end.
///
/// Binds the listener, connection, and stats channels, announces the
/// takeover on the source's reconfigure channel, then works through the
/// phases as the source dials each channel in turn. Once listeners and
/// connections have been adopted the takeover is committed: stats and
/// completion-report failures degrade to warnings and the outcome is
/// still a success, with fresh stats.
///
/// # Errors
///
/// Returns [`molt_core::transfer::TransferError::Rejected`] (wrapped) if
/// the source turned the takeover away, and channel or transfer errors
/// for failures before the connection phase finished. The caller decides
/// whether to fall back to a cold start.
pub async fn run_taker(
    engine: &mut Engine,
    config: &HandoffConfig,
) -> Result<TakeoverOutcome, CoordinatorError> {
    let settings = &config.handoff;

    // Bind our channels before announcing, so the source can dial them
    // the moment it accepts.
    let listen_ep = ChannelEndpoint::bind(&settings.runtime_dir, ChannelPurpose::Listeners)?;
    let conn_ep = ChannelEndpoint::bind(&settings.runtime_dir, ChannelPurpose::Connections)?;
    let stats_ep = ChannelEndpoint::bind(&settings.runtime_dir, ChannelPurpose::Stats)?;

    let mut ack_chan = connect_framed_with_retry(
        &settings.runtime_dir,
        ChannelPurpose::ReconfigureAck,
        settings.channel_connect_attempts,
        settings.channel_connect_backoff,
    )
    .await?;
    reconfigure::announce_takeover(
        &mut ack_chan,
        std::process::id(),
        settings.first_contact_timeout,
    )
    .await?;

    let mut listen_chan = accept_within(settings.first_contact_timeout, listen_ep.accept()).await?;
    let entries = listener::request_listeners(&mut listen_chan).await?;
    let listeners_adopted = entries.len();
    engine.adopt_listeners(entries).await?;
    info!(listeners = listeners_adopted, "accepting on adopted listeners");

    // The source drains before dialing the connection channel, so this
    // accept may legitimately take the whole grace period.
    let conn_accept_budget = settings.grace_period + settings.first_contact_timeout;
    let mut conn_chan = accept_within(conn_accept_budget, conn_ep.accept()).await?;
    let received = connection::receive_connections(&mut conn_chan).await?;
    let connections_adopted = engine.adopt_connections(received).await?;

    // The takeover already succeeded: this instance owns the listeners
    // and every surviving connection. Failing out of the remaining
    // exchanges would strand those resources in a process about to be
    // treated as broken, so stats and the goodbye are best-effort.
    let stats_metrics_merged = match fetch_source_stats(engine, settings, &stats_ep).await {
        Ok(merged) => merged,
        Err(e) => {
            warn!(error = %e, "stats handoff failed, starting from fresh stats");
            0
        },
    };
    if let Err(e) = reconfigure::await_complete(&mut ack_chan, settings.first_contact_timeout).await
    {
        warn!(error = %e, "completion exchange failed, serving regardless");
    }
    info!(
        listeners = listeners_adopted,
        connections = connections_adopted,
        metrics = stats_metrics_merged,
        "takeover complete"
    );

    Ok(TakeoverOutcome {
        listeners_adopted,
        connections_adopted,
        stats_metrics_merged,
    })
}

async fn fetch_source_stats(
    engine: &Engine,
    settings: &HandoffSettings,
    stats_ep: &ChannelEndpoint,
) -> Result<usize, CoordinatorError> {
    let mut stats_chan = accept_within(settings.stats_timeout, stats_ep.accept_framed()).await?;
    let snapshot = stats::fetch_stats(&mut stats_chan, settings.stats_timeout).await?;
    let merged = snapshot.metrics.len();
    engine.merge_stats(&snapshot).await;
    Ok(merged)
}

async fn accept_within<T>(
    budget: Duration,
    accept: impl std::future::Future<Output = Result<T, ChannelError>>,
) -> Result<T, CoordinatorError> {
    let value = tokio::time::timeout(budget, accept)
        .await
        .map_err(|_| ChannelError::timeout(budget))??;
    Ok(value)
}
