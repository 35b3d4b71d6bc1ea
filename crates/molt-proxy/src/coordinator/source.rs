//! Source side of a handoff: the old instance giving up its resources.

use molt_core::channel::{
    ChannelEndpoint, ChannelError, ChannelPurpose, connect_framed_with_retry, connect_with_retry,
};
use molt_core::config::{HandoffConfig, HandoffSettings};
use molt_core::session::{HandoffState, TransferSession};
use molt_core::transfer::{connection, reconfigure, stats};
use tracing::{info, warn};
use uuid::Uuid;

use super::CoordinatorError;
use crate::engine::Engine;

/// What a completed handoff moved to the taker.
#[derive(Debug)]
pub struct HandoffReport {
    /// Session id, for correlating both processes' logs.
    pub session_id: Uuid,
    /// Pid the taker announced itself with.
    pub taker_pid: u32,
    /// Listeners acknowledged by the taker.
    pub listeners_transferred: usize,
    /// Connections that survived the drain and were acknowledged.
    pub connections_transferred: usize,
    /// Connections terminated at the drain deadline.
    pub connections_force_closed: usize,
}

/// Run the source side end to end: bind the reconfigure channel, wait
/// for a taker, and hand everything over.
///
/// On any failure the session is aborted and the engine keeps (or
/// re-adopts) whatever the taker never acknowledged, so this instance
/// can simply keep serving.
///
/// # Errors
///
/// Returns the error that aborted the handoff.
pub async fn run_source(
    engine: &mut Engine,
    config: &HandoffConfig,
) -> Result<HandoffReport, CoordinatorError> {
    let reconfig =
        ChannelEndpoint::bind(&config.handoff.runtime_dir, ChannelPurpose::ReconfigureAck)?;
    run_source_on(reconfig, engine, config).await
}

/// Run the source side on an already-bound reconfigure endpoint.
///
/// Split out so the reload path can bind before spawning the successor
/// process, guaranteeing the socket exists when the successor dials it.
///
/// # Errors
///
/// Returns the error that aborted the handoff.
pub async fn run_source_on(
    reconfig: ChannelEndpoint,
    engine: &mut Engine,
    config: &HandoffConfig,
) -> Result<HandoffReport, CoordinatorError> {
    let mut session = TransferSession::new();
    info!(session = %session.id(), "handoff starting");

    match drive(reconfig, engine, config, &mut session).await {
        Ok(report) => {
            info!(
                session = %session.id(),
                taker_pid = report.taker_pid,
                listeners = report.listeners_transferred,
                connections = report.connections_transferred,
                force_closed = report.connections_force_closed,
                "handoff complete"
            );
            Ok(report)
        },
        Err(e) => {
            warn!(
                session = %session.id(),
                state = %session.state(),
                error = %e,
                "handoff aborted, continuing to serve"
            );
            if let Err(abort_err) = session.abort() {
                warn!(session = %session.id(), error = %abort_err, "session abort refused");
            }
            Err(e)
        },
    }
}

async fn drive(
    mut reconfig: ChannelEndpoint,
    engine: &mut Engine,
    config: &HandoffConfig,
    session: &mut TransferSession,
) -> Result<HandoffReport, CoordinatorError> {
    let settings = &config.handoff;
    session.advance(HandoffState::Spawning)?;

    let mut ack_chan = tokio::time::timeout(settings.first_contact_timeout, reconfig.accept_framed())
        .await
        .map_err(|_| ChannelError::timeout(settings.first_contact_timeout))??;
    let taker_pid = reconfigure::await_announcement(&mut ack_chan).await?;

    // A process with nothing to give turns the taker away; it will cold
    // start instead of waiting on empty channels.
    if engine.listener_addresses().await.is_empty() {
        reconfigure::answer_takeover(&mut ack_chan, Err("no listeners to transfer".to_string()))
            .await?;
        return Err(CoordinatorError::Transfer(
            molt_core::transfer::TransferError::Rejected {
                reason: "no listeners to transfer".to_string(),
            },
        ));
    }
    reconfigure::answer_takeover(&mut ack_chan, Ok(())).await?;

    session.advance(HandoffState::ListenersTransferring)?;
    let mut listen_chan = connect_with_retry(
        &settings.runtime_dir,
        ChannelPurpose::Listeners,
        settings.channel_connect_attempts,
        settings.channel_connect_backoff,
    )
    .await?;
    let listeners_transferred = engine
        .offer_listeners_to(&mut listen_chan, settings.listener_ack_timeout)
        .await?;

    session.advance(HandoffState::Draining)?;
    session.arm_drain_deadline(settings.grace_period);
    let budget = session.drain_budget().unwrap_or(settings.grace_period);
    let still_open = engine.wait_drained(budget).await;
    info!(still_open, "drain finished");

    session.advance(HandoffState::ConnectionsTransferring)?;
    let mut conn_chan = connect_with_retry(
        &settings.runtime_dir,
        ChannelPurpose::Connections,
        settings.channel_connect_attempts,
        settings.channel_connect_backoff,
    )
    .await?;

    let mut connections_transferred = 0;
    let mut remaining = engine
        .yield_connections(settings.connection_ack_timeout)
        .await
        .into_iter();
    while let Some(conn) = remaining.next() {
        match connection::offer_connection(
            &mut conn_chan,
            &conn.record,
            &conn.socket,
            settings.connection_ack_timeout,
        )
        .await
        {
            Ok(()) => connections_transferred += 1,
            Err(e) => {
                // Everything unacknowledged comes back home before the
                // abort, so no connection is left ownerless.
                let mut orphans = vec![conn];
                orphans.extend(remaining);
                let pairs = orphans.into_iter().map(|y| (y.record, y.socket)).collect();
                if let Err(adopt_err) = engine.adopt_connections(pairs).await {
                    warn!(error = %adopt_err, "failed to re-adopt unacknowledged connections");
                }
                return Err(e.into());
            },
        }
    }
    connection::finish_connections(&mut conn_chan).await?;
    let connections_force_closed = engine.force_close_remaining().await;

    session.advance(HandoffState::StatsTransferring)?;

    // The taker owns every listener and connection at this point; a
    // failure in the remaining exchanges costs it the inherited counters,
    // nothing more. Aborting here would leave both processes with a half
    // of the resources each needs, so these steps degrade instead.
    if let Err(e) = serve_final_stats(engine, settings).await {
        warn!(error = %e, "stats handoff failed, taker starts from fresh stats");
    }
    if let Err(e) = reconfigure::report_complete(&mut ack_chan, settings.stats_timeout).await {
        warn!(error = %e, "completion exchange failed, exiting regardless");
    }
    session.advance(HandoffState::Complete)?;

    // The taker owns the runtime directory now; it may rebind the
    // reconfigure socket before this process gets around to exiting.
    reconfig.disarm_cleanup();

    Ok(HandoffReport {
        session_id: session.id(),
        taker_pid,
        listeners_transferred,
        connections_transferred,
        connections_force_closed,
    })
}

async fn serve_final_stats(
    engine: &Engine,
    settings: &HandoffSettings,
) -> Result<(), CoordinatorError> {
    let snapshot = engine.capture_stats().await;
    let mut stats_chan = connect_framed_with_retry(
        &settings.runtime_dir,
        ChannelPurpose::Stats,
        settings.channel_connect_attempts,
        settings.channel_connect_backoff,
    )
    .await?;
    stats::serve_stats(&mut stats_chan, snapshot, settings.stats_timeout).await?;
    Ok(())
}
