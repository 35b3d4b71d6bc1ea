//! Listener transfer protocol.
//!
//! Runs over the listener channel, first of the transfer phases. Each
//! listener is offered with its descriptor and acknowledged individually:
//!
//! ```text
//! taker                          source
//!   │ ── Request ──────────────────▶ │
//!   │ ◀───────────────── Announce ── │
//!   │ ◀─────────── Offer + fd(1) ─── │   source still accepting on 1
//!   │ ── Ack(1) ───────────────────▶ │   source closes its handle to 1
//!   │ ◀─────────── Offer + fd(2) ─── │
//!   │ ── Ack(2) ───────────────────▶ │
//!   ⋮
//! ```
//!
//! The source keeps accepting on every listener whose ack has not arrived,
//! so no address ever has zero acceptors. If the taker disconnects or an
//! ack times out, all unacknowledged listeners are restored to the source
//! registry and the session aborts; never two acceptors, never zero.

use std::net::SocketAddr;
use std::time::Duration;

use std::os::fd::AsFd;
use tracing::{debug, info, warn};

use super::{ListenerMessage, TransferError, TransferResult};
use crate::channel::FdStream;
use crate::registry::{ListenerEntry, ListenerRegistry};

const PHASE: &str = "listener transfer";

/// Source side: hand every registered listener to the taker.
///
/// Listeners are removed from `registry` as they are acknowledged;
/// `on_acked` fires per listener so the caller can stop the matching
/// accept loop. On any failure the unacknowledged listeners are restored
/// to `registry` before the error is returned.
///
/// # Errors
///
/// Returns a transport error, an unexpected-message error, or a
/// per-listener ack timeout. In every error case the registry again owns
/// all listeners that were not acknowledged.
pub async fn offer_listeners(
    chan: &mut FdStream,
    registry: &mut ListenerRegistry,
    ack_timeout: Duration,
    mut on_acked: impl FnMut(SocketAddr),
) -> TransferResult<usize> {
    let request: ListenerMessage = chan.recv_msg().await?;
    if !matches!(request, ListenerMessage::Request) {
        return Err(TransferError::unexpected(PHASE, &request));
    }

    let mut entries = registry.take_all();
    let count = entries.len();
    debug!(count, "offering listeners");

    #[allow(clippy::cast_possible_truncation)] // listener counts are tiny
    chan.send_msg(
        &ListenerMessage::Announce {
            count: count as u32,
        },
        None,
    )
    .await?;

    let mut transferred = 0usize;
    while !entries.is_empty() {
        let entry = entries.remove(0);

        let result = offer_one(chan, &entry, ack_timeout).await;
        match result {
            Ok(()) => {
                info!(address = %entry.address, "listener handed over");
                on_acked(entry.address);
                transferred += 1;
                // Dropping the entry closes our handle; the resource
                // itself now lives in the taker.
                drop(entry);
            },
            Err(e) => {
                warn!(address = %entry.address, error = %e, "listener handoff failed, keeping unacknowledged listeners");
                entries.insert(0, entry);
                registry.restore(entries);
                return Err(e);
            },
        }
    }

    Ok(transferred)
}

async fn offer_one(
    chan: &mut FdStream,
    entry: &ListenerEntry,
    ack_timeout: Duration,
) -> TransferResult<()> {
    chan.send_msg(
        &ListenerMessage::Offer {
            address: entry.address,
            protocol: entry.protocol.clone(),
        },
        Some(entry.socket.as_fd()),
    )
    .await?;

    let ack = tokio::time::timeout(ack_timeout, chan.recv_msg::<ListenerMessage>())
        .await
        .map_err(|_| TransferError::phase_timeout(PHASE, ack_timeout))??;

    match ack {
        ListenerMessage::Ack { address } if address == entry.address => Ok(()),
        other => Err(TransferError::unexpected(PHASE, &other)),
    }
}

/// Taker side: request and receive the full listener set.
///
/// Each received listener is acknowledged only after its descriptor has
/// been captured, so the source never closes a listener the taker does
/// not yet own. The caller starts accepting once this returns.
///
/// # Errors
///
/// Returns a transport error, an offer without a descriptor, or an
/// unexpected message.
pub async fn request_listeners(chan: &mut FdStream) -> TransferResult<Vec<ListenerEntry>> {
    chan.send_msg(&ListenerMessage::Request, None).await?;

    let announce: ListenerMessage = chan.recv_msg().await?;
    let count = match announce {
        ListenerMessage::Announce { count } => count,
        other => return Err(TransferError::unexpected(PHASE, &other)),
    };
    debug!(count, "receiving listeners");

    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (msg, fd): (ListenerMessage, _) = chan.recv_msg_with_fd().await?;
        let (address, protocol) = match msg {
            ListenerMessage::Offer { address, protocol } => (address, protocol),
            other => return Err(TransferError::unexpected(PHASE, &other)),
        };
        let socket = fd.ok_or_else(|| TransferError::MissingDescriptor {
            what: format!("listener {address}"),
        })?;

        entries.push(ListenerEntry {
            address,
            protocol,
            socket,
        });
        chan.send_msg(&ListenerMessage::Ack { address }, None).await?;
        info!(address = %address, "listener received");
    }

    Ok(entries)
}
