//! Connection transfer protocol.
//!
//! Runs over the connection channel, after listener transfer has finished
//! and the source has started draining. Connections move one at a time,
//! independently; order between connections is irrelevant, but the bytes
//! of a single connection are never reordered: the record's unread buffer
//! is delivered with the descriptor, and the taker replays it to the
//! protocol layer before reading from the socket again.
//!
//! A send blocks until the taker acknowledges. On acknowledgement the
//! source drops its record and its handle to the descriptor; the socket
//! itself stays open, owned now by the taker. Anything unacknowledged
//! when the channel fails stays with the source.

use std::os::fd::{AsFd, OwnedFd};
use std::time::Duration;

use tracing::{debug, info};

use super::{ConnectionMessage, TransferError, TransferResult};
use crate::channel::FdStream;
use crate::registry::ConnectionRecord;

const PHASE: &str = "connection transfer";

/// Source side: hand one connection to the taker.
///
/// Blocks until the taker acknowledges. On success the caller must drop
/// its descriptor handle and remove the record from its registry; on
/// error the caller still owns both.
///
/// # Errors
///
/// Returns a transport error, an ack timeout, or an unexpected message.
pub async fn offer_connection(
    chan: &mut FdStream,
    record: &ConnectionRecord,
    socket: &OwnedFd,
    ack_timeout: Duration,
) -> TransferResult<()> {
    debug!(id = %record.id, peer = %record.peer_addr, unread = record.unread.len(), "offering connection");
    chan.send_msg(
        &ConnectionMessage::Offer {
            record: record.clone(),
        },
        Some(socket.as_fd()),
    )
    .await?;

    let ack = tokio::time::timeout(ack_timeout, chan.recv_msg::<ConnectionMessage>())
        .await
        .map_err(|_| TransferError::phase_timeout(PHASE, ack_timeout))??;

    match ack {
        ConnectionMessage::Ack { id } if id == record.id => {
            info!(id = %record.id, "connection handed over");
            Ok(())
        },
        other => Err(TransferError::unexpected(PHASE, &other)),
    }
}

/// Source side: signal that no more connections will be offered.
///
/// # Errors
///
/// Returns a transport error.
pub async fn finish_connections(chan: &mut FdStream) -> TransferResult<()> {
    chan.send_msg(&ConnectionMessage::Done, None).await?;
    Ok(())
}

/// Taker side: receive connections until the source signals `Done`.
///
/// Each connection is acknowledged only after its record and descriptor
/// have both been captured, so the source never destroys state the taker
/// does not yet own.
///
/// # Errors
///
/// Returns a transport error, an offer without a descriptor, or an
/// unexpected message.
pub async fn receive_connections(
    chan: &mut FdStream,
) -> TransferResult<Vec<(ConnectionRecord, OwnedFd)>> {
    let mut received = Vec::new();

    loop {
        let (msg, fd): (ConnectionMessage, _) = chan.recv_msg_with_fd().await?;
        match msg {
            ConnectionMessage::Offer { record } => {
                let socket = fd.ok_or_else(|| TransferError::MissingDescriptor {
                    what: format!("connection {}", record.id),
                })?;
                let id = record.id;
                received.push((record, socket));
                chan.send_msg(&ConnectionMessage::Ack { id }, None).await?;
                info!(id = %id, "connection received");
            },
            ConnectionMessage::Done => {
                debug!(count = received.len(), "connection transfer complete");
                return Ok(received);
            },
            other => return Err(TransferError::unexpected(PHASE, &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    /// Build a live client<->server TCP pair and a record for the server
    /// side, as if the proxy had accepted the client.
    async fn accepted_connection() -> (tokio::net::TcpStream, ConnectionRecord, OwnedFd) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, (server, peer_addr)) =
            tokio::join!(tokio::net::TcpStream::connect(addr), async {
                listener.accept().await.unwrap()
            });
        let client = client.unwrap();

        let record = ConnectionRecord::new(peer_addr, addr, "echo");
        let std_server = server.into_std().unwrap();
        // Transferred descriptors start out blocking; the receiver makes
        // them nonblocking when it re-registers with its reactor.
        std_server.set_nonblocking(false).unwrap();
        (client, record, OwnedFd::from(std_server))
    }

    fn stream_from(socket: OwnedFd) -> tokio::net::TcpStream {
        let std_stream = std::net::TcpStream::from(socket);
        std_stream.set_nonblocking(true).unwrap();
        tokio::net::TcpStream::from_std(std_stream).unwrap()
    }

    #[tokio::test]
    async fn test_single_connection_handoff_preserves_bytes() {
        let (mut source_chan, mut taker_chan) = FdStream::pair().unwrap();
        let (mut client, mut record, socket) = accepted_connection().await;

        // The old instance read part of a request before the handoff.
        client.write_all(b"hello across restart").await.unwrap();
        let mut partial = [0u8; 6];
        {
            let mut server = stream_from(socket);
            server.read_exact(&mut partial).await.unwrap();
            record.unread = partial.to_vec();
            record.continuation = Some(b"resume-state".to_vec());
            // Give the descriptor back for transfer.
            let std_stream = server.into_std().unwrap();
            std_stream.set_nonblocking(false).unwrap();
            let socket = OwnedFd::from(std_stream);

            let source = tokio::spawn({
                let record = record.clone();
                async move {
                    offer_connection(&mut source_chan, &record, &socket, Duration::from_secs(1))
                        .await
                        .unwrap();
                    finish_connections(&mut source_chan).await.unwrap();
                }
            });

            let received = receive_connections(&mut taker_chan).await.unwrap();
            source.await.unwrap();

            assert_eq!(received.len(), 1);
            let (received_record, received_fd) = received.into_iter().next().unwrap();
            assert_eq!(received_record.id, record.id);
            assert_eq!(received_record.unread, b"hello ");
            assert_eq!(received_record.continuation, Some(b"resume-state".to_vec()));

            // The taker resumes: replay unread, then read the rest.
            let mut resumed = stream_from(received_fd);
            let mut rest = vec![0u8; 14];
            resumed.read_exact(&mut rest).await.unwrap();

            let mut full = received_record.unread.clone();
            full.extend_from_slice(&rest);
            assert_eq!(full, b"hello across restart");

            // And the peer is still connected: echo something back.
            resumed.write_all(b"ok").await.unwrap();
            let mut reply = [0u8; 2];
            client.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply, b"ok");
        }
    }

    #[tokio::test]
    async fn test_done_with_no_connections() {
        let (mut source_chan, mut taker_chan) = FdStream::pair().unwrap();

        let source = tokio::spawn(async move {
            finish_connections(&mut source_chan).await.unwrap();
        });

        let received = receive_connections(&mut taker_chan).await.unwrap();
        assert!(received.is_empty());
        source.await.unwrap();
    }

    #[tokio::test]
    async fn test_ack_timeout_leaves_ownership_with_source() {
        let (mut source_chan, mut taker_chan) = FdStream::pair().unwrap();
        let (_client, record, socket) = accepted_connection().await;

        let source = tokio::spawn(async move {
            let result =
                offer_connection(&mut source_chan, &record, &socket, Duration::from_millis(50))
                    .await;
            // Error: the source still owns `record` and `socket`.
            assert!(matches!(result, Err(TransferError::PhaseTimeout { .. })));
            socket
        });

        // Taker reads the offer but never acks.
        let (_msg, fd): (ConnectionMessage, _) = taker_chan.recv_msg_with_fd().await.unwrap();
        assert!(fd.is_some());

        // The source's descriptor handle survives the failed offer.
        let socket = source.await.unwrap();
        let std_stream = std::net::TcpStream::from(socket);
        assert!(std_stream.peer_addr().is_ok());
    }
}
