//! End-to-end handoff between two engines inside one process.
//!
//! Drives the real source and taker coordinators over real Unix domain
//! sockets in a scratch runtime directory, with live TCP clients
//! observing the restart from outside.

use std::os::fd::OwnedFd;
use std::time::Duration;

use molt_core::channel::{ChannelEndpoint, ChannelPurpose, connect_framed_with_retry, connect_with_retry};
use molt_core::config::{HandoffConfig, HandoffSettings, ListenerConfig};
use molt_core::registry::{ListenerEntry, ListenerRegistry};
use molt_core::transfer::{TransferError, connection, listener, reconfigure};
use molt_proxy::coordinator::{CoordinatorError, run_source, run_taker};
use molt_proxy::engine::Engine;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn test_config(dir: &TempDir) -> HandoffConfig {
    HandoffConfig {
        handoff: HandoffSettings {
            runtime_dir: dir.path().to_path_buf(),
            grace_period: Duration::from_millis(200),
            ..HandoffSettings::default()
        },
        listeners: Vec::new(),
    }
}

async fn engine_with_listener() -> (Engine, std::net::SocketAddr) {
    let mut engine = Engine::new();
    engine
        .bind_listeners(&[ListenerConfig {
            address: "127.0.0.1:0".parse().unwrap(),
            protocol: "echo".to_string(),
        }])
        .await
        .unwrap();
    let addr = engine.listener_addresses().await[0];
    (engine, addr)
}

async fn echo_check(client: &mut tokio::net::TcpStream, payload: &[u8]) {
    client.write_all(payload).await.unwrap();
    let mut reply = vec![0u8; payload.len()];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, payload);
}

#[tokio::test]
async fn test_handoff_preserves_live_connection() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let (mut old, addr) = engine_with_listener().await;
    let mut new = Engine::new();

    // A client mid-conversation when the restart begins.
    let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
    echo_check(&mut client, b"before restart").await;

    let (source_result, taker_result) =
        tokio::join!(run_source(&mut old, &config), run_taker(&mut new, &config));

    let report = source_result.unwrap();
    assert_eq!(report.listeners_transferred, 1);
    assert_eq!(report.connections_transferred, 1);
    assert_eq!(report.connections_force_closed, 0);

    let outcome = taker_result.unwrap();
    assert_eq!(outcome.listeners_adopted, 1);
    assert_eq!(outcome.connections_adopted, 1);

    // The old instance is empty; the connection lives on in the new one.
    assert_eq!(old.connection_count().await, 0);
    assert_eq!(new.connection_count().await, 1);
    echo_check(&mut client, b"after restart").await;

    // New connections land on the adopted listener.
    let mut late_client = tokio::net::TcpStream::connect(addr).await.unwrap();
    echo_check(&mut late_client, b"fresh").await;

    // Stats were merged: the new engine's view covers both generations.
    assert_eq!(new.counter("connections_accepted_total").await, 2);
    assert_eq!(new.counter("connections_adopted_total").await, 1);
}

#[tokio::test]
async fn test_handoff_with_no_connections() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let (mut old, addr) = engine_with_listener().await;
    let mut new = Engine::new();

    let (source_result, taker_result) =
        tokio::join!(run_source(&mut old, &config), run_taker(&mut new, &config));

    assert_eq!(source_result.unwrap().connections_transferred, 0);
    assert_eq!(taker_result.unwrap().connections_adopted, 0);

    let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
    echo_check(&mut client, b"served by successor").await;
}

#[tokio::test]
async fn test_takeover_rejected_when_source_has_nothing() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    // A source that already gave everything away has nothing to offer.
    let mut old = Engine::new();
    let mut new = Engine::new();

    let (source_result, taker_result) =
        tokio::join!(run_source(&mut old, &config), run_taker(&mut new, &config));

    assert!(matches!(
        source_result,
        Err(CoordinatorError::Transfer(TransferError::Rejected { .. }))
    ));
    assert!(matches!(
        taker_result,
        Err(CoordinatorError::Transfer(TransferError::Rejected { .. }))
    ));
}

#[tokio::test]
async fn test_source_completes_when_stats_phase_fails() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let (mut old, _addr) = engine_with_listener().await;

    // A taker that claims the listener set and finishes the connection
    // phase, then dies before answering the stats request.
    let dir_path = dir.path().to_path_buf();
    let taker = tokio::spawn(async move {
        let listen_ep = ChannelEndpoint::bind(&dir_path, ChannelPurpose::Listeners).unwrap();
        let conn_ep = ChannelEndpoint::bind(&dir_path, ChannelPurpose::Connections).unwrap();
        let stats_ep = ChannelEndpoint::bind(&dir_path, ChannelPurpose::Stats).unwrap();

        let mut ack_chan = connect_framed_with_retry(
            &dir_path,
            ChannelPurpose::ReconfigureAck,
            10,
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        reconfigure::announce_takeover(&mut ack_chan, std::process::id(), Duration::from_secs(1))
            .await
            .unwrap();

        let mut listen_chan = listen_ep.accept().await.unwrap();
        let entries = listener::request_listeners(&mut listen_chan).await.unwrap();

        let mut conn_chan = conn_ep.accept().await.unwrap();
        let received = connection::receive_connections(&mut conn_chan).await.unwrap();

        // Take the stats connection and hang up without answering.
        let stats_chan = stats_ep.accept_framed().await.unwrap();
        drop(stats_chan);
        (entries, received)
    });

    // The source still completes: every resource is already the taker's,
    // only the inherited counters are lost.
    let report = run_source(&mut old, &config).await.unwrap();
    assert_eq!(report.listeners_transferred, 1);
    assert_eq!(report.connections_transferred, 0);
    assert!(old.listener_addresses().await.is_empty());

    let (entries, received) = taker.await.unwrap();
    assert_eq!(entries.len(), 1);
    assert!(received.is_empty());
}

#[tokio::test]
async fn test_taker_keeps_adopted_listeners_when_stats_phase_fails() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.handoff.stats_timeout = Duration::from_millis(200);

    // A source that hands over one listener, closes out the connection
    // phase, then dies before serving stats or reporting completion.
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    let dir_path = dir.path().to_path_buf();
    let source = tokio::spawn(async move {
        let reconfig = ChannelEndpoint::bind(&dir_path, ChannelPurpose::ReconfigureAck).unwrap();
        let mut ack_chan = reconfig.accept_framed().await.unwrap();
        reconfigure::await_announcement(&mut ack_chan).await.unwrap();
        reconfigure::answer_takeover(&mut ack_chan, Ok(())).await.unwrap();

        let mut registry = ListenerRegistry::new();
        registry.insert(ListenerEntry {
            address: addr,
            protocol: "echo".to_string(),
            socket: OwnedFd::from(std_listener),
        });
        let mut listen_chan = connect_with_retry(
            &dir_path,
            ChannelPurpose::Listeners,
            10,
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        listener::offer_listeners(&mut listen_chan, &mut registry, Duration::from_secs(1), |_| {})
            .await
            .unwrap();

        let mut conn_chan = connect_with_retry(
            &dir_path,
            ChannelPurpose::Connections,
            10,
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        connection::finish_connections(&mut conn_chan).await.unwrap();
    });

    let mut engine = Engine::new();
    let outcome = run_taker(&mut engine, &config).await.unwrap();
    source.await.unwrap();

    assert_eq!(outcome.listeners_adopted, 1);
    assert_eq!(outcome.stats_metrics_merged, 0);

    // The adopted listener is live; no rebind of its address is needed
    // or possible.
    assert_eq!(engine.listener_addresses().await, vec![addr]);
    let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
    echo_check(&mut client, b"still served").await;
}

#[tokio::test]
async fn test_two_generations_chain() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let (mut gen1, addr) = engine_with_listener().await;
    let mut gen2 = Engine::new();
    let (r1, t1) = tokio::join!(run_source(&mut gen1, &config), run_taker(&mut gen2, &config));
    r1.unwrap();
    t1.unwrap();

    let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
    echo_check(&mut client, b"gen2").await;

    // Second restart over the same runtime directory, client still open.
    let mut gen3 = Engine::new();
    let (r2, t2) = tokio::join!(run_source(&mut gen2, &config), run_taker(&mut gen3, &config));
    assert_eq!(r2.unwrap().connections_transferred, 1);
    t2.unwrap();

    echo_check(&mut client, b"gen3").await;
    assert_eq!(gen3.connection_count().await, 1);

    // Counters survived both hops.
    assert_eq!(gen3.counter("connections_accepted_total").await, 1);
    assert_eq!(gen3.counter("connections_adopted_total").await, 2);
}
