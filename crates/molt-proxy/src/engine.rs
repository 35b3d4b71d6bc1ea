//! Worker engine: accept loops, per-connection workers, drain and adopt.
//!
//! One engine runs per process instance. It owns the listener and
//! connection registries and the stats registry, and hands them to the
//! coordinator during a handoff. Each listener gets an accept loop task;
//! each connection gets a worker task that exclusively owns the socket
//! and the connection record.
//!
//! The built-in protocol layer is a byte echo: enough to exercise the
//! handoff guarantees (byte order across the boundary, buffered-unread
//! replay) while real protocol codecs stay external collaborators. A
//! worker's continuation blob marks whether its connection is safe to
//! relocate; non-relocatable connections are served until the drain
//! deadline and then force-closed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use molt_core::channel::FdStream;
use molt_core::config::ListenerConfig;
use molt_core::registry::{ConnectionRecord, ConnectionRegistry, ListenerEntry, ListenerRegistry};
use molt_core::stats::{StatsRegistry, StatsSnapshot};
use molt_core::transfer::TransferResult;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How often the drain wait re-checks the connection count.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Listener socket operation failed.
    #[error("listener setup failed for {address}: {source}")]
    ListenerSetup {
        /// Address being set up.
        address: SocketAddr,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Adopted connection could not be re-registered.
    #[error("failed to adopt connection {id}: {source}")]
    AdoptFailed {
        /// Connection id.
        id: Uuid,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// A connection a worker gave up for transfer.
#[derive(Debug)]
pub struct YieldedConnection {
    /// The relocatable state.
    pub record: ConnectionRecord,
    /// The live socket, in blocking mode.
    pub socket: OwnedFd,
}

/// Request for a worker to yield its connection for transfer.
struct YieldRequest {
    reply: oneshot::Sender<Option<YieldedConnection>>,
}

struct WorkerHandle {
    yield_tx: mpsc::Sender<YieldRequest>,
    join: JoinHandle<()>,
}

/// State shared between the engine, accept loops, and workers.
struct Shared {
    listener_registry: RwLock<ListenerRegistry>,
    connection_registry: RwLock<ConnectionRegistry>,
    stats: RwLock<StatsRegistry>,
    workers: RwLock<HashMap<Uuid, WorkerHandle>>,
}

impl Shared {
    async fn incr_counter(&self, name: &str, delta: u64) {
        self.stats.write().await.incr_counter(name, delta);
    }

    async fn update_active_gauge(&self) {
        let active = self.connection_registry.read().await.len();
        #[allow(clippy::cast_precision_loss)] // connection counts are small
        self.stats
            .write()
            .await
            .set_gauge("connections_active", active as f64);
    }

    /// Register a new worker for `stream` and spawn its task.
    async fn spawn_worker(self: &Arc<Self>, stream: TcpStream, record: ConnectionRecord) {
        let id = record.id;
        let (yield_tx, yield_rx) = mpsc::channel(1);

        self.connection_registry.write().await.insert(record.clone());
        self.update_active_gauge().await;

        let join = tokio::spawn(worker_loop(Arc::clone(self), stream, record, yield_rx));
        self.workers
            .write()
            .await
            .insert(id, WorkerHandle { yield_tx, join });
    }

    /// Remove all traces of a worker that exited or yielded.
    async fn forget(&self, id: Uuid) {
        self.workers.write().await.remove(&id);
        self.connection_registry.write().await.remove(id);
        self.update_active_gauge().await;
    }
}

/// The per-process worker engine.
pub struct Engine {
    shared: Arc<Shared>,
    accept_tasks: HashMap<SocketAddr, JoinHandle<()>>,
}

impl Engine {
    /// Create an engine with empty registries.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                listener_registry: RwLock::new(ListenerRegistry::new()),
                connection_registry: RwLock::new(ConnectionRegistry::new()),
                stats: RwLock::new(StatsRegistry::new()),
                workers: RwLock::new(HashMap::new()),
            }),
            accept_tasks: HashMap::new(),
        }
    }

    /// Cold start: bind every configured listener and start accepting.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ListenerSetup`] if any bind fails.
    pub async fn bind_listeners(&mut self, configs: &[ListenerConfig]) -> Result<(), EngineError> {
        for config in configs {
            let std_listener = std::net::TcpListener::bind(config.address).map_err(|source| {
                EngineError::ListenerSetup {
                    address: config.address,
                    source,
                }
            })?;
            self.install_listener(std_listener, config.protocol.clone(), config.address)
                .await?;
        }
        Ok(())
    }

    /// Takeover start: adopt listeners received from the old instance and
    /// start accepting on them.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ListenerSetup`] if a descriptor cannot be
    /// re-registered with the reactor.
    pub async fn adopt_listeners(&mut self, entries: Vec<ListenerEntry>) -> Result<(), EngineError> {
        for entry in entries {
            let std_listener = std::net::TcpListener::from(entry.socket);
            self.install_listener(std_listener, entry.protocol, entry.address)
                .await?;
            info!(address = %entry.address, "accepting on adopted listener");
        }
        Ok(())
    }

    /// Register a listener and spawn its accept loop.
    ///
    /// The registry keeps a duplicate of the descriptor as the canonical
    /// transferable handle; the accept loop owns the original. Both refer
    /// to the same kernel socket, so handing the duplicate to a new
    /// process and then closing both local handles leaves the socket
    /// alive in the new owner only.
    async fn install_listener(
        &mut self,
        std_listener: std::net::TcpListener,
        protocol: String,
        requested: SocketAddr,
    ) -> Result<(), EngineError> {
        let address = std_listener
            .local_addr()
            .map_err(|source| EngineError::ListenerSetup {
                address: requested,
                source,
            })?;
        std_listener
            .set_nonblocking(true)
            .map_err(|source| EngineError::ListenerSetup { address, source })?;

        let canonical = std_listener
            .try_clone()
            .map_err(|source| EngineError::ListenerSetup { address, source })?;
        let listener =
            TcpListener::from_std(std_listener).map_err(|source| EngineError::ListenerSetup {
                address,
                source,
            })?;

        self.shared.listener_registry.write().await.insert(ListenerEntry {
            address,
            protocol: protocol.clone(),
            socket: OwnedFd::from(canonical),
        });

        let task = tokio::spawn(accept_loop(Arc::clone(&self.shared), listener, protocol));
        self.accept_tasks.insert(address, task);
        Ok(())
    }

    /// Source side of the listener phase: offer every listener over the
    /// channel, stopping the matching accept loop as each ack arrives.
    ///
    /// # Errors
    ///
    /// Propagates the transfer error; unacknowledged listeners stay in
    /// the registry with their accept loops still running.
    pub async fn offer_listeners_to(
        &mut self,
        chan: &mut FdStream,
        ack_timeout: Duration,
    ) -> TransferResult<usize> {
        // Stage the entries outside the lock: the protocol waits on acks,
        // and registry readers must not wait with it.
        let mut staged = ListenerRegistry::new();
        staged.restore(self.shared.listener_registry.write().await.take_all());

        let accept_tasks = &mut self.accept_tasks;
        let result =
            molt_core::transfer::listener::offer_listeners(chan, &mut staged, ack_timeout, |addr| {
                if let Some(task) = accept_tasks.remove(&addr) {
                    task.abort();
                    debug!(address = %addr, "accept loop stopped");
                }
            })
            .await;

        if !staged.is_empty() {
            self.shared
                .listener_registry
                .write()
                .await
                .restore(staged.take_all());
        }
        result
    }

    /// Wait until all connections closed naturally or the grace period
    /// expired. Returns the number still open.
    pub async fn wait_drained(&self, grace: Duration) -> usize {
        let wait_for_empty = async {
            loop {
                if self.connection_count().await == 0 {
                    return;
                }
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        };
        let _ = tokio::time::timeout(grace, wait_for_empty).await;
        self.connection_count().await
    }

    /// Ask every live worker to yield its connection for transfer.
    ///
    /// Workers serving non-relocatable connections decline and keep
    /// running; they are the caller's problem (see
    /// [`Self::force_close_remaining`]).
    pub async fn yield_connections(&self, per_conn_timeout: Duration) -> Vec<YieldedConnection> {
        let targets: Vec<(Uuid, mpsc::Sender<YieldRequest>)> = {
            let workers = self.shared.workers.read().await;
            workers
                .iter()
                .map(|(id, h)| (*id, h.yield_tx.clone()))
                .collect()
        };

        let mut yielded = Vec::new();
        for (id, yield_tx) in targets {
            let (reply_tx, reply_rx) = oneshot::channel();
            if yield_tx.send(YieldRequest { reply: reply_tx }).await.is_err() {
                // Worker exited between the scan and the request.
                continue;
            }
            match tokio::time::timeout(per_conn_timeout, reply_rx).await {
                Ok(Ok(Some(conn))) => yielded.push(conn),
                Ok(Ok(None)) => debug!(id = %id, "worker declined to yield"),
                Ok(Err(_)) | Err(_) => warn!(id = %id, "worker did not answer yield request"),
            }
        }
        yielded
    }

    /// Force-close every connection still owned by this engine.
    ///
    /// Used when the drain grace period expires: visible to those peers
    /// as a plain connection termination.
    pub async fn force_close_remaining(&self) -> usize {
        let handles: Vec<(Uuid, WorkerHandle)> = {
            let mut workers = self.shared.workers.write().await;
            workers.drain().collect()
        };

        let mut closed = 0;
        for (id, handle) in handles {
            handle.join.abort();
            self.shared.connection_registry.write().await.remove(id);
            closed += 1;
            warn!(id = %id, "connection force-closed at drain deadline");
        }
        if closed > 0 {
            self.shared
                .incr_counter("connections_force_closed_total", closed as u64)
                .await;
            self.shared.update_active_gauge().await;
        }
        closed
    }

    /// Adopt connections received from the old instance: re-register each
    /// socket with the reactor and resume serving, unread bytes first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AdoptFailed`] if a socket cannot be
    /// re-registered.
    pub async fn adopt_connections(
        &self,
        connections: Vec<(ConnectionRecord, OwnedFd)>,
    ) -> Result<usize, EngineError> {
        let mut adopted: usize = 0;
        for (record, socket) in connections {
            let id = record.id;
            let std_stream = std::net::TcpStream::from(socket);
            let stream = std_stream
                .set_nonblocking(true)
                .and_then(|()| TcpStream::from_std(std_stream))
                .map_err(|source| EngineError::AdoptFailed { id, source })?;

            self.shared.spawn_worker(stream, record).await;
            adopted += 1;
        }
        if adopted > 0 {
            self.shared
                .incr_counter("connections_adopted_total", adopted as u64)
                .await;
        }
        Ok(adopted)
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.shared.connection_registry.read().await.len()
    }

    /// Addresses this engine currently owns listeners for.
    pub async fn listener_addresses(&self) -> Vec<SocketAddr> {
        self.shared.listener_registry.read().await.addresses()
    }

    /// Capture the current stats snapshot.
    pub async fn capture_stats(&self) -> StatsSnapshot {
        self.shared.stats.read().await.snapshot()
    }

    /// Merge the old instance's final snapshot.
    pub async fn merge_stats(&self, snapshot: &StatsSnapshot) {
        self.shared.stats.write().await.merge(snapshot);
    }

    /// Read a counter, for tests and status reporting.
    pub async fn counter(&self, name: &str) -> u64 {
        self.shared.stats.read().await.counter(name)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for task in self.accept_tasks.values() {
            task.abort();
        }
    }
}

/// Accept loop for one listener.
async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, protocol: String) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let Ok(local_addr) = stream.local_addr() else {
                    continue;
                };
                debug!(peer = %peer_addr, local = %local_addr, "connection accepted");
                let record = ConnectionRecord::new(peer_addr, local_addr, protocol.clone());
                shared.incr_counter("connections_accepted_total", 1).await;
                shared.spawn_worker(stream, record).await;
            },
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
            },
        }
    }
}

/// Per-connection worker: echo bytes until the peer closes or the
/// coordinator asks for the connection.
async fn worker_loop(
    shared: Arc<Shared>,
    mut stream: TcpStream,
    mut record: ConnectionRecord,
    mut yield_rx: mpsc::Receiver<YieldRequest>,
) {
    let id = record.id;

    // Replay bytes the previous owner read off the socket but never
    // answered, so the peer sees a seamless byte stream.
    if !record.unread.is_empty() {
        let unread = std::mem::take(&mut record.unread);
        if let Err(e) = stream.write_all(&unread).await {
            debug!(id = %id, error = %e, "replay failed, closing");
            shared.forget(id).await;
            return;
        }
        shared
            .incr_counter("bytes_echoed_total", unread.len() as u64)
            .await;
    }

    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut yield_closed = false;
    let mut pending_yield: Option<YieldRequest> = None;

    loop {
        tokio::select! {
            maybe_req = yield_rx.recv(), if !yield_closed => {
                match maybe_req {
                    Some(req) => pending_yield = Some(req),
                    None => yield_closed = true,
                }
            },
            result = stream.read_buf(&mut buf) => {
                match result {
                    Ok(0) => break,
                    Ok(n) => {
                        record.touch();
                        shared.incr_counter("bytes_echoed_total", n as u64).await;
                        if let Err(e) = stream.write_all(&buf).await {
                            debug!(id = %id, error = %e, "write failed, closing");
                            break;
                        }
                        buf.clear();
                    },
                    Err(e) => {
                        debug!(id = %id, error = %e, "read failed, closing");
                        break;
                    },
                }
            },
        }

        if let Some(req) = pending_yield.take() {
            if !record.is_relocatable() {
                let _ = req.reply.send(None);
                continue;
            }

            record.unread = buf.to_vec();
            record.touch();
            match stream.into_std() {
                Ok(std_stream) => {
                    // Transferred descriptors travel in blocking mode; the
                    // adopting side re-registers them with its reactor.
                    let _ = std_stream.set_nonblocking(false);
                    let _ = req.reply.send(Some(YieldedConnection {
                        record,
                        socket: OwnedFd::from(std_stream),
                    }));
                },
                Err(e) => {
                    warn!(id = %id, error = %e, "could not detach socket for transfer");
                    let _ = req.reply.send(None);
                },
            }
            shared.forget(id).await;
            return;
        }
    }

    debug!(id = %id, "connection closed");
    shared.forget(id).await;
}
