//! Domain channels: local-only control-plane transport for handoff.
//!
//! Four point-to-point channels connect an old and a new instance during a
//! transfer session, one per purpose. The old instance binds the
//! reconfigure channel and dials the rest; the new instance binds the
//! listener, connection, and stats channels before announcing itself.
//! Application traffic never flows here.
//!
//! # Layers
//!
//! - [`framing`]: length-prefixed frame codec ([`FrameCodec`])
//! - [`fdpass`]: framed transport with `SCM_RIGHTS` descriptor passing
//!   ([`FdStream`])
//! - this module: channel purposes, socket addressing, bind/accept and
//!   connect-with-retry lifecycle

pub mod error;
pub mod fdpass;
pub mod framing;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::os::fd::{BorrowedFd, OwnedFd};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

pub use error::{ChannelError, ChannelResult};
pub use fdpass::FdStream;
pub use framing::{FrameCodec, MAX_FRAME_SIZE};

/// The purpose of a domain channel.
///
/// Each purpose gets its own socket so the four transfer protocols never
/// interleave on one byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelPurpose {
    /// Listener descriptor handoff.
    Listeners,
    /// Live connection handoff.
    Connections,
    /// Stats snapshot handoff.
    Stats,
    /// Takeover announcement and completion acknowledgement.
    ReconfigureAck,
}

impl ChannelPurpose {
    /// All purposes, in the order a session touches them.
    pub const ALL: [Self; 4] = [
        Self::ReconfigureAck,
        Self::Listeners,
        Self::Connections,
        Self::Stats,
    ];

    /// Well-known socket file name for this purpose.
    #[must_use]
    pub const fn socket_name(self) -> &'static str {
        match self {
            Self::Listeners => "listen.sock",
            Self::Connections => "conn.sock",
            Self::Stats => "stats.sock",
            Self::ReconfigureAck => "reconfig.sock",
        }
    }
}

impl std::fmt::Display for ChannelPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.socket_name())
    }
}

/// Resolve the socket path for a purpose under a runtime directory.
#[must_use]
pub fn socket_path(runtime_dir: &Path, purpose: ChannelPurpose) -> PathBuf {
    runtime_dir.join(purpose.socket_name())
}

/// The bound (old-instance) end of a domain channel.
///
/// Single-consumer: exactly one peer connects per transfer session. The
/// socket file is removed when the endpoint is dropped.
#[derive(Debug)]
pub struct ChannelEndpoint {
    purpose: ChannelPurpose,
    path: PathBuf,
    listener: UnixListener,
    cleanup_on_drop: bool,
}

impl ChannelEndpoint {
    /// Bind the channel socket, replacing any stale socket file.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::BindFailed`] if the socket cannot be bound.
    pub fn bind(runtime_dir: &Path, purpose: ChannelPurpose) -> ChannelResult<Self> {
        let path = socket_path(runtime_dir, purpose);

        // A stale socket from a crashed predecessor would make bind fail.
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }

        let listener = UnixListener::bind(&path).map_err(|source| ChannelError::BindFailed {
            path: path.display().to_string(),
            source,
        })?;
        debug!(purpose = %purpose, path = %path.display(), "domain channel bound");

        Ok(Self {
            purpose,
            path,
            listener,
            cleanup_on_drop: true,
        })
    }

    /// Keep the socket file on drop.
    ///
    /// Called by the old instance after a completed handoff: the new
    /// instance rebinds the same paths, and unlinking them here would
    /// race with that rebind.
    pub fn disarm_cleanup(&mut self) {
        self.cleanup_on_drop = false;
    }

    /// Accept the single peer for this session.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if accept fails.
    pub async fn accept(&self) -> ChannelResult<FdStream> {
        let (stream, _addr) = self.listener.accept().await?;
        debug!(purpose = %self.purpose, "peer connected to domain channel");
        Ok(FdStream::new(stream))
    }

    /// Accept the single peer, framed for non-descriptor protocols.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if accept fails.
    pub async fn accept_framed(
        &self,
    ) -> ChannelResult<tokio_util::codec::Framed<UnixStream, FrameCodec>> {
        let (stream, _addr) = self.listener.accept().await?;
        debug!(purpose = %self.purpose, "peer connected to domain channel");
        Ok(tokio_util::codec::Framed::new(stream, FrameCodec::new()))
    }

    /// The channel purpose.
    #[must_use]
    pub const fn purpose(&self) -> ChannelPurpose {
        self.purpose
    }

    /// The socket path this endpoint is bound to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ChannelEndpoint {
    fn drop(&mut self) {
        if !self.cleanup_on_drop {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove channel socket");
            }
        }
    }
}

/// Connect to a channel with bounded retries and linear backoff.
///
/// The new instance may start before the old instance has reached its
/// accept loop, so the first few connect attempts are allowed to fail.
///
/// # Errors
///
/// Returns [`ChannelError::ConnectFailed`] once all attempts are spent.
pub async fn connect_with_retry(
    runtime_dir: &Path,
    purpose: ChannelPurpose,
    attempts: u32,
    backoff: Duration,
) -> ChannelResult<FdStream> {
    let path = socket_path(runtime_dir, purpose);
    let mut last_err = None;

    for attempt in 1..=attempts {
        match UnixStream::connect(&path).await {
            Ok(stream) => {
                debug!(purpose = %purpose, attempt, "connected to domain channel");
                return Ok(FdStream::new(stream));
            },
            Err(e) => {
                debug!(purpose = %purpose, attempt, error = %e, "channel connect failed, retrying");
                last_err = Some(e);
                tokio::time::sleep(backoff * attempt).await;
            },
        }
    }

    Err(ChannelError::ConnectFailed {
        path: path.display().to_string(),
        source: last_err
            .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no attempts")),
    })
}

/// Connect to a channel with retry, framed for non-descriptor protocols.
///
/// # Errors
///
/// Returns [`ChannelError::ConnectFailed`] once all attempts are spent.
pub async fn connect_framed_with_retry(
    runtime_dir: &Path,
    purpose: ChannelPurpose,
    attempts: u32,
    backoff: Duration,
) -> ChannelResult<tokio_util::codec::Framed<UnixStream, FrameCodec>> {
    let path = socket_path(runtime_dir, purpose);
    let mut last_err = None;

    for attempt in 1..=attempts {
        match UnixStream::connect(&path).await {
            Ok(stream) => {
                debug!(purpose = %purpose, attempt, "connected to domain channel");
                return Ok(tokio_util::codec::Framed::new(stream, FrameCodec::new()));
            },
            Err(e) => {
                debug!(purpose = %purpose, attempt, error = %e, "channel connect failed, retrying");
                last_err = Some(e);
                tokio::time::sleep(backoff * attempt).await;
            },
        }
    }

    Err(ChannelError::ConnectFailed {
        path: path.display().to_string(),
        source: last_err
            .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no attempts")),
    })
}

impl FdStream {
    /// Send a typed control message, optionally with a descriptor.
    ///
    /// # Errors
    ///
    /// Returns a serialization or transport error.
    pub async fn send_msg<T: Serialize>(
        &mut self,
        msg: &T,
        fd: Option<BorrowedFd<'_>>,
    ) -> ChannelResult<()> {
        let payload = serde_json::to_vec(msg)?;
        self.send(&payload, fd).await
    }

    /// Receive a typed control message that never carries a descriptor.
    ///
    /// # Errors
    ///
    /// Returns a deserialization or transport error.
    pub async fn recv_msg<T: DeserializeOwned>(&mut self) -> ChannelResult<T> {
        let frame = self.recv().await?;
        Ok(serde_json::from_slice(&frame)?)
    }

    /// Receive a typed control message together with its descriptor.
    ///
    /// # Errors
    ///
    /// Returns a deserialization or transport error.
    pub async fn recv_msg_with_fd<T: DeserializeOwned>(
        &mut self,
    ) -> ChannelResult<(T, Option<OwnedFd>)> {
        let (frame, fd) = self.recv_with_fd().await?;
        Ok((serde_json::from_slice(&frame)?, fd))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_socket_paths_are_distinct() {
        let dir = Path::new("/run/molt");
        let paths: Vec<_> = ChannelPurpose::ALL
            .iter()
            .map(|p| socket_path(dir, *p))
            .collect();
        for (i, a) in paths.iter().enumerate() {
            for b in &paths[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[tokio::test]
    async fn test_bind_accept_connect() {
        let tmp = TempDir::new().unwrap();
        let endpoint = ChannelEndpoint::bind(tmp.path(), ChannelPurpose::Stats).unwrap();
        assert!(endpoint.path().exists());

        let dir = tmp.path().to_path_buf();
        let client = tokio::spawn(async move {
            connect_with_retry(
                &dir,
                ChannelPurpose::Stats,
                3,
                Duration::from_millis(10),
            )
            .await
            .unwrap()
        });

        let mut server_side = endpoint.accept().await.unwrap();
        let mut client_side = client.await.unwrap();

        client_side.send(b"ping", None).await.unwrap();
        assert_eq!(&server_side.recv().await.unwrap()[..], b"ping");
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let tmp = TempDir::new().unwrap();
        let first = ChannelEndpoint::bind(tmp.path(), ChannelPurpose::Listeners).unwrap();
        let path = first.path().to_path_buf();
        // Simulate a crash: leak the bound socket file.
        std::mem::forget(first);
        assert!(path.exists());

        let second = ChannelEndpoint::bind(tmp.path(), ChannelPurpose::Listeners).unwrap();
        assert!(second.path().exists());
    }

    #[tokio::test]
    async fn test_connect_retry_exhaustion() {
        let tmp = TempDir::new().unwrap();
        let err = connect_with_retry(
            tmp.path(),
            ChannelPurpose::Connections,
            2,
            Duration::from_millis(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ChannelError::ConnectFailed { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Ping {
            seq: u32,
            tag: String,
        }

        let (mut tx, mut rx) = FdStream::pair().unwrap();
        tx.send_msg(
            &Ping {
                seq: 7,
                tag: "bolt".into(),
            },
            None,
        )
        .await
        .unwrap();

        let ping: Ping = rx.recv_msg().await.unwrap();
        assert_eq!(ping.seq, 7);
        assert_eq!(ping.tag, "bolt");
    }
}
