//! Descriptor passing over Unix domain sockets.
//!
//! Listener and connection handoff must move live OS descriptors between
//! two processes. This module wraps a Unix stream in [`FdStream`], which
//! sends length-prefixed frames and, optionally, one descriptor per frame
//! as `SCM_RIGHTS` ancillary data attached to the first byte of the frame.
//!
//! # Pairing Invariant
//!
//! The kernel delivers ancillary data with the `recvmsg` call that reads
//! the byte range it was attached to, so descriptors arrive in the same
//! order as the frames that carried them. [`FdStream::recv_with_fd`] pops
//! at most one queued descriptor per frame; the transfer protocols send at
//! most one descriptor per message, so pairing is unambiguous as long as
//! every descriptor-carrying message is read with `recv_with_fd`.
//!
//! # Ownership
//!
//! A sent descriptor is duplicated into the receiving process by the
//! kernel; the sender still holds its own handle afterwards and must close
//! it once the receiver acknowledges. Received descriptors are wrapped in
//! [`OwnedFd`] immediately (with `MSG_CMSG_CLOEXEC` set) so they cannot
//! leak into further child processes.

use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use bytes::{Buf, Bytes, BytesMut};
use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr, recvmsg, sendmsg,
};
use tokio::io::Interest;
use tokio::net::UnixStream;

use super::error::{ChannelError, ChannelResult};
use super::framing::{MAX_FRAME_SIZE, encode_frame};

/// Read chunk size for the receive path.
const RECV_CHUNK: usize = 64 * 1024;

/// Maximum descriptors accepted in one `recvmsg` call.
const MAX_FDS_PER_RECV: usize = 8;

/// A framed Unix stream that can carry one descriptor per frame.
#[derive(Debug)]
pub struct FdStream {
    inner: UnixStream,
    read_buf: BytesMut,
    pending_fds: VecDeque<OwnedFd>,
}

impl FdStream {
    /// Wrap a connected Unix stream.
    #[must_use]
    pub fn new(inner: UnixStream) -> Self {
        Self {
            inner,
            read_buf: BytesMut::with_capacity(RECV_CHUNK),
            pending_fds: VecDeque::new(),
        }
    }

    /// Create a connected pair, for tests and in-process wiring.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::new(a), Self::new(b)))
    }

    /// Send one frame, attaching `fd` as ancillary data if present.
    ///
    /// The descriptor rides on the first `sendmsg` of the frame. The
    /// caller keeps ownership of `fd`; the kernel installs a duplicate in
    /// the receiving process.
    pub async fn send(&mut self, payload: &[u8], fd: Option<BorrowedFd<'_>>) -> ChannelResult<()> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(ChannelError::frame_too_large(payload.len(), MAX_FRAME_SIZE));
        }

        let frame = encode_frame(payload);
        let raw: Option<[RawFd; 1]> = fd.map(|f| [f.as_raw_fd()]);
        let mut sent = 0;

        while sent < frame.len() {
            self.inner.writable().await?;

            let attach = sent == 0;
            let result = self.inner.try_io(Interest::WRITABLE, || {
                let iov = [IoSlice::new(&frame[sent..])];
                let cmsgs: Vec<ControlMessage<'_>> = match &raw {
                    Some(fds) if attach => vec![ControlMessage::ScmRights(fds)],
                    _ => Vec::new(),
                };
                sendmsg::<UnixAddr>(
                    self.inner.as_raw_fd(),
                    &iov,
                    &cmsgs,
                    MsgFlags::empty(),
                    None,
                )
                .map_err(io::Error::from)
            });

            match result {
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {},
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// Receive the next frame, discarding any queued descriptor pairing.
    ///
    /// Use for messages that never carry a descriptor (requests, acks).
    pub async fn recv(&mut self) -> ChannelResult<Bytes> {
        let (frame, _fd) = self.recv_inner(false).await?;
        Ok(frame)
    }

    /// Receive the next frame together with the descriptor it carried.
    pub async fn recv_with_fd(&mut self) -> ChannelResult<(Bytes, Option<OwnedFd>)> {
        self.recv_inner(true).await
    }

    async fn recv_inner(&mut self, take_fd: bool) -> ChannelResult<(Bytes, Option<OwnedFd>)> {
        loop {
            if let Some(frame) = self.extract_frame()? {
                let fd = if take_fd {
                    self.pending_fds.pop_front()
                } else {
                    None
                };
                return Ok((frame, fd));
            }
            self.fill().await?;
        }
    }

    /// Pop a complete frame off the read buffer, if one is present.
    fn extract_frame(&mut self) -> ChannelResult<Option<Bytes>> {
        if self.read_buf.len() < 4 {
            return Ok(None);
        }
        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&self.read_buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(ChannelError::frame_too_large(length, MAX_FRAME_SIZE));
        }
        if self.read_buf.len() < 4 + length {
            return Ok(None);
        }

        self.read_buf.advance(4);
        Ok(Some(self.read_buf.split_to(length).freeze()))
    }

    /// Read once from the socket, collecting bytes and any descriptors.
    async fn fill(&mut self) -> ChannelResult<()> {
        loop {
            self.inner.readable().await?;

            let mut scratch = [0u8; RECV_CHUNK];
            let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS_PER_RECV]);

            let result = self.inner.try_io(Interest::READABLE, || {
                let mut iov = [IoSliceMut::new(&mut scratch)];
                let msg = recvmsg::<UnixAddr>(
                    self.inner.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_buf),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                )
                .map_err(io::Error::from)?;

                let mut fds = Vec::new();
                for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                    if let ControlMessageOwned::ScmRights(received) = cmsg {
                        fds.extend(received);
                    }
                }
                Ok((msg.bytes, fds))
            });

            match result {
                Ok((0, fds)) if fds.is_empty() => return Err(ChannelError::Closed),
                Ok((n, fds)) => {
                    self.read_buf.extend_from_slice(&scratch[..n]);
                    for fd in fds {
                        // SAFETY: the kernel just installed this descriptor
                        // in our process via SCM_RIGHTS; we are its sole
                        // owner from this point on.
                        self.pending_fds.push_back(unsafe { OwnedFd::from_raw_fd(fd) });
                    }
                    return Ok(());
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {},
                Err(e) => return Err(e.into()),
            }
        }
    }
}
