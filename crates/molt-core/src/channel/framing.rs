//! Length-prefixed frame codec for domain channels.
//!
//! # Wire Format
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | Payload          |
//! +----------------------------+------------------+
//! ```
//!
//! - Length prefix: 4-byte big-endian unsigned integer
//! - Payload: JSON-encoded control message
//! - Maximum frame size: 1 MiB
//!
//! The frame length is validated BEFORE any payload allocation so a
//! corrupt or hostile peer cannot force a large allocation.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::ChannelError;

/// Maximum frame size in bytes (1 MiB).
///
/// Control-plane messages are small; a connection record's buffered bytes
/// are bounded by the proxy's per-connection read buffer, well under this.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length prefix size in bytes.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Length-prefixed frame codec.
///
/// Implements [`Decoder`] and [`Encoder`] for use with
/// `tokio_util::codec::Framed`.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec with the default frame size limit.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a custom frame size limit (used in tests).
    #[must_use]
    pub const fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ChannelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; LENGTH_PREFIX_SIZE];
        length_bytes.copy_from_slice(&src[..LENGTH_PREFIX_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > self.max_frame_size {
            return Err(ChannelError::frame_too_large(length, self.max_frame_size));
        }

        if src.len() < LENGTH_PREFIX_SIZE + length {
            // Reserve for the rest of the frame to avoid repeated growth.
            src.reserve(LENGTH_PREFIX_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ChannelError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_size {
            return Err(ChannelError::frame_too_large(
                item.len(),
                self.max_frame_size,
            ));
        }

        dst.reserve(LENGTH_PREFIX_SIZE + item.len());
        #[allow(clippy::cast_possible_truncation)] // bounded by max_frame_size
        dst.put_u32(item.len() as u32);
        dst.put_slice(&item);
        Ok(())
    }
}

/// Encode a frame into a standalone buffer.
///
/// Used by the descriptor-passing transport, which frames messages itself
/// instead of going through `Framed`.
#[must_use]
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    #[allow(clippy::cast_possible_truncation)] // callers validate against MAX_FRAME_SIZE
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}
