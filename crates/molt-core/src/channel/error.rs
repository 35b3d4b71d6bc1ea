//! Error types for the domain channel transport layer.

use std::io;

use thiserror::Error;

/// Errors from domain channel transport operations.
///
/// Variants distinguish transient connection failures (where a retry may
/// succeed) from protocol violations (where the channel must be torn down).
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Frame exceeds the maximum allowed size.
    ///
    /// Detected before allocation on the receive path.
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Frame size from the length prefix.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The peer closed the channel before the operation completed.
    #[error("channel closed by peer")]
    Closed,

    /// Could not connect to the channel endpoint after all retries.
    #[error("failed to connect to {path}: {source}")]
    ConnectFailed {
        /// Channel socket path.
        path: String,
        /// Last connect error.
        #[source]
        source: io::Error,
    },

    /// Could not bind the channel endpoint.
    #[error("failed to bind {path}: {source}")]
    BindFailed {
        /// Channel socket path.
        path: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Channel operation exceeded its deadline.
    #[error("channel operation timed out after {duration_ms} ms")]
    Timeout {
        /// Elapsed bound in milliseconds.
        duration_ms: u64,
    },

    /// Message payload could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying transport I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ChannelError {
    /// Create a frame too large error.
    #[must_use]
    pub const fn frame_too_large(size: usize, max: usize) -> Self {
        Self::FrameTooLarge { size, max }
    }

    /// Create a timeout error from a duration.
    #[must_use]
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout {
            duration_ms: duration.as_millis().try_into().unwrap_or(u64::MAX),
        }
    }

    /// Returns `true` if retrying the operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectFailed { .. } | Self::Timeout { .. })
    }
}

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;
