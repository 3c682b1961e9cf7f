//! Protocol error types.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while encoding or decoding frames.
///
/// Any of these on a connection is terminal for that peer: the caller
/// drops the connection, never the session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame header announced a payload larger than the 1 MiB cap.
    #[error("frame payload of {len} bytes exceeds the 1 MiB limit")]
    FrameTooLarge { len: usize },

    /// Underlying stream failure, including end-of-stream mid-frame and
    /// socket receive timeouts.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True when the error is a clean end-of-stream (peer closed between
    /// frames or mid-frame).
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof
        )
    }
}
