//! Error types for the IRC protocol library.

use thiserror::Error;

/// Convenience type alias for Results using [`ProtocolError`].
pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;

/// Protocol-level errors: transport failures, framing and parse problems.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line of {len} bytes exceeds maximum of {max}")]
    LineTooLong { len: usize, max: usize },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("illegal control character: {0:?}")]
    IllegalControlChar(char),
}

impl ProtocolError {
    /// True when the connection can survive this error (a bad line can be
    /// skipped; an I/O error cannot).
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}
