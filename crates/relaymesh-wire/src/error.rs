//! Error types for wire-level packet framing and decoding.

use thiserror::Error;

/// Result type alias for wire-layer operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors that can occur while framing or decoding MySQL packets.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("packet truncated: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },

    #[error("invalid length-encoded integer prefix byte: {0:#x}")]
    InvalidLenEncPrefix(u8),

    #[error("string is not NUL-terminated within the payload")]
    UnterminatedString,

    #[error("payload too short for a sane header: {0} bytes")]
    ShortPayload(usize),
}
