//! Error taxonomy for the backend protocol state machine.

use thiserror::Error;

/// Result alias for protocol operations.
pub type ProtoResult<T> = Result<T, ProtoError>;

/// Broad retriability class for a failure, consulted by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Lost connection, bad handshake, SSL setup failure: another
    /// endpoint may succeed.
    Transient,
    /// Auth or init-query failure: this session cannot use this backend.
    Permanent,
    /// ER_HOST_IS_BLOCKED: the server itself should be placed in
    /// Maintenance until an admin intervenes.
    HostBlocked,
}

/// Errors raised while driving a backend connection's protocol state
/// machine. Variants carry enough context to build the client-visible
/// ERR packet described in the error-handling design.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("malformed packet: {0}")]
    BadPacket(String),

    #[error("authentication failed: {code} {sqlstate} {message}")]
    AuthFailed {
        code: u16,
        sqlstate: String,
        message: String,
    },

    #[error("init query {index} failed: {code} {message}")]
    InitQueryFailed {
        index: usize,
        code: u16,
        message: String,
    },

    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("host blocked by backend: {0}")]
    HostBlocked(String),

    #[error("connection not established: {0}")]
    Unavailable(String),
}

impl ProtoError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProtoError::AuthFailed { .. } | ProtoError::InitQueryFailed { .. } => {
                ErrorClass::Permanent
            }
            ProtoError::HostBlocked(_) => ErrorClass::HostBlocked,
            ProtoError::BadPacket(_) | ProtoError::Transient(_) | ProtoError::Unavailable(_) => {
                ErrorClass::Transient
            }
        }
    }
}

impl From<relaymesh_wire::WireError> for ProtoError {
    fn from(e: relaymesh_wire::WireError) -> Self {
        ProtoError::BadPacket(e.to_string())
    }
}
