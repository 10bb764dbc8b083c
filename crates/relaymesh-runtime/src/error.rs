//! Error taxonomy for the worker runtime.

use thiserror::Error;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("client protocol error: {0}")]
    Wire(#[from] relaymesh_wire::WireError),

    #[error("backend protocol error: {0}")]
    Proto(#[from] relaymesh_proto::ProtoError),

    #[error("no healthy backend available for this query")]
    NoTarget,

    #[error("session {0} not found on this worker")]
    UnknownSession(u64),

    #[error("worker channel closed")]
    ChannelClosed,
}
