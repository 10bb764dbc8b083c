//! Error taxonomy for pool operations.

use thiserror::Error;

pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("reuse handshake failed: {0}")]
    Reuse(#[from] relaymesh_proto::ProtoError),
}
