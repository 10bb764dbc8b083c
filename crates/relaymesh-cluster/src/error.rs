//! Error types for hub connectivity and cluster monitoring.

use thiserror::Error;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("I/O error talking to hub: {0}")]
    Io(#[from] std::io::Error),

    #[error("hub connection closed unexpectedly")]
    ConnectionClosed,

    #[error("protocol error talking to hub: {0}")]
    Protocol(#[from] relaymesh_proto::ProtoError),

    #[error("wire error talking to hub: {0}")]
    Wire(#[from] relaymesh_wire::WireError),

    #[error("hub authentication failed: {0}")]
    AuthFailed(String),

    #[error("hub query failed: {0}")]
    QueryFailed(String),

    #[error("malformed hub response: {0}")]
    BadResponse(String),

    #[error("no reachable hub node")]
    NoHub,

    #[error("node registry error: {0}")]
    State(#[from] relaymesh_state::StateError),
}
