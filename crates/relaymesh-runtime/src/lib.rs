//! Per-worker event loop: session lifecycle, the shared-listener accept
//! race, and cross-worker rebalancing, per §4.4/§5.

mod error;
mod rebalance;
mod session;
mod tls;
mod worker;

pub use error::{RuntimeError, RuntimeResult};
pub use rebalance::{RebalanceCommand, RebalanceCoordinator};
pub use session::{
    MovingSession, Session, SessionControl, SessionHandle, SessionMeta, SessionOptions,
    SessionOutcome, StashedStream,
};
pub use worker::{active_session_count, spawn_worker_thread, RoutingWorker, WorkerOptions};
