//! The router contract between the runtime and pluggable routing
//! policy, plus a default round-robin implementation of it.

mod contract;
mod round_robin;

pub use contract::{
    Endpoint, QueryContext, RetryDecision, Router, RouterFactory, SessionState, TargetSelection,
    TrxState, REQUIRES_CONTIGUOUS_OUTPUT, REQUIRES_SESSION_TRACKING, REQUIRES_STATEMENT_TRACKING,
};
pub use round_robin::{RoundRobinRouter, RoundRobinRouterFactory};
