//! The router contract external routing policies implement, per §4.6.

use relaymesh_proto::{ErrorClass, ReplyMeta};

/// A single backend a session could be routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub server: String,
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn dial_target(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// The result of `choose_target`: route to one backend, or fan out a
/// query to several (e.g. a read/write-split router sending the same
/// read to multiple replicas for comparison).
#[derive(Debug, Clone)]
pub enum TargetSelection {
    Single(Endpoint),
    Multi(Vec<Endpoint>),
}

/// The session's current transaction state, consulted by routers that
/// must pin a session to one backend for the duration of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrxState {
    Inactive,
    Active,
    ActiveReadOnly,
}

/// Session-scoped state a router may consult when choosing a target.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub trx_state: TrxState,
    pub autocommit: bool,
}

/// The query being routed, as much as the runtime decodes before
/// handing off to the router.
#[derive(Debug, Clone, Copy)]
pub struct QueryContext<'a> {
    pub command: u8,
    pub query: Option<&'a str>,
}

/// What a router wants done after a backend-level error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Fail,
}

/// Capability bits a router declares so the runtime knows what to
/// negotiate and track on its behalf.
pub const REQUIRES_SESSION_TRACKING: u32 = 0x0000_0001;
pub const REQUIRES_CONTIGUOUS_OUTPUT: u32 = 0x0000_0002;
pub const REQUIRES_STATEMENT_TRACKING: u32 = 0x0000_0004;

/// A per-session routing policy. The runtime guarantees every method on
/// one session's router instance is invoked serially, on that session's
/// owning worker.
pub trait Router: Send {
    fn choose_target(
        &mut self,
        query: &QueryContext<'_>,
        session: &SessionState,
    ) -> Option<TargetSelection>;

    fn on_reply(&mut self, endpoint: &Endpoint, reply: &ReplyMeta);

    fn on_error(&mut self, endpoint: &Endpoint, error: ErrorClass) -> RetryDecision;

    fn capabilities(&self) -> u32 {
        0
    }
}

/// A factory producing one fresh `Router` per client session, sharing
/// whatever backend/service state the policy needs across sessions.
pub trait RouterFactory: Send + Sync {
    fn new_session_router(&self) -> Box<dyn Router>;
}
