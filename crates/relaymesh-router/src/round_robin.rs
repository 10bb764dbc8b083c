//! The default `RoundRobinRouter`: round-robins across a service's
//! healthy backends, grounded in the teacher's service-backend router.
//! Not a smart, read/write-split, or fingerprinting router — those are
//! external collaborators against the same contract.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use relaymesh_proto::{ErrorClass, ReplyMeta};
use tracing::debug;

use crate::contract::{Endpoint, QueryContext, Router, RouterFactory, SessionState, TargetSelection};
use crate::contract::RetryDecision;

struct BackendEntry {
    endpoint: Endpoint,
    healthy: bool,
}

struct Shared {
    backends: RwLock<Vec<BackendEntry>>,
    counter: AtomicUsize,
}

/// Shared, updatable backend list behind a round-robin counter; each
/// session gets its own lightweight `RoundRobinRouter` handle onto it.
pub struct RoundRobinRouterFactory {
    shared: Arc<Shared>,
}

impl RoundRobinRouterFactory {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        let backends = endpoints
            .into_iter()
            .map(|endpoint| BackendEntry {
                endpoint,
                healthy: true,
            })
            .collect();
        Self {
            shared: Arc::new(Shared {
                backends: RwLock::new(backends),
                counter: AtomicUsize::new(0),
            }),
        }
    }

    pub fn update_backends(&self, endpoints: Vec<Endpoint>) {
        let mut backends = self.shared.backends.write().expect("backends lock");
        *backends = endpoints
            .into_iter()
            .map(|endpoint| BackendEntry {
                endpoint,
                healthy: true,
            })
            .collect();
        debug!(count = backends.len(), "round-robin router backend list updated");
    }

    pub fn set_healthy(&self, server: &str, healthy: bool) {
        let mut backends = self.shared.backends.write().expect("backends lock");
        for entry in backends.iter_mut() {
            if entry.endpoint.server == server {
                entry.healthy = healthy;
            }
        }
    }
}

impl RouterFactory for RoundRobinRouterFactory {
    fn new_session_router(&self) -> Box<dyn Router> {
        Box::new(RoundRobinRouter {
            shared: self.shared.clone(),
        })
    }
}

/// One session's handle onto the shared round-robin backend list.
pub struct RoundRobinRouter {
    shared: Arc<Shared>,
}

impl Router for RoundRobinRouter {
    fn choose_target(
        &mut self,
        _query: &QueryContext<'_>,
        _session: &SessionState,
    ) -> Option<TargetSelection> {
        let backends = self.shared.backends.read().expect("backends lock");
        let healthy: Vec<&BackendEntry> = backends.iter().filter(|b| b.healthy).collect();
        if healthy.is_empty() {
            return None;
        }
        let idx = self.shared.counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(TargetSelection::Single(healthy[idx].endpoint.clone()))
    }

    fn on_reply(&mut self, _endpoint: &Endpoint, _reply: &ReplyMeta) {}

    fn on_error(&mut self, endpoint: &Endpoint, error: ErrorClass) -> RetryDecision {
        match error {
            ErrorClass::Transient => RetryDecision::Retry,
            ErrorClass::Permanent => RetryDecision::Fail,
            ErrorClass::HostBlocked => {
                let mut backends = self.shared.backends.write().expect("backends lock");
                for entry in backends.iter_mut() {
                    if entry.endpoint.server == endpoint.server {
                        entry.healthy = false;
                    }
                }
                debug!(server = %endpoint.server, "marked backend unhealthy after host-blocked error");
                RetryDecision::Retry
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(server: &str, port: u16) -> Endpoint {
        Endpoint {
            server: server.into(),
            address: "10.0.0.1".into(),
            port,
        }
    }

    fn session() -> SessionState {
        SessionState {
            trx_state: crate::contract::TrxState::Inactive,
            autocommit: true,
        }
    }

    #[test]
    fn cycles_round_robin_across_backends() {
        let factory = RoundRobinRouterFactory::new(vec![
            endpoint("n1", 3306),
            endpoint("n2", 3306),
            endpoint("n3", 3306),
        ]);
        let mut router = factory.new_session_router();
        let q = QueryContext {
            command: 3,
            query: Some("SELECT 1"),
        };

        let picks: Vec<_> = (0..4)
            .map(|_| match router.choose_target(&q, &session()).unwrap() {
                TargetSelection::Single(e) => e.server,
                TargetSelection::Multi(_) => unreachable!(),
            })
            .collect();
        assert_eq!(picks, vec!["n1", "n2", "n3", "n1"]);
    }

    #[test]
    fn host_blocked_error_removes_backend_from_rotation() {
        let factory = RoundRobinRouterFactory::new(vec![endpoint("n1", 3306), endpoint("n2", 3306)]);
        let mut router = factory.new_session_router();
        router.on_error(&endpoint("n1", 3306), ErrorClass::HostBlocked);

        let q = QueryContext {
            command: 3,
            query: None,
        };
        for _ in 0..3 {
            match router.choose_target(&q, &session()).unwrap() {
                TargetSelection::Single(e) => assert_eq!(e.server, "n2"),
                TargetSelection::Multi(_) => unreachable!(),
            }
        }
    }

    #[test]
    fn no_backends_returns_none() {
        let factory = RoundRobinRouterFactory::new(vec![]);
        let mut router = factory.new_session_router();
        let q = QueryContext {
            command: 3,
            query: None,
        };
        assert!(router.choose_target(&q, &session()).is_none());
    }

    #[test]
    fn transient_error_allows_retry() {
        let factory = RoundRobinRouterFactory::new(vec![endpoint("n1", 3306)]);
        let mut router = factory.new_session_router();
        assert_eq!(
            router.on_error(&endpoint("n1", 3306), ErrorClass::Transient),
            RetryDecision::Retry
        );
        assert_eq!(
            router.on_error(&endpoint("n1", 3306), ErrorClass::Permanent),
            RetryDecision::Fail
        );
    }
}
