//! A cross-thread handle publishing which backend servers are currently
//! running, read by per-worker pools that cannot themselves see a
//! cluster monitor's status bits (a worker's pool is `Rc`-owned by its
//! single-threaded event loop, so it can't hold an `Arc` whose writer
//! lives on another thread's runtime).
//!
//! Mirrors the runtime's load-sampling handle: one side writes a full
//! snapshot, the other reads it without blocking the writer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Shared, cloneable view of server running-state. Servers absent from
/// the board are assumed running, so statically configured deployments
/// with no cluster monitor behave exactly as before this board existed.
#[derive(Clone, Default)]
pub struct ServerStatusBoard {
    running: Arc<RwLock<HashMap<String, bool>>>,
}

impl ServerStatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole board with a fresh snapshot.
    pub fn publish<I: IntoIterator<Item = (String, bool)>>(&self, statuses: I) {
        let mut map = self.running.write().expect("server status board lock poisoned");
        map.clear();
        map.extend(statuses);
    }

    /// Whether `server` is currently running. Unknown servers default
    /// to running.
    pub fn is_running(&self, server: &str) -> bool {
        self.running
            .read()
            .expect("server status board lock poisoned")
            .get(server)
            .copied()
            .unwrap_or(true)
    }

    /// Every server the board currently has an opinion on.
    pub fn snapshot(&self) -> Vec<(String, bool)> {
        self.running
            .read()
            .expect("server status board lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_server_defaults_to_running() {
        let board = ServerStatusBoard::new();
        assert!(board.is_running("db1"));
    }

    #[test]
    fn publish_overwrites_prior_snapshot() {
        let board = ServerStatusBoard::new();
        board.publish([("db1".to_string(), false)]);
        assert!(!board.is_running("db1"));
        board.publish([("db2".to_string(), true)]);
        assert!(board.is_running("db2"));
        assert!(board.is_running("db1"));
    }

    #[test]
    fn clone_shares_the_same_board() {
        let board = ServerStatusBoard::new();
        let handle = board.clone();
        handle.publish([("db1".to_string(), false)]);
        assert!(!board.is_running("db1"));
    }
}
