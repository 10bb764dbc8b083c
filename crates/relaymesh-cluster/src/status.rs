//! The backing `Server` object each cluster node maps to, and its
//! status bitmask. Distinct from the MySQL wire protocol's own
//! `SERVER_STATUS_*` flags in `relaymesh-proto` — these bits describe
//! the server *object* the router sees, not one packet's status field.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub const SERVER_RUNNING: u32 = 0x0000_0001;
pub const SERVER_MASTER: u32 = 0x0000_0002;
pub const SERVER_SLAVE: u32 = 0x0000_0004;
pub const SERVER_DRAINING: u32 = 0x0000_0008;
pub const SERVER_DOWN: u32 = 0x0000_0010;

/// Lock-free-readable status bits for one backing server. Monitor and
/// admin threads hold no lock to flip a bit; readers never block.
#[derive(Clone)]
pub struct ServerStatus {
    bits: Arc<AtomicU32>,
}

impl ServerStatus {
    pub fn new(initial: u32) -> Self {
        Self {
            bits: Arc::new(AtomicU32::new(initial)),
        }
    }

    pub fn get(&self) -> u32 {
        self.bits.load(Ordering::Acquire)
    }

    pub fn set_bit(&self, bit: u32, on: bool) {
        if on {
            self.bits.fetch_or(bit, Ordering::AcqRel);
        } else {
            self.bits.fetch_and(!bit, Ordering::AcqRel);
        }
    }

    pub fn is_set(&self, bit: u32) -> bool {
        self.get() & bit != 0
    }
}

/// A server object backing one cluster node, identified by a synthetic
/// unique name `@@<monitor>:node-<id>` for dynamically discovered
/// nodes, or the configured name for bootstrap ones.
#[derive(Clone)]
pub struct Server {
    pub name: String,
    pub address: String,
    pub mysql_port: u16,
    pub health_port: u16,
    pub status: ServerStatus,
}

impl Server {
    pub fn synthetic_name(monitor: &str, node_id: i64) -> String {
        format!("@@{monitor}:node-{node_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_bits_set_and_clear_independently() {
        let status = ServerStatus::new(SERVER_RUNNING);
        assert!(status.is_set(SERVER_RUNNING));
        assert!(!status.is_set(SERVER_MASTER));

        status.set_bit(SERVER_MASTER, true);
        assert!(status.is_set(SERVER_RUNNING));
        assert!(status.is_set(SERVER_MASTER));

        status.set_bit(SERVER_RUNNING, false);
        assert!(!status.is_set(SERVER_RUNNING));
        assert!(status.is_set(SERVER_MASTER));
    }

    #[test]
    fn clone_shares_the_same_underlying_bits() {
        let status = ServerStatus::new(0);
        let handle = status.clone();
        handle.set_bit(SERVER_DRAINING, true);
        assert!(status.is_set(SERVER_DRAINING));
    }

    #[test]
    fn synthetic_name_format() {
        assert_eq!(Server::synthetic_name("cluster1", 42), "@@cluster1:node-42");
    }
}
