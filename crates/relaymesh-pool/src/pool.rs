//! A per-worker pool of idle, already-authenticated backend connections,
//! kept warm for reuse by a later client session on the same server, per
//! §4.3.
//!
//! Unlike a pool shared across async tasks, a worker's pool is only ever
//! touched by that worker's own single-threaded event loop, so entries
//! live in a plain `VecDeque` rather than behind a `Mutex`.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use relaymesh_proto::{BackendProto, Credentials};
use tracing::{debug, warn};

use crate::error::PoolError;

/// Pooling limits for one backend server.
#[derive(Debug, Clone)]
pub struct PoolLimits {
    /// Maximum number of idle connections kept per server. Zero disables
    /// pooling for that server entirely.
    pub pool_max: usize,
    /// How long an idle connection may sit in the pool before it is
    /// considered stale and evicted.
    pub persist_max_time: Duration,
}

/// One idle, authenticated connection sitting in a pool.
pub struct PooledConn {
    pub conn_id: u64,
    pub proto: BackendProto,
    pub created_at: Instant,
    /// Set by the worker's I/O layer when unsolicited traffic or a
    /// hangup is observed on an otherwise-idle connection.
    pub hung_up: bool,
}

struct ServerPool {
    limits: PoolLimits,
    entries: VecDeque<PooledConn>,
    running: bool,
}

impl ServerPool {
    fn evict_expired(&mut self, now: Instant) -> Vec<PooledConn> {
        let mut evicted = Vec::new();
        let mut keep = VecDeque::with_capacity(self.entries.len());
        while let Some(entry) = self.entries.pop_front() {
            let stale = now.saturating_duration_since(entry.created_at) > self.limits.persist_max_time;
            if entry.hung_up || !self.running || stale {
                evicted.push(entry);
            } else {
                keep.push_back(entry);
            }
        }
        self.entries = keep;
        while self.entries.len() > self.limits.pool_max {
            if let Some(entry) = self.entries.pop_back() {
                evicted.push(entry);
            }
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted expired pool entries");
        }
        evicted
    }
}

/// Pools of idle backend connections, one per server, owned by a single
/// worker.
#[derive(Default)]
pub struct WorkerPool {
    servers: HashMap<String, ServerPool>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            servers: HashMap::new(),
        }
    }

    /// Record whether `server` is currently running; a stopped server
    /// forces eviction of all of its pooled entries on the next sweep.
    pub fn set_server_running(&mut self, server: &str, running: bool) {
        if let Some(pool) = self.servers.get_mut(server) {
            pool.running = running;
        }
    }

    /// Pop a reusable connection for `target_server`, handing it
    /// `credentials` via `COM_CHANGE_USER` if the identity differs from
    /// whichever client last used it. Runs an expiry sweep first.
    pub fn take(
        &mut self,
        target_server: &str,
        now: Instant,
        credentials: Credentials,
    ) -> Option<PooledConn> {
        let pool = self.servers.get_mut(target_server)?;
        pool.evict_expired(now);

        while let Some(mut entry) = pool.entries.pop_front() {
            if entry.hung_up || !entry.proto.established() {
                debug!(conn_id = entry.conn_id, "discarding dead pool entry on take");
                continue;
            }
            match entry.proto.reuse(credentials.clone()) {
                Ok(_) => {
                    debug!(conn_id = entry.conn_id, target_server, "reused pooled connection");
                    return Some(entry);
                }
                Err(e) => {
                    let err = PoolError::from(e);
                    warn!(conn_id = entry.conn_id, error = %err, "pool reuse failed, closing entry");
                    continue;
                }
            }
        }
        None
    }

    /// Offer an idle, established connection back to the pool. Returns
    /// the connection back to the caller (who must close it) if it was
    /// rejected; `None` means it was accepted into the pool.
    pub fn offer(
        &mut self,
        target_server: &str,
        limits: &PoolLimits,
        server_running: bool,
        conn: PooledConn,
    ) -> Option<PooledConn> {
        if limits.pool_max == 0 || !server_running || conn.hung_up || !conn.proto.established() {
            return Some(conn);
        }
        let pool = self.servers.entry(target_server.to_string()).or_insert_with(|| ServerPool {
            limits: limits.clone(),
            entries: VecDeque::new(),
            running: server_running,
        });
        pool.limits = limits.clone();
        pool.running = server_running;
        if pool.entries.len() >= limits.pool_max {
            return Some(conn);
        }
        debug!(conn_id = conn.conn_id, target_server, "offered connection to pool");
        pool.entries.push_back(conn);
        None
    }

    /// Remove and return one specific entry, e.g. because its trivial
    /// idle handler observed I/O activity.
    pub fn evict(&mut self, target_server: &str, conn_id: u64) -> Option<PooledConn> {
        let pool = self.servers.get_mut(target_server)?;
        let idx = pool.entries.iter().position(|e| e.conn_id == conn_id)?;
        pool.entries.remove(idx)
    }

    /// Sweep every server's pool for expired entries.
    pub fn evict_expired_all(&mut self, now: Instant) -> Vec<PooledConn> {
        let mut out = Vec::new();
        for pool in self.servers.values_mut() {
            out.extend(pool.evict_expired(now));
        }
        out
    }

    /// Number of live entries pooled for `target_server`. A pooled
    /// connection never counts toward the worker's active-session count.
    pub fn live_count(&self, target_server: &str) -> usize {
        self.servers
            .get(target_server)
            .map(|p| p.entries.len())
            .unwrap_or(0)
    }

    /// Conn ids currently live for `target_server`. Lets a caller that
    /// tracks out-of-band resources by conn id (e.g. the runtime's
    /// socket-by-id table) reconcile after `take` or an eviction sweep
    /// silently discards entries it couldn't reuse.
    pub fn conn_ids(&self, target_server: &str) -> Vec<u64> {
        self.servers
            .get(target_server)
            .map(|p| p.entries.iter().map(|e| e.conn_id).collect())
            .unwrap_or_default()
    }

    /// Unconditionally drain every server's pool, regardless of
    /// `persist_max_time` or `running`. Used during worker shutdown,
    /// where every pooled entry must go.
    pub fn evict_all(&mut self) -> Vec<PooledConn> {
        let mut out = Vec::new();
        for pool in self.servers.values_mut() {
            out.extend(pool.entries.drain(..));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaymesh_proto::{ConnectionOptions, ProtoState};

    fn credentials() -> Credentials {
        Credentials {
            username: "app".into(),
            password_sha1: relaymesh_proto::password_sha1(b"hunter2"),
            database: Some("mydb".into()),
            charset: 45,
        }
    }

    fn options() -> ConnectionOptions {
        ConnectionOptions {
            credentials: credentials(),
            want_ssl: false,
            want_session_track: false,
            client_capabilities: 0,
            init_queries: Vec::new(),
            proxy_header: None,
        }
    }

    fn fresh_entry(conn_id: u64) -> PooledConn {
        PooledConn {
            conn_id,
            proto: BackendProto::new(options()),
            created_at: Instant::now(),
            hung_up: false,
        }
    }

    fn limits() -> PoolLimits {
        PoolLimits {
            pool_max: 2,
            persist_max_time: Duration::from_secs(60),
        }
    }

    #[test]
    fn offer_rejects_when_not_established() {
        let mut wp = WorkerPool::new();
        let conn = fresh_entry(1);
        assert_eq!(conn.proto.state(), ProtoState::Handshaking);
        let rejected = wp.offer("db1", &limits(), true, conn);
        assert!(rejected.is_some());
        assert_eq!(wp.live_count("db1"), 0);
    }

    #[test]
    fn offer_rejects_when_pool_max_is_zero() {
        let mut wp = WorkerPool::new();
        let conn = fresh_entry(1);
        let zero_limits = PoolLimits {
            pool_max: 0,
            persist_max_time: Duration::from_secs(60),
        };
        let rejected = wp.offer("db1", &zero_limits, true, conn);
        assert!(rejected.is_some());
    }

    #[test]
    fn evict_expired_all_drops_hung_up_entries() {
        let mut wp = WorkerPool::new();
        wp.servers.insert(
            "db1".into(),
            ServerPool {
                limits: limits(),
                entries: VecDeque::new(),
                running: true,
            },
        );
        let mut entry = fresh_entry(1);
        entry.hung_up = true;
        wp.servers.get_mut("db1").unwrap().entries.push_back(entry);

        let evicted = wp.evict_expired_all(Instant::now());
        assert_eq!(evicted.len(), 1);
        assert_eq!(wp.live_count("db1"), 0);
    }

    #[test]
    fn evict_expired_enforces_pool_max() {
        let mut wp = WorkerPool::new();
        wp.servers.insert(
            "db1".into(),
            ServerPool {
                limits: limits(),
                entries: VecDeque::new(),
                running: true,
            },
        );
        for id in 0..5 {
            wp.servers
                .get_mut("db1")
                .unwrap()
                .entries
                .push_back(fresh_entry(id));
        }
        let evicted = wp.evict_expired_all(Instant::now());
        assert_eq!(evicted.len(), 3);
        assert_eq!(wp.live_count("db1"), 2);
    }

    #[test]
    fn evict_removes_specific_entry() {
        let mut wp = WorkerPool::new();
        wp.servers.insert(
            "db1".into(),
            ServerPool {
                limits: limits(),
                entries: VecDeque::new(),
                running: true,
            },
        );
        wp.servers.get_mut("db1").unwrap().entries.push_back(fresh_entry(7));
        let evicted = wp.evict("db1", 7);
        assert!(evicted.is_some());
        assert_eq!(wp.live_count("db1"), 0);
    }

    #[test]
    fn take_on_unknown_server_returns_none() {
        let mut wp = WorkerPool::new();
        assert!(wp.take("db1", Instant::now(), credentials()).is_none());
    }

    #[test]
    fn evict_all_drains_regardless_of_persist_time() {
        let mut wp = WorkerPool::new();
        let long_lived = PoolLimits {
            pool_max: 10,
            persist_max_time: Duration::from_secs(3600),
        };
        wp.servers.insert(
            "db1".into(),
            ServerPool {
                limits: long_lived,
                entries: VecDeque::new(),
                running: true,
            },
        );
        wp.servers.get_mut("db1").unwrap().entries.push_back(fresh_entry(1));
        wp.servers.get_mut("db1").unwrap().entries.push_back(fresh_entry(2));
        let drained = wp.evict_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(wp.live_count("db1"), 0);
    }

    #[test]
    fn conn_ids_reflects_current_entries() {
        let mut wp = WorkerPool::new();
        wp.servers.insert(
            "db1".into(),
            ServerPool {
                limits: limits(),
                entries: VecDeque::new(),
                running: true,
            },
        );
        wp.servers.get_mut("db1").unwrap().entries.push_back(fresh_entry(3));
        wp.servers.get_mut("db1").unwrap().entries.push_back(fresh_entry(4));
        let mut ids = wp.conn_ids("db1");
        ids.sort();
        assert_eq!(ids, vec![3, 4]);
        assert!(wp.conn_ids("unknown").is_empty());
    }
}
