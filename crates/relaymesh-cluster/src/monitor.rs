//! ClusterMonitor: the single thread that keeps one cluster's node set
//! current, pings node health endpoints, flushes server-status bits,
//! and persists what it learned.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use relaymesh_state::{BootstrapNode, DynamicNode, NodeStore};

use crate::error::{ClusterError, ClusterResult};
use crate::health::{http_probe, NodeHealth, ProbeResult};
use crate::hub::HubClient;
use crate::status::{Server, ServerStatus, SERVER_DOWN, SERVER_DRAINING, SERVER_MASTER, SERVER_RUNNING};

const MEMBERSHIP_QUERY: &str = "SELECT nid, status, instance, substate FROM system.membership";
const NODE_INFO_QUERY: &str = "SELECT ni.nodeid, ni.iface_ip, ni.mysql_port, ni.healthmon_port, sn.nodeid \
     FROM system.nodeinfo ni LEFT JOIN system.softfailed_nodes sn ON ni.nodeid=sn.nodeid";
const QUORUM_QUERY: &str = "SELECT is_part_of_quorum()";

/// Credentials the monitor uses to authenticate to the hub.
#[derive(Debug, Clone)]
pub struct HubCredentials {
    pub username: String,
    pub password_sha1: [u8; 20],
}

/// Static configuration for one cluster monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub monitor_name: String,
    pub bootstrap_nodes: Vec<BootstrapNode>,
    pub credentials: HubCredentials,
    pub health_check_threshold: u32,
    pub health_probe_timeout: Duration,
    pub cluster_monitor_interval: Duration,
}

struct MembershipRow {
    node_id: i64,
    status: String,
    substate: String,
}

struct NodeInfoRow {
    node_id: i64,
    ip: String,
    mysql_port: u16,
    health_port: u16,
    soft_failed: bool,
}

/// Tracks one node's in-memory liveness and backing server object,
/// alongside the persisted record.
struct TrackedNode {
    server: Server,
    health: NodeHealth,
}

/// Runs as a single thread (not a routing worker). Owns the local
/// persisted-node KV file exclusively.
pub struct ClusterMonitor {
    config: MonitorConfig,
    store: NodeStore,
    nodes: HashMap<i64, TrackedNode>,
    needs_membership_recheck: bool,
}

impl ClusterMonitor {
    /// Open the registry, reconcile the configured bootstrap set
    /// against what was persisted, and build the initial in-memory
    /// node map from whatever survives.
    pub fn open(config: MonitorConfig, store: NodeStore) -> ClusterResult<Self> {
        let persisted_bootstrap = store.list_bootstrap_nodes()?;
        if !same_bootstrap_set(&persisted_bootstrap, &config.bootstrap_nodes) {
            info!(monitor = %config.monitor_name, "bootstrap set changed, wiping persisted cluster state");
            store.wipe_all()?;
            store.replace_bootstrap_nodes(&config.bootstrap_nodes)?;
        }

        let mut nodes = HashMap::new();
        for dyn_node in store.list_dynamic_nodes()? {
            let server = Server {
                name: Server::synthetic_name(&config.monitor_name, dyn_node.id),
                address: dyn_node.ip.clone(),
                mysql_port: dyn_node.mysql_port,
                health_port: dyn_node.health_port,
                status: ServerStatus::new(SERVER_RUNNING),
            };
            nodes.insert(
                dyn_node.id,
                TrackedNode {
                    server,
                    health: NodeHealth::new(config.health_check_threshold),
                },
            );
        }

        Ok(Self {
            config,
            store,
            nodes,
            needs_membership_recheck: true,
        })
    }

    /// One full monitor tick: refresh membership if due, ping health
    /// endpoints, flush status, persist.
    pub async fn tick(&mut self) {
        if self.needs_membership_recheck {
            match self.refresh_membership().await {
                Ok(()) => self.needs_membership_recheck = false,
                Err(e) => warn!(error = %e, "membership refresh failed, will retry next tick"),
            }
        }

        self.probe_all_health().await;
    }

    /// Connect to a hub candidate (dynamic nodes, then bootstrap nodes,
    /// then whatever was last persisted) and refresh the node set from
    /// its membership tables.
    async fn refresh_membership(&mut self) -> ClusterResult<()> {
        let mut hub = self.select_hub().await?;

        let membership = self.fetch_membership(&mut hub).await?;
        let node_info = self.fetch_node_info(&mut hub).await?;

        let by_id: HashMap<i64, &MembershipRow> =
            membership.iter().map(|m| (m.node_id, m)).collect();

        let mut dynamic_nodes = Vec::with_capacity(node_info.len());
        for info in &node_info {
            dynamic_nodes.push(DynamicNode {
                id: info.node_id,
                ip: info.ip.clone(),
                mysql_port: info.mysql_port,
                health_port: info.health_port,
            });

            let entry = self.nodes.entry(info.node_id).or_insert_with(|| TrackedNode {
                server: Server {
                    name: Server::synthetic_name(&self.config.monitor_name, info.node_id),
                    address: info.ip.clone(),
                    mysql_port: info.mysql_port,
                    health_port: info.health_port,
                    status: ServerStatus::new(0),
                },
                health: NodeHealth::new(self.config.health_check_threshold),
            });
            entry.server.address = info.ip.clone();
            entry.server.mysql_port = info.mysql_port;
            entry.server.health_port = info.health_port;

            let running = by_id
                .get(&info.node_id)
                .map(|m| m.status.eq_ignore_ascii_case("quorum"))
                .unwrap_or(true);
            entry.server.status.set_bit(SERVER_RUNNING, running);
            entry.server.status.set_bit(SERVER_DRAINING, info.soft_failed);
            let is_master = by_id
                .get(&info.node_id)
                .map(|m| m.substate.eq_ignore_ascii_case("master"))
                .unwrap_or(false);
            entry.server.status.set_bit(SERVER_MASTER, is_master);
        }

        let present: std::collections::HashSet<i64> =
            node_info.iter().map(|n| n.node_id).collect();
        for (id, tracked) in self.nodes.iter() {
            if !present.contains(id) {
                tracked.server.status.set_bit(SERVER_RUNNING, false);
            }
        }

        self.store.reconcile_dynamic_nodes(&dynamic_nodes)?;
        debug!(count = dynamic_nodes.len(), "membership refreshed from hub");
        Ok(())
    }

    async fn select_hub(&self) -> ClusterResult<HubClient> {
        let mut candidates: Vec<String> = self
            .nodes
            .values()
            .map(|t| format!("{}:{}", t.server.address, t.server.mysql_port))
            .collect();
        candidates.extend(
            self.config
                .bootstrap_nodes
                .iter()
                .map(|b| format!("{}:{}", b.ip, b.mysql_port)),
        );
        for persisted in self.store.list_dynamic_nodes()? {
            candidates.push(format!("{}:{}", persisted.ip, persisted.mysql_port));
        }

        for addr in candidates {
            match self.try_hub_candidate(&addr).await {
                Ok(hub) => return Ok(hub),
                Err(e) => debug!(%addr, error = %e, "hub candidate rejected"),
            }
        }
        Err(ClusterError::NoHub)
    }

    async fn try_hub_candidate(&self, addr: &str) -> ClusterResult<HubClient> {
        let mut hub = HubClient::connect(
            addr,
            &self.config.credentials.username,
            &self.config.credentials.password_sha1,
        )
        .await?;
        if !self.is_part_of_quorum(&mut hub).await? {
            return Err(ClusterError::QueryFailed(format!(
                "{addr} is not part of quorum"
            )));
        }
        Ok(hub)
    }

    async fn is_part_of_quorum(&self, hub: &mut HubClient) -> ClusterResult<bool> {
        let rows = hub.query(QUORUM_QUERY).await?;
        let truthy = rows
            .first()
            .and_then(|row| row.first())
            .and_then(|col| col.as_ref())
            .map(|bytes| matches!(bytes.as_slice(), b"1" | b"true" | b"TRUE"))
            .unwrap_or(false);
        Ok(truthy)
    }

    async fn fetch_membership(&self, hub: &mut HubClient) -> ClusterResult<Vec<MembershipRow>> {
        let rows = hub.query(MEMBERSHIP_QUERY).await?;
        rows.into_iter().map(decode_membership_row).collect()
    }

    async fn fetch_node_info(&self, hub: &mut HubClient) -> ClusterResult<Vec<NodeInfoRow>> {
        let rows = hub.query(NODE_INFO_QUERY).await?;
        rows.into_iter().map(decode_node_info_row).collect()
    }

    /// Concurrent HTTP probes against every known node's health port.
    async fn probe_all_health(&mut self) {
        let timeout = self.config.health_probe_timeout;
        let mut futures = Vec::with_capacity(self.nodes.len());
        for (id, tracked) in self.nodes.iter() {
            let ip = tracked.server.address.clone();
            let port = tracked.server.health_port;
            futures.push(async move { (*id, http_probe(&ip, port, timeout).await) });
        }
        let results = futures_join_all(futures).await;

        for (id, result) in results {
            if let Some(tracked) = self.nodes.get_mut(&id) {
                let down = tracked.health.record(result);
                tracked.server.status.set_bit(SERVER_DOWN, down);
                if down && matches!(result, ProbeResult::Unreachable) {
                    debug!(node_id = id, "node health countdown reached zero, scheduling membership recheck");
                    self.needs_membership_recheck = true;
                }
            }
        }
    }

    /// Admin-initiated soft-fail: mark a node as draining on the hub
    /// and locally, then schedule a membership recheck.
    pub async fn soft_fail(&mut self, node_id: i64) -> ClusterResult<()> {
        self.set_soft_fail(node_id, true, "ALTER CLUSTER SOFTFAIL").await
    }

    pub async fn un_soft_fail(&mut self, node_id: i64) -> ClusterResult<()> {
        self.set_soft_fail(node_id, false, "ALTER CLUSTER UNSOFTFAIL").await
    }

    async fn set_soft_fail(&mut self, node_id: i64, draining: bool, verb: &str) -> ClusterResult<()> {
        let mut hub = self.select_hub().await?;
        hub.query(&format!("{verb} {node_id}")).await?;
        if let Some(tracked) = self.nodes.get(&node_id) {
            tracked.server.status.set_bit(SERVER_DRAINING, draining);
        }
        self.needs_membership_recheck = true;
        info!(node_id, draining, "soft-fail state changed by admin request");
        Ok(())
    }

    pub fn server(&self, node_id: i64) -> Option<&Server> {
        self.nodes.get(&node_id).map(|t| &t.server)
    }

    pub fn known_node_ids(&self) -> Vec<i64> {
        self.nodes.keys().copied().collect()
    }

    /// Snapshot of every tracked node's `Server` object, for a caller
    /// that wants to publish the whole cluster's current status to a
    /// router or pool rather than look up one node at a time. Each
    /// `Server` shares its `ServerStatus` bits with the monitor, so the
    /// snapshot is cheap but reflects status as of the call, not live.
    pub fn servers(&self) -> Vec<Server> {
        self.nodes.values().map(|t| t.server.clone()).collect()
    }
}

async fn futures_join_all<F: std::future::Future>(futures: Vec<F>) -> Vec<F::Output> {
    let mut out = Vec::with_capacity(futures.len());
    for handle in futures.into_iter().map(tokio::spawn) {
        if let Ok(v) = handle.await {
            out.push(v);
        }
    }
    out
}

fn same_bootstrap_set(a: &[BootstrapNode], b: &[BootstrapNode]) -> bool {
    let mut a_sorted: Vec<(&str, u16)> = a.iter().map(|n| (n.ip.as_str(), n.mysql_port)).collect();
    let mut b_sorted: Vec<(&str, u16)> = b.iter().map(|n| (n.ip.as_str(), n.mysql_port)).collect();
    a_sorted.sort_unstable();
    b_sorted.sort_unstable();
    a_sorted == b_sorted
}

fn col_string(row: &crate::hub::Row, idx: usize) -> ClusterResult<String> {
    row.get(idx)
        .and_then(|c| c.as_ref())
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        .ok_or_else(|| ClusterError::BadResponse(format!("missing/NULL column {idx}")))
}

fn col_i64(row: &crate::hub::Row, idx: usize) -> ClusterResult<i64> {
    col_string(row, idx)?
        .parse()
        .map_err(|_| ClusterError::BadResponse(format!("column {idx} is not an integer")))
}

fn col_u16(row: &crate::hub::Row, idx: usize) -> ClusterResult<u16> {
    col_string(row, idx)?
        .parse()
        .map_err(|_| ClusterError::BadResponse(format!("column {idx} is not a u16")))
}

fn decode_membership_row(row: crate::hub::Row) -> ClusterResult<MembershipRow> {
    Ok(MembershipRow {
        node_id: col_i64(&row, 0)?,
        status: col_string(&row, 1)?,
        substate: col_string(&row, 3)?,
    })
}

fn decode_node_info_row(row: crate::hub::Row) -> ClusterResult<NodeInfoRow> {
    Ok(NodeInfoRow {
        node_id: col_i64(&row, 0)?,
        ip: col_string(&row, 1)?,
        mysql_port: col_u16(&row, 2)?,
        health_port: col_u16(&row, 3)?,
        soft_failed: row.get(4).map(|c| c.is_some()).unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bootstrap(ip: &str) -> BootstrapNode {
        BootstrapNode {
            ip: ip.to_string(),
            mysql_port: 3306,
        }
    }

    #[test]
    fn same_bootstrap_set_ignores_order() {
        let a = vec![bootstrap("10.0.0.1"), bootstrap("10.0.0.2")];
        let b = vec![bootstrap("10.0.0.2"), bootstrap("10.0.0.1")];
        assert!(same_bootstrap_set(&a, &b));
    }

    #[test]
    fn different_bootstrap_sets_detected() {
        let a = vec![bootstrap("10.0.0.1")];
        let b = vec![bootstrap("10.0.0.9")];
        assert!(!same_bootstrap_set(&a, &b));
    }

    #[test]
    fn open_wipes_state_on_bootstrap_change() {
        let store = NodeStore::open_in_memory().unwrap();
        store.replace_bootstrap_nodes(&[bootstrap("10.0.0.1")]).unwrap();
        store
            .put_dynamic_node(&DynamicNode {
                id: 1,
                ip: "10.0.1.1".into(),
                mysql_port: 3306,
                health_port: 8080,
            })
            .unwrap();

        let config = MonitorConfig {
            monitor_name: "test".into(),
            bootstrap_nodes: vec![bootstrap("10.0.0.9")],
            credentials: HubCredentials {
                username: "monuser".into(),
                password_sha1: [0u8; 20],
            },
            health_check_threshold: 3,
            health_probe_timeout: Duration::from_millis(100),
            cluster_monitor_interval: Duration::from_secs(5),
        };

        let monitor = ClusterMonitor::open(config, store.clone()).unwrap();
        assert!(monitor.known_node_ids().is_empty());
        assert_eq!(store.list_bootstrap_nodes().unwrap().len(), 1);
        assert_eq!(store.list_bootstrap_nodes().unwrap()[0].ip, "10.0.0.9");
    }

    #[test]
    fn open_keeps_state_when_bootstrap_unchanged() {
        let store = NodeStore::open_in_memory().unwrap();
        store.replace_bootstrap_nodes(&[bootstrap("10.0.0.1")]).unwrap();
        store
            .put_dynamic_node(&DynamicNode {
                id: 7,
                ip: "10.0.1.7".into(),
                mysql_port: 3306,
                health_port: 8080,
            })
            .unwrap();

        let config = MonitorConfig {
            monitor_name: "test".into(),
            bootstrap_nodes: vec![bootstrap("10.0.0.1")],
            credentials: HubCredentials {
                username: "monuser".into(),
                password_sha1: [0u8; 20],
            },
            health_check_threshold: 3,
            health_probe_timeout: Duration::from_millis(100),
            cluster_monitor_interval: Duration::from_secs(5),
        };

        let monitor = ClusterMonitor::open(config, store).unwrap();
        assert_eq!(monitor.known_node_ids(), vec![7]);
        assert!(monitor.server(7).unwrap().status.is_set(SERVER_RUNNING));
    }
}
