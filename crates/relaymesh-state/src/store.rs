//! NodeStore — redb-backed persistence for the cluster's node registry.
//!
//! Two tables: the statically configured bootstrap nodes and the nodes
//! discovered by the last membership query. Values are JSON-serialized
//! into redb's `&[u8]` value column. Schema version is baked into the
//! database filename so an incompatible on-disk layout is never opened
//! by a newer binary; it just starts fresh under the new name.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::{BOOTSTRAP_NODES, DYNAMIC_NODES};
use crate::types::{BootstrapNode, DynamicNode};

/// Bumped whenever the table layout changes incompatibly.
const SCHEMA_VERSION: u32 = 1;

macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// The on-disk filename for the current schema version, inside `dir`.
pub fn db_path(dir: &Path) -> PathBuf {
    dir.join(format!("nodes-v{SCHEMA_VERSION}.redb"))
}

/// Thread-safe node registry backed by redb.
#[derive(Clone)]
pub struct NodeStore {
    db: Arc<Database>,
}

impl NodeStore {
    /// Open (or create) the node registry under `dir`, using the
    /// schema-versioned filename.
    pub fn open(dir: &Path) -> StateResult<Self> {
        let path = db_path(dir);
        let db = Database::create(&path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "node store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory node registry (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory node store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(BOOTSTRAP_NODES).map_err(map_err!(Table))?;
        txn.open_table(DYNAMIC_NODES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Bootstrap nodes ────────────────────────────────────────────

    pub fn list_bootstrap_nodes(&self) -> StateResult<Vec<BootstrapNode>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(BOOTSTRAP_NODES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let node: BootstrapNode =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(node);
        }
        Ok(results)
    }

    /// Replace the entire bootstrap set. Used when the configured
    /// bootstrap nodes no longer match what's persisted, meaning the
    /// previously persisted cluster is unrelated.
    pub fn replace_bootstrap_nodes(&self, nodes: &[BootstrapNode]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(BOOTSTRAP_NODES).map_err(map_err!(Table))?;
            let keys: Vec<String> = table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| Some(entry.ok()?.0.value().to_string()))
                .collect();
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            for node in nodes {
                let value = serde_json::to_vec(node).map_err(map_err!(Serialize))?;
                table
                    .insert(node.table_key(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = nodes.len(), "bootstrap node set replaced");
        Ok(())
    }

    // ── Dynamic nodes ──────────────────────────────────────────────

    pub fn put_dynamic_node(&self, node: &DynamicNode) -> StateResult<()> {
        let key = node.table_key();
        let value = serde_json::to_vec(node).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DYNAMIC_NODES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn get_dynamic_node(&self, id: i64) -> StateResult<Option<DynamicNode>> {
        let key = id.to_string();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DYNAMIC_NODES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let node: DynamicNode =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    pub fn list_dynamic_nodes(&self) -> StateResult<Vec<DynamicNode>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DYNAMIC_NODES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let node: DynamicNode =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(node);
        }
        Ok(results)
    }

    pub fn delete_dynamic_node(&self, id: i64) -> StateResult<bool> {
        let key = id.to_string();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(DYNAMIC_NODES).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Diff dynamic nodes against `current`: insert/update anything
    /// present there, delete anything persisted but absent from it.
    /// Mirrors a membership query's "update existing, insert new, drop
    /// missing" reconciliation.
    pub fn reconcile_dynamic_nodes(&self, current: &[DynamicNode]) -> StateResult<()> {
        let existing_ids: Vec<i64> = self
            .list_dynamic_nodes()?
            .into_iter()
            .map(|n| n.id)
            .collect();
        let current_ids: std::collections::HashSet<i64> = current.iter().map(|n| n.id).collect();

        for node in current {
            self.put_dynamic_node(node)?;
        }
        for id in existing_ids {
            if !current_ids.contains(&id) {
                self.delete_dynamic_node(id)?;
            }
        }
        Ok(())
    }

    /// Drop both tables entirely, used when the bootstrap set has
    /// changed and the previously persisted cluster no longer applies.
    pub fn wipe_all(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut bootstrap = txn.open_table(BOOTSTRAP_NODES).map_err(map_err!(Table))?;
            let keys: Vec<String> = bootstrap
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| Some(entry.ok()?.0.value().to_string()))
                .collect();
            for key in &keys {
                bootstrap.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            let mut dynamic = txn.open_table(DYNAMIC_NODES).map_err(map_err!(Table))?;
            let keys: Vec<String> = dynamic
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| Some(entry.ok()?.0.value().to_string()))
                .collect();
            for key in &keys {
                dynamic.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!("node store wiped");
        Ok(())
    }
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

    fn dynamic(id: i64, ip: &str) -> DynamicNode {
        DynamicNode {
            id,
            ip: ip.to_string(),
            mysql_port: 3306,
            health_port: 8080,
        }
    }

    #[test]
    fn bootstrap_replace_overwrites_prior_set() {
        let store = NodeStore::open_in_memory().unwrap();
        store
            .replace_bootstrap_nodes(&[bootstrap("10.0.0.1"), bootstrap("10.0.0.2")])
            .unwrap();
        assert_eq!(store.list_bootstrap_nodes().unwrap().len(), 2);

        store.replace_bootstrap_nodes(&[bootstrap("10.0.0.9")]).unwrap();
        let nodes = store.list_bootstrap_nodes().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].ip, "10.0.0.9");
    }

    #[test]
    fn dynamic_node_put_and_get() {
        let store = NodeStore::open_in_memory().unwrap();
        let node = dynamic(7, "10.0.1.7");
        store.put_dynamic_node(&node).unwrap();
        assert_eq!(store.get_dynamic_node(7).unwrap(), Some(node));
    }

    #[test]
    fn dynamic_node_get_missing_returns_none() {
        let store = NodeStore::open_in_memory().unwrap();
        assert!(store.get_dynamic_node(99).unwrap().is_none());
    }

    #[test]
    fn dynamic_node_delete() {
        let store = NodeStore::open_in_memory().unwrap();
        store.put_dynamic_node(&dynamic(1, "10.0.1.1")).unwrap();
        assert!(store.delete_dynamic_node(1).unwrap());
        assert!(!store.delete_dynamic_node(1).unwrap());
    }

    #[test]
    fn reconcile_inserts_updates_and_drops() {
        let store = NodeStore::open_in_memory().unwrap();
        store.put_dynamic_node(&dynamic(1, "10.0.1.1")).unwrap();
        store.put_dynamic_node(&dynamic(2, "10.0.1.2")).unwrap();

        let mut updated = dynamic(2, "10.0.1.22");
        updated.health_port = 9090;
        store.reconcile_dynamic_nodes(&[updated.clone(), dynamic(3, "10.0.1.3")]).unwrap();

        let nodes = store.list_dynamic_nodes().unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(store.get_dynamic_node(1).unwrap().is_none());
        assert_eq!(store.get_dynamic_node(2).unwrap().unwrap(), updated);
        assert!(store.get_dynamic_node(3).unwrap().is_some());
    }

    #[test]
    fn wipe_all_clears_both_tables() {
        let store = NodeStore::open_in_memory().unwrap();
        store.replace_bootstrap_nodes(&[bootstrap("10.0.0.1")]).unwrap();
        store.put_dynamic_node(&dynamic(1, "10.0.1.1")).unwrap();

        store.wipe_all().unwrap();
        assert!(store.list_bootstrap_nodes().unwrap().is_empty());
        assert!(store.list_dynamic_nodes().unwrap().is_empty());
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = NodeStore::open(dir.path()).unwrap();
            store.replace_bootstrap_nodes(&[bootstrap("10.0.0.1")]).unwrap();
            store.put_dynamic_node(&dynamic(5, "10.0.1.5")).unwrap();
        }

        let store = NodeStore::open(dir.path()).unwrap();
        assert_eq!(store.list_bootstrap_nodes().unwrap().len(), 1);
        assert_eq!(store.get_dynamic_node(5).unwrap().unwrap().ip, "10.0.1.5");
    }

    #[test]
    fn db_path_bakes_in_schema_version() {
        let dir = Path::new("/tmp/relaymesh-state-test");
        assert_eq!(
            db_path(dir),
            dir.join(format!("nodes-v{SCHEMA_VERSION}.redb"))
        );
    }
}
