//! redb table definitions for the persisted node registry.
//!
//! Both tables use `&str` keys and `&[u8]` values (JSON-serialized
//! domain types), matching the schema in the external interfaces.

use redb::TableDefinition;

/// Bootstrap nodes keyed by IP address.
pub const BOOTSTRAP_NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("bootstrap_nodes");

/// Dynamically discovered cluster nodes, keyed by their node ID (decimal string).
pub const DYNAMIC_NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("dynamic_nodes");
