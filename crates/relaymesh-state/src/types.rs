//! Domain types persisted in the node registry.

use serde::{Deserialize, Serialize};

/// A statically configured node the monitor always trusts, regardless
/// of what the last membership query returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapNode {
    pub ip: String,
    pub mysql_port: u16,
}

impl BootstrapNode {
    pub fn table_key(&self) -> &str {
        &self.ip
    }
}

/// A node discovered via a membership query against the cluster hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicNode {
    pub id: i64,
    pub ip: String,
    pub mysql_port: u16,
    pub health_port: u16,
}

impl DynamicNode {
    pub fn table_key(&self) -> String {
        self.id.to_string()
    }
}
