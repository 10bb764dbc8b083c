//! Persisted registry of bootstrap and dynamically-discovered cluster
//! nodes, backed by a local redb file whose name carries the schema
//! version.

mod error;
mod store;
mod tables;
mod types;

pub use error::{StateError, StateResult};
pub use store::{db_path, NodeStore};
pub use types::{BootstrapNode, DynamicNode};
