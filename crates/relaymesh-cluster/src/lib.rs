//! Cluster-aware monitoring: a single background thread per configured
//! cluster that keeps its node set current against a SQL-speaking hub,
//! pings node health endpoints over HTTP, flushes backing `Server`
//! status bits, and persists what it learned to a local node registry.

mod error;
mod health;
mod hub;
mod monitor;
mod status;

pub use error::{ClusterError, ClusterResult};
pub use health::{http_probe, NodeHealth, ProbeResult};
pub use hub::{HubClient, Row};
pub use monitor::{ClusterMonitor, HubCredentials, MonitorConfig};
pub use status::{
    Server, ServerStatus, SERVER_DOWN, SERVER_DRAINING, SERVER_MASTER, SERVER_RUNNING, SERVER_SLAVE,
};
