//! Configuration for the standalone daemon: the subset of the documented
//! INI schema (`[maxscale]`/`[server.*]`/`[monitor.*]`/`[listener.*]`)
//! needed to exercise the runtime end to end, expressed as TOML and
//! loaded with `serde` + `toml` rather than a hand-rolled INI dialect.

use std::collections::HashMap;
use std::path::Path;

use relaymesh_proto::password_sha1;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub runtime: RuntimeSection,
    pub listener: ListenerSection,
    #[serde(default)]
    pub server: HashMap<String, ServerSection>,
    #[serde(default)]
    pub monitor: HashMap<String, MonitorSection>,
    /// Username -> cleartext password, hashed into
    /// `SHA1(password)` at load time for both client verification and
    /// backend pass-through authentication.
    #[serde(default)]
    pub users: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeSection {
    pub threads: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerSection {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    pub address: String,
    pub port: u16,
    #[serde(default = "default_pool_max")]
    pub persistpoolmax: usize,
    #[serde(default = "default_persist_max_secs")]
    pub persistmaxtime_secs: u64,
    #[serde(default)]
    pub proxy_protocol: bool,
    /// Whether to request a TLS upgrade before authenticating to this
    /// backend.
    #[serde(default)]
    pub ssl: bool,
}

fn default_pool_max() -> usize {
    5
}

fn default_persist_max_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSection {
    pub bootstrap: Vec<String>,
    pub monitor_user: String,
    pub monitor_password: String,
    #[serde(default = "default_health_threshold")]
    pub health_check_threshold: u32,
    #[serde(default = "default_monitor_interval_secs")]
    pub cluster_monitor_interval_secs: u64,
    #[serde(default = "default_health_probe_timeout_ms")]
    pub health_probe_timeout_ms: u64,
}

fn default_health_threshold() -> u32 {
    3
}

fn default_monitor_interval_secs() -> u64 {
    10
}

fn default_health_probe_timeout_ms() -> u64 {
    1000
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {path:?}: {e}"))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("parsing config {path:?}: {e}"))?;
        Ok(config)
    }

    pub fn user_credentials(&self) -> HashMap<String, [u8; 20]> {
        self.users
            .iter()
            .map(|(user, password)| (user.clone(), password_sha1(password.as_bytes())))
            .collect()
    }
}

/// Split a `host:port` bootstrap address, as found in a monitor
/// section's `bootstrap` list.
pub fn parse_bootstrap_addr(addr: &str) -> anyhow::Result<(String, u16)> {
    let (ip, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("bootstrap node {addr:?} missing a port"))?;
    Ok((ip.to_string(), port.parse()?))
}
