//! relaymeshd — the proxy daemon.
//!
//! Single binary that assembles relaymesh's subsystems: N routing
//! workers sharing one listener, an optional cluster monitor per
//! configured cluster, and the rebalance coordinator that samples
//! worker load and turns an imbalance into a cross-worker session move.
//!
//! # Usage
//!
//! ```text
//! relaymeshd standalone --config relaymesh.toml --data-dir /var/lib/relaymesh
//! ```

mod config;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{info, warn};

use relaymesh_cluster::{
    ClusterMonitor, HubCredentials, MonitorConfig, Server, SERVER_DOWN, SERVER_DRAINING,
    SERVER_RUNNING,
};
use relaymesh_pool::{PoolLimits, ServerStatusBoard};
use relaymesh_proto::password_sha1;
use relaymesh_router::{Endpoint, RouterFactory, RoundRobinRouterFactory};
use relaymesh_runtime::{
    spawn_worker_thread, MovingSession, RebalanceCommand, RebalanceCoordinator, SessionOptions,
    WorkerOptions,
};
use relaymesh_state::{BootstrapNode, NodeStore};

use config::Config;

const REBALANCE_WINDOW_SAMPLES: usize = 10;
const REBALANCE_THRESHOLD: f64 = 4.0;

#[derive(Parser)]
#[command(name = "relaymeshd", about = "relaymesh proxy daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in standalone mode: every subsystem in one process.
    Standalone {
        /// Path to the TOML configuration file.
        #[arg(long)]
        config: PathBuf,

        /// Data directory for persisted cluster-monitor state.
        #[arg(long, default_value = "/var/lib/relaymesh")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relaymeshd=debug,relaymesh=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Standalone { config, data_dir } => run_standalone(config, data_dir).await,
    }
}

async fn run_standalone(config_path: PathBuf, data_dir: PathBuf) -> anyhow::Result<()> {
    info!("relaymeshd starting in standalone mode");
    std::fs::create_dir_all(&data_dir)?;

    let config = Config::from_file(&config_path)?;
    let worker_count = config.runtime.threads.max(1);

    let endpoints: Vec<Endpoint> = config
        .server
        .iter()
        .map(|(name, srv)| Endpoint {
            server: name.clone(),
            address: srv.address.clone(),
            port: srv.port,
        })
        .collect();
    info!(count = endpoints.len(), "backend servers configured");
    let round_robin_factory = Arc::new(RoundRobinRouterFactory::new(endpoints));
    let router_factory: Arc<dyn RouterFactory> = round_robin_factory.clone();
    let server_status = ServerStatusBoard::new();
    let tls_servers: Arc<HashSet<String>> = Arc::new(
        config
            .server
            .iter()
            .filter(|(_, srv)| srv.ssl)
            .map(|(name, _)| name.clone())
            .collect(),
    );

    // The runtime pools one connection set per session, not per
    // endpoint, so a single set of limits applies proxy-wide; take the
    // first configured server's as representative, falling back to a
    // conservative default if none is configured.
    let pool_limits = config
        .server
        .values()
        .next()
        .map(|s| PoolLimits {
            pool_max: s.persistpoolmax,
            persist_max_time: Duration::from_secs(s.persistmaxtime_secs),
        })
        .unwrap_or(PoolLimits {
            pool_max: 5,
            persist_max_time: Duration::from_secs(300),
        });

    let session_options = SessionOptions {
        server_version: "8.0.34-relaymesh".to_string(),
        connection_timeout: Duration::from_secs(28_800),
        net_write_timeout: Duration::from_secs(60),
        pool_limits,
        send_proxy_protocol: config.server.values().any(|s| s.proxy_protocol),
        user_credentials: Arc::new(config.user_credentials()),
        server_status: server_status.clone(),
        tls_servers,
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.listener.port));
    let listener = Arc::new(TcpListener::bind(addr).await?);
    info!(%addr, "listener bound");
    let accept_gate = Arc::new(Semaphore::new(worker_count));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // One migration inbox per worker, shared with every peer so any
    // worker can hand a session directly to any other; one private
    // rebalance inbox per worker, fed only by this coordinator.
    let mut migration_txs = HashMap::new();
    let mut migration_rxs = HashMap::new();
    let mut rebalance_txs = HashMap::new();
    let mut rebalance_rxs = HashMap::new();
    for id in 0..worker_count {
        let (tx, rx) = mpsc::unbounded_channel();
        migration_txs.insert(id, tx);
        migration_rxs.insert(id, rx);
        let (rtx, rrx) = mpsc::unbounded_channel();
        rebalance_txs.insert(id, rtx);
        rebalance_rxs.insert(id, rrx);
    }

    let mut worker_handles = Vec::with_capacity(worker_count);
    let mut loads = Vec::with_capacity(worker_count);
    for id in 0..worker_count {
        let load = Arc::new(AtomicUsize::new(0));
        loads.push(load.clone());
        let options = WorkerOptions {
            id,
            heartbeat: Duration::from_secs(1),
            session_options: session_options.clone(),
            router_factory: router_factory.clone(),
            load,
        };
        let migration_rx = migration_rxs.remove(&id).expect("migration rx registered above");
        let rebalance_rx = rebalance_rxs.remove(&id).expect("rebalance rx registered above");
        let peers: HashMap<usize, mpsc::UnboundedSender<MovingSession>> = migration_txs
            .iter()
            .filter(|(peer, _)| **peer != id)
            .map(|(peer, tx)| (*peer, tx.clone()))
            .collect();
        worker_handles.push(spawn_worker_thread(
            options,
            listener.clone(),
            accept_gate.clone(),
            shutdown_rx.clone(),
            migration_rx,
            rebalance_rx,
            peers,
        ));
    }
    info!(workers = worker_count, "worker pool started");

    let monitor_handles = spawn_cluster_monitors(
        &config,
        &data_dir,
        shutdown_rx.clone(),
        round_robin_factory,
        server_status,
    )?;

    let rebalance_task = tokio::spawn(run_rebalance_coordinator(loads, rebalance_txs, shutdown_rx.clone()));

    tokio::signal::ctrl_c().await.expect("failed to install CTRL+C handler");
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = rebalance_task.await;
    for handle in worker_handles {
        let _ = handle.join();
    }
    for handle in monitor_handles {
        let _ = handle.join();
    }

    info!("relaymeshd stopped");
    Ok(())
}

/// Spawn one OS thread per configured cluster, each running its own
/// single-threaded runtime driving that cluster's `ClusterMonitor` tick
/// loop. Not a `RoutingWorker`: it owns no sessions, only the local
/// persisted-node registry and the hub connection.
///
/// After every tick, publishes the cluster's current node set to the
/// router factory (so `choose_target` stops offering removed or
/// draining nodes) and to the worker-side status board (so pooled
/// connections to a stopped node are evicted instead of reused).
fn spawn_cluster_monitors(
    config: &Config,
    data_dir: &std::path::Path,
    shutdown_rx: watch::Receiver<bool>,
    router_factory: Arc<RoundRobinRouterFactory>,
    server_status: ServerStatusBoard,
) -> anyhow::Result<Vec<std::thread::JoinHandle<()>>> {
    let mut handles = Vec::new();
    for (name, mon_cfg) in &config.monitor {
        let store = NodeStore::open(data_dir)?;
        let bootstrap_nodes = mon_cfg
            .bootstrap
            .iter()
            .map(|addr| config::parse_bootstrap_addr(addr))
            .collect::<anyhow::Result<Vec<_>>>()?
            .into_iter()
            .map(|(ip, mysql_port)| BootstrapNode { ip, mysql_port })
            .collect();

        let monitor_config = MonitorConfig {
            monitor_name: name.clone(),
            bootstrap_nodes,
            credentials: HubCredentials {
                username: mon_cfg.monitor_user.clone(),
                password_sha1: password_sha1(mon_cfg.monitor_password.as_bytes()),
            },
            health_check_threshold: mon_cfg.health_check_threshold,
            health_probe_timeout: Duration::from_millis(mon_cfg.health_probe_timeout_ms),
            cluster_monitor_interval: Duration::from_secs(mon_cfg.cluster_monitor_interval_secs),
        };
        let interval = monitor_config.cluster_monitor_interval;
        let mut monitor = ClusterMonitor::open(monitor_config, store)?;
        let mut shutdown = shutdown_rx.clone();
        let monitor_name = name.clone();
        let router_factory = router_factory.clone();
        let server_status = server_status.clone();

        let handle = std::thread::Builder::new()
            .name(format!("relaymesh-monitor-{monitor_name}"))
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build monitor runtime");
                rt.block_on(async move {
                    let mut ticker = tokio::time::interval(interval);
                    loop {
                        tokio::select! {
                            biased;
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    break;
                                }
                            }
                            _ = ticker.tick() => {
                                monitor.tick().await;
                                publish_cluster_status(&monitor, &router_factory, &server_status);
                            }
                        }
                    }
                    info!(monitor = %monitor_name, "cluster monitor stopped");
                });
            })?;
        handles.push(handle);
    }
    Ok(handles)
}

/// Pushes one cluster monitor's current node set to the router factory
/// and the worker-side status board: membership changes (a node
/// appearing or disappearing) reach `update_backends`, while a node
/// still present but draining or down is marked unhealthy rather than
/// dropped, so in-flight sessions on it aren't yanked mid-query.
fn publish_cluster_status(
    monitor: &ClusterMonitor,
    router_factory: &Arc<RoundRobinRouterFactory>,
    server_status: &ServerStatusBoard,
) {
    let servers = monitor.servers();

    let endpoints: Vec<Endpoint> = servers
        .iter()
        .filter(|s| s.status.is_set(SERVER_RUNNING))
        .map(to_endpoint)
        .collect();
    router_factory.update_backends(endpoints);

    for server in &servers {
        let healthy = server.status.is_set(SERVER_RUNNING)
            && !server.status.is_set(SERVER_DRAINING)
            && !server.status.is_set(SERVER_DOWN);
        router_factory.set_healthy(&server.name, healthy);
    }

    server_status.publish(servers.iter().map(|s| {
        let running = s.status.is_set(SERVER_RUNNING) && !s.status.is_set(SERVER_DOWN);
        (s.name.clone(), running)
    }));
}

fn to_endpoint(server: &Server) -> Endpoint {
    Endpoint {
        server: server.name.clone(),
        address: server.address.clone(),
        port: server.mysql_port,
    }
}

/// Samples every worker's live session count once per second, feeds it
/// to a `RebalanceCoordinator`, and posts any resulting command to the
/// busiest worker's own rebalance inbox.
async fn run_rebalance_coordinator(
    loads: Vec<Arc<AtomicUsize>>,
    rebalance_txs: HashMap<usize, mpsc::UnboundedSender<RebalanceCommand>>,
    mut shutdown: watch::Receiver<bool>,
) {
    if loads.len() < 2 {
        return;
    }
    let mut coordinator = RebalanceCoordinator::new(loads.len(), REBALANCE_WINDOW_SAMPLES, REBALANCE_THRESHOLD);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                for (id, load) in loads.iter().enumerate() {
                    coordinator.record(id, load.load(Ordering::Relaxed) as f64);
                }
                if let Some(cmd) = coordinator.decide() {
                    match rebalance_txs.get(&cmd.source) {
                        Some(tx) => {
                            let _ = tx.send(cmd);
                        }
                        None => warn!(source = cmd.source, "rebalance coordinator picked an unknown worker"),
                    }
                }
            }
        }
    }
}
