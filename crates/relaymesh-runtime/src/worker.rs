//! One `RoutingWorker`: a single-threaded event loop owning a slice of
//! sessions, a backend pool, and a share of the listener's accept race,
//! per §4.4.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use relaymesh_pool::WorkerPool;
use relaymesh_router::RouterFactory;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

use crate::rebalance::RebalanceCommand;
use crate::session::{MovingSession, Session, SessionHandle, SessionMeta, SessionOptions, SessionOutcome};

/// How many heartbeats make up one idle-session scan interval, per
/// §4.4's "checked at most once per 10 heartbeats".
const IDLE_SCAN_EVERY_N_TICKS: u64 = 10;

/// Static configuration shared by every worker in the pool.
pub struct WorkerOptions {
    pub id: usize,
    pub heartbeat: Duration,
    pub session_options: SessionOptions,
    pub router_factory: Arc<dyn RouterFactory>,
    /// Kept in sync with this worker's session count so a coordinator
    /// thread can sample load without crossing into `Rc`-owning state.
    pub load: Arc<AtomicUsize>,
}

/// One worker's runtime state: its own session registry, backend pool,
/// and the channels connecting it to its peers and the admin thread.
pub struct RoutingWorker {
    options: WorkerOptions,
    pool: Rc<RefCell<WorkerPool>>,
    backend_streams: Rc<RefCell<HashMap<u64, crate::session::StashedStream>>>,
    sessions: Rc<RefCell<HashMap<u64, SessionHandle>>>,
    next_session_id: u64,
    tick_count: u64,
    completed_tx: mpsc::UnboundedSender<u64>,
    completed_rx: mpsc::UnboundedReceiver<u64>,
}

/// A live load snapshot the admin/coordinator thread samples once per
/// second to feed `RebalanceCoordinator`.
pub fn active_session_count(worker: &RoutingWorker) -> usize {
    worker.sessions.borrow().len()
}

impl RoutingWorker {
    pub fn new(options: WorkerOptions) -> Self {
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        Self {
            options,
            pool: Rc::new(RefCell::new(WorkerPool::new())),
            backend_streams: Rc::new(RefCell::new(HashMap::new())),
            sessions: Rc::new(RefCell::new(HashMap::new())),
            next_session_id: 0,
            tick_count: 0,
            completed_tx,
            completed_rx,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.borrow().len()
    }

    fn sync_load(&self) {
        self.options.load.store(self.sessions.borrow().len(), Ordering::Relaxed);
    }

    /// Pulls the cluster monitor's latest running/not-running verdicts
    /// into this worker's own pool, so `evict_expired_all` drops every
    /// pooled entry for a server the monitor has since marked stopped.
    fn sync_server_status(&self) {
        let mut pool = self.pool.borrow_mut();
        for (server, running) in self.options.session_options.server_status.snapshot() {
            pool.set_server_running(&server, running);
        }
    }

    fn fresh_session_id(&mut self) -> u64 {
        let id = (self.options.id as u64) << 48 | self.next_session_id;
        self.next_session_id += 1;
        id
    }

    /// Drives this worker's main loop until `shutdown` is set. Must run
    /// inside a `tokio::task::LocalSet` (sessions hold `Rc`/`RefCell`
    /// state and are spawned with `spawn_local`).
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        mut self,
        listener: Arc<TcpListener>,
        accept_gate: Arc<Semaphore>,
        mut shutdown: watch::Receiver<bool>,
        mut migration_rx: mpsc::UnboundedReceiver<MovingSession>,
        mut rebalance_rx: mpsc::UnboundedReceiver<RebalanceCommand>,
        peer_migration_txs: Rc<HashMap<usize, mpsc::UnboundedSender<MovingSession>>>,
    ) {
        let mut heartbeat = tokio::time::interval(self.options.heartbeat);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }

                _ = heartbeat.tick() => {
                    self.on_tick();
                }

                Some(id) = self.completed_rx.recv() => {
                    self.sessions.borrow_mut().remove(&id);
                    self.sync_load();
                }

                Some(moving) = migration_rx.recv() => {
                    self.accept_moved_session(moving);
                }

                Some(cmd) = rebalance_rx.recv() => {
                    self.execute_rebalance(cmd, &peer_migration_txs);
                }

                permit = accept_gate.clone().acquire_owned() => {
                    let Ok(permit) = permit else { continue };
                    match listener.accept().await {
                        Ok((stream, addr)) => {
                            drop(permit);
                            debug!(worker = self.options.id, peer = %addr, "accepted connection");
                            self.spawn_session(stream);
                        }
                        Err(e) => {
                            drop(permit);
                            warn!(worker = self.options.id, error = %e, "accept failed");
                        }
                    }
                }
            }
        }

        self.shutdown_sequence().await;
    }

    /// Per-tick work, in the order §4.4 specifies: expire idle sessions
    /// (rate-limited), drain the zombie queue, run tick callbacks (none
    /// registered by default), execute a pending rebalance (handled by
    /// its own channel arm above, not here).
    fn on_tick(&mut self) {
        self.tick_count += 1;
        if self.tick_count % IDLE_SCAN_EVERY_N_TICKS == 0 {
            self.expire_idle_sessions();
        }
        self.sync_server_status();
        let now = Instant::now();
        let evicted = self.pool.borrow_mut().evict_expired_all(now);
        if !evicted.is_empty() {
            debug!(worker = self.options.id, count = evicted.len(), "swept expired pool entries");
        }
    }

    fn expire_idle_sessions(&mut self) {
        let now = Instant::now();
        let connection_timeout = self.options.session_options.connection_timeout;
        let net_write_timeout = self.options.session_options.net_write_timeout;
        let mut expired = Vec::new();
        for (id, handle) in self.sessions.borrow().iter() {
            let meta = handle.meta.lock().expect("session meta lock");
            if now.saturating_duration_since(meta.last_read) > connection_timeout
                || now.saturating_duration_since(meta.last_write) > net_write_timeout
            {
                expired.push((*id, handle.control.clone()));
            }
        }
        for (id, control) in expired {
            debug!(worker = self.options.id, session = id, "expiring idle session");
            let _ = control.send(crate::session::SessionControl::Kill);
        }
    }

    fn spawn_session(&mut self, stream: tokio::net::TcpStream) {
        let id = self.fresh_session_id();
        let meta = Arc::new(Mutex::new(SessionMeta::fresh(Instant::now())));
        let router = self.options.router_factory.new_session_router();
        let (session, handle) = Session::accept(
            id,
            stream,
            self.options.session_options.clone(),
            router,
            self.pool.clone(),
            self.backend_streams.clone(),
            meta,
        );
        self.sessions.borrow_mut().insert(id, handle);
        self.sync_load();
        let completed_tx = self.completed_tx.clone();
        tokio::task::spawn_local(async move {
            let outcome = session.run().await;
            match outcome {
                SessionOutcome::Closed | SessionOutcome::Moved => {
                    let _ = completed_tx.send(id);
                }
            }
        });
    }

    fn accept_moved_session(&mut self, moving: MovingSession) {
        let id = moving.id;
        let meta = Arc::new(Mutex::new(SessionMeta::fresh(Instant::now())));
        match Session::resume_after_move(moving, self.pool.clone(), self.backend_streams.clone(), meta)
        {
            Ok((session, handle)) => {
                info!(worker = self.options.id, session = id, "accepted moved session");
                self.sessions.borrow_mut().insert(id, handle);
                self.sync_load();
                let completed_tx = self.completed_tx.clone();
                tokio::task::spawn_local(async move {
                    let outcome = session.run().await;
                    match outcome {
                        SessionOutcome::Closed | SessionOutcome::Moved => {
                            let _ = completed_tx.send(id);
                        }
                    }
                });
            }
            Err(e) => {
                warn!(worker = self.options.id, session = id, error = %e, "failed to resume moved session");
            }
        }
    }

    /// Select sessions by I/O activity (most active first) and ask up
    /// to `move_count` of them to relocate; a session whose router
    /// reports it unmovable (a live backend link) simply ignores the
    /// request and stays put.
    fn execute_rebalance(
        &mut self,
        cmd: RebalanceCommand,
        peer_migration_txs: &Rc<HashMap<usize, mpsc::UnboundedSender<MovingSession>>>,
    ) {
        let Some(dest_tx) = peer_migration_txs.get(&cmd.destination) else {
            warn!(worker = self.options.id, destination = cmd.destination, "unknown rebalance destination");
            return;
        };
        let mut candidates: Vec<(u64, u64)> = self
            .sessions
            .borrow()
            .iter()
            .map(|(id, handle)| (*id, handle.meta.lock().expect("session meta lock").io_events))
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1));
        for (id, _) in candidates.into_iter().take(cmd.move_count) {
            if let Some(handle) = self.sessions.borrow().get(&id) {
                debug!(worker = self.options.id, session = id, destination = cmd.destination, "requesting move");
                let _ = handle
                    .control
                    .send(crate::session::SessionControl::MoveTo(dest_tx.clone()));
            }
        }
    }

    /// Evict all pool entries, kill remaining sessions, and retry every
    /// 100ms until the session registry is empty, per §4.4's shutdown.
    async fn shutdown_sequence(&mut self) {
        info!(worker = self.options.id, "shutting down");
        self.pool.borrow_mut().evict_all();

        loop {
            let remaining: Vec<mpsc::UnboundedSender<crate::session::SessionControl>> = self
                .sessions
                .borrow()
                .values()
                .map(|h| h.control.clone())
                .collect();
            if remaining.is_empty() {
                break;
            }
            for control in &remaining {
                let _ = control.send(crate::session::SessionControl::Kill);
            }
            while let Ok(id) = self.completed_rx.try_recv() {
                self.sessions.borrow_mut().remove(&id);
            }
            self.sync_load();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!(worker = self.options.id, "all sessions drained, exiting");
    }
}

/// Spawn a `RoutingWorker`'s loop on a dedicated OS thread running its
/// own single-threaded Tokio runtime + `LocalSet`, matching the
/// per-worker pinned-thread model §5's Rust realization describes.
pub fn spawn_worker_thread(
    options: WorkerOptions,
    listener: Arc<TcpListener>,
    accept_gate: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
    migration_rx: mpsc::UnboundedReceiver<MovingSession>,
    rebalance_rx: mpsc::UnboundedReceiver<RebalanceCommand>,
    peer_migration_txs: HashMap<usize, mpsc::UnboundedSender<MovingSession>>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("relaymesh-worker-{}", options.id))
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build worker runtime");
            let local = tokio::task::LocalSet::new();
            let worker = RoutingWorker::new(options);
            let peer_migration_txs = Rc::new(peer_migration_txs);
            local.block_on(&rt, async move {
                worker
                    .run(listener, accept_gate, shutdown, migration_rx, rebalance_rx, peer_migration_txs)
                    .await;
            });
        })
        .expect("failed to spawn worker thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionOptions;
    use relaymesh_pool::PoolLimits;
    use relaymesh_router::RoundRobinRouterFactory;

    fn dummy_session_options() -> SessionOptions {
        SessionOptions {
            server_version: "8.0.0-relaymesh".into(),
            connection_timeout: Duration::from_secs(30),
            net_write_timeout: Duration::from_secs(30),
            pool_limits: PoolLimits {
                pool_max: 4,
                persist_max_time: Duration::from_secs(60),
            },
            send_proxy_protocol: false,
            user_credentials: Arc::new(HashMap::new()),
            server_status: relaymesh_pool::ServerStatusBoard::new(),
            tls_servers: Arc::new(std::collections::HashSet::new()),
        }
    }

    #[test]
    fn fresh_session_id_embeds_worker_id_in_high_bits() {
        let mut w = RoutingWorker::new(WorkerOptions {
            id: 3,
            heartbeat: Duration::from_millis(10),
            session_options: dummy_session_options(),
            router_factory: Arc::new(RoundRobinRouterFactory::new(Vec::new())),
            load: Arc::new(AtomicUsize::new(0)),
        });
        let a = w.fresh_session_id();
        let b = w.fresh_session_id();
        assert_eq!(a >> 48, 3);
        assert_eq!(b, a + 1);
    }
}
