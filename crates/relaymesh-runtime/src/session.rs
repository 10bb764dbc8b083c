//! One client connection's lifecycle: the proxy's own client-facing
//! greeting and auth, then routing each command to a backend (fresh-dialled
//! or pooled) and relaying its reply back, per §4.2/§4.3/§4.6.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use relaymesh_pool::{PoolLimits, PooledConn, ServerStatusBoard, WorkerPool};
use relaymesh_proto::{
    build_access_denied, build_auth_ok, build_server_greeting, parse_client_handshake_response,
    random_scramble, verify_native_password, BackendEvent, BackendProto, ConnectionOptions,
    Credentials, ProxyHeader, ReplyDisposition, ReplyMeta, ServerGreeting, COM_QUERY,
};
use relaymesh_router::{
    Endpoint, QueryContext, RetryDecision, Router, SessionState, TargetSelection, TrxState,
};
use relaymesh_wire::{build_packet, split_complete_packets};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::tls::BackendTransport;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

fn fresh_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

fn build_err_packet(code: u16, sqlstate: &str, message: &str) -> Vec<u8> {
    let mut out = vec![0xff];
    out.extend_from_slice(&code.to_le_bytes());
    out.push(b'#');
    out.extend_from_slice(sqlstate.as_bytes());
    out.extend_from_slice(message.as_bytes());
    out
}

/// Liveness timestamps a worker's idle scanner consults; updated by the
/// session task after every read/write.
#[derive(Debug, Clone, Copy)]
pub struct SessionMeta {
    pub last_read: Instant,
    pub last_write: Instant,
    pub io_events: u64,
}

impl SessionMeta {
    pub fn fresh(now: Instant) -> Self {
        Self {
            last_read: now,
            last_write: now,
            io_events: 0,
        }
    }

    fn touch_read(&mut self, now: Instant) {
        self.last_read = now;
        self.io_events += 1;
    }

    fn touch_write(&mut self, now: Instant) {
        self.last_write = now;
        self.io_events += 1;
    }
}

/// What a worker sends to a running session's control loop.
pub enum SessionControl {
    Kill,
    /// Hand the session to another worker; carries that worker's
    /// inbound migration channel.
    MoveTo(mpsc::UnboundedSender<MovingSession>),
}

/// Everything about a suspended session needed to resume it on a
/// different worker. Pool state is excluded: the pool is worker-private,
/// so the destination worker starts this session with no backend
/// connection and dials fresh on its next query.
pub struct MovingSession {
    pub id: u64,
    pub std_stream: std::net::TcpStream,
    pub session_state: SessionState,
    pub router: Box<dyn Router>,
    pub options: SessionOptions,
}

/// Static, per-listener configuration shared by every session it accepts.
#[derive(Clone)]
pub struct SessionOptions {
    pub server_version: String,
    pub connection_timeout: Duration,
    pub net_write_timeout: Duration,
    pub pool_limits: PoolLimits,
    pub send_proxy_protocol: bool,
    /// Username -> `SHA1(password)`, the credential the proxy both
    /// verifies the client against and uses to authenticate onward to
    /// whatever backend the router picks (pass-through auth).
    pub user_credentials: Arc<HashMap<String, [u8; 20]>>,
    /// Cluster monitor's view of which servers are currently running,
    /// consulted before a closed backend connection is offered back to
    /// the pool. Defaults to "running" for any server it knows nothing
    /// about, so deployments with no cluster monitor are unaffected.
    pub server_status: ServerStatusBoard,
    /// Servers to request a TLS upgrade for before authenticating, per
    /// each `[server.*]` section's `ssl` flag.
    pub tls_servers: Arc<HashSet<String>>,
}

/// An id-keyed socket plus the server it dials, kept separately from
/// `relaymesh_pool::PooledConn` (which holds only protocol state, not a
/// live socket).
pub struct StashedStream {
    server: String,
    stream: BackendTransport,
}

struct BackendLink {
    conn_id: u64,
    endpoint: Endpoint,
    proto: BackendProto,
    stream: BackendTransport,
}

/// One client connection. Holds the router chosen for its whole
/// lifetime and, while a query is in flight or its backend is pooled,
/// at most one `BackendLink`.
pub struct Session {
    id: u64,
    client: TcpStream,
    client_buf: BytesMut,
    client_seq: u8,
    authenticated_user: String,
    options: SessionOptions,
    router: Box<dyn Router>,
    session_state: SessionState,
    pool: Rc<RefCell<WorkerPool>>,
    backend_streams: Rc<RefCell<HashMap<u64, StashedStream>>>,
    backend: Option<BackendLink>,
    control_rx: mpsc::UnboundedReceiver<SessionControl>,
    meta: Arc<Mutex<SessionMeta>>,
}

/// Handle to a session the worker keeps for bookkeeping and control.
pub struct SessionHandle {
    pub id: u64,
    pub meta: Arc<Mutex<SessionMeta>>,
    pub control: mpsc::UnboundedSender<SessionControl>,
}

/// How a session's run loop ended.
pub enum SessionOutcome {
    Closed,
    Moved,
}

impl Session {
    pub fn accept(
        id: u64,
        client: TcpStream,
        options: SessionOptions,
        router: Box<dyn Router>,
        pool: Rc<RefCell<WorkerPool>>,
        backend_streams: Rc<RefCell<HashMap<u64, StashedStream>>>,
        meta: Arc<Mutex<SessionMeta>>,
    ) -> (Self, SessionHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self {
            id,
            client,
            client_buf: BytesMut::with_capacity(4096),
            client_seq: 0,
            authenticated_user: String::new(),
            options,
            router,
            session_state: SessionState {
                trx_state: TrxState::Inactive,
                autocommit: true,
            },
            pool,
            backend_streams,
            backend: None,
            control_rx: rx,
            meta: meta.clone(),
        };
        let handle = SessionHandle {
            id,
            meta,
            control: tx,
        };
        (session, handle)
    }

    /// Reconstruct a session on its new worker after a cross-worker move.
    /// The client socket is re-accepted as-is; no backend link survives
    /// the move, so the next command dials fresh.
    pub fn resume_after_move(
        moving: MovingSession,
        pool: Rc<RefCell<WorkerPool>>,
        backend_streams: Rc<RefCell<HashMap<u64, StashedStream>>>,
        meta: Arc<Mutex<SessionMeta>>,
    ) -> io::Result<(Self, SessionHandle)> {
        moving.std_stream.set_nonblocking(true)?;
        let client = TcpStream::from_std(moving.std_stream)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self {
            id: moving.id,
            client,
            client_buf: BytesMut::with_capacity(4096),
            client_seq: 0,
            authenticated_user: String::new(),
            options: moving.options,
            router: moving.router,
            session_state: moving.session_state,
            pool,
            backend_streams,
            backend: None,
            control_rx: rx,
            meta: meta.clone(),
        };
        let handle = SessionHandle {
            id: session.id,
            meta,
            control: tx,
        };
        Ok((session, handle))
    }

    pub async fn handshake_client(&mut self) -> RuntimeResult<bool> {
        let scramble = random_scramble();
        let greeting = ServerGreeting {
            server_version: self.options.server_version.clone(),
            thread_id: self.id as u32,
            scramble,
            charset: 45,
            status: 0x0002,
        };
        self.write_client_packet(0, build_server_greeting(&greeting)).await?;

        let response_packet = match self.read_one_client_packet().await? {
            Some(p) => p,
            None => return Ok(false),
        };
        let response = parse_client_handshake_response(&response_packet)?;

        let expected = self.options.user_credentials.get(&response.username).copied();
        let authenticated = expected
            .map(|pw| verify_native_password(&response.auth_response, &scramble, &pw))
            .unwrap_or(false);

        if !authenticated {
            warn!(username = %response.username, "client authentication failed");
            self.write_client_packet(self.client_seq, build_access_denied(&response.username))
                .await?;
            return Ok(false);
        }

        self.authenticated_user = response.username.clone();
        self.write_client_packet(self.client_seq, build_auth_ok()).await?;
        info!(session = self.id, username = %response.username, "client authenticated");
        Ok(true)
    }

    /// Drive the session until the client disconnects, it is killed, or
    /// it is handed off to another worker. A migration posts the moving
    /// payload straight to the destination worker's channel and returns
    /// `SessionOutcome::Moved`; the owning worker drops its own handle.
    pub async fn run(mut self) -> SessionOutcome {
        match self.handshake_client().await {
            Ok(true) => {}
            _ => return SessionOutcome::Closed,
        }

        loop {
            tokio::select! {
                biased;
                ctrl = self.control_rx.recv() => {
                    match ctrl {
                        Some(SessionControl::Kill) | None => {
                            self.close_backend().await;
                            return SessionOutcome::Closed;
                        }
                        Some(SessionControl::MoveTo(dest)) => {
                            if self.is_movable() {
                                return self.migrate(dest);
                            }
                            debug!(session = self.id, "move requested while not movable, ignoring");
                        }
                    }
                }
                packet = self.read_one_client_packet() => {
                    match packet {
                        Ok(Some(payload)) => {
                            if let Err(e) = self.handle_command(&payload).await {
                                warn!(session = self.id, error = %e, "session command failed, closing");
                                self.close_backend().await;
                                return SessionOutcome::Closed;
                            }
                        }
                        Ok(None) => {
                            self.close_backend().await;
                            return SessionOutcome::Closed;
                        }
                        Err(e) => {
                            warn!(session = self.id, error = %e, "client read failed");
                            self.close_backend().await;
                            return SessionOutcome::Closed;
                        }
                    }
                }
            }
        }
    }

    /// A session may move only with no live backend link; the new
    /// worker's copy dials fresh on its first query instead.
    fn is_movable(&self) -> bool {
        self.backend.is_none()
    }

    fn migrate(self, dest: mpsc::UnboundedSender<MovingSession>) -> SessionOutcome {
        let std_stream = match self.client.into_std() {
            Ok(s) => s,
            Err(e) => {
                warn!(session = self.id, error = %e, "failed to extract std stream for move");
                return SessionOutcome::Closed;
            }
        };
        let moving = MovingSession {
            id: self.id,
            std_stream,
            session_state: self.session_state,
            router: self.router,
            options: self.options,
        };
        if dest.send(moving).is_err() {
            warn!(session = self.id, "destination worker gone while moving session");
        }
        SessionOutcome::Moved
    }

    async fn handle_command(&mut self, payload: &[u8]) -> RuntimeResult<()> {
        if payload.is_empty() {
            return Ok(());
        }
        self.track_transaction_state(payload);

        let command = payload[0];
        let query = if command == COM_QUERY {
            Some(String::from_utf8_lossy(&payload[1..]).into_owned())
        } else {
            None
        };
        let ctx = QueryContext {
            command,
            query: query.as_deref(),
        };
        let selection = self.router.choose_target(&ctx, &self.session_state);
        let endpoint = match selection {
            Some(TargetSelection::Single(e)) => e,
            Some(TargetSelection::Multi(mut many)) if !many.is_empty() => {
                if many.len() > 1 {
                    warn!(
                        session = self.id,
                        candidates = many.len(),
                        "fan-out target selection not supported here, using first endpoint only"
                    );
                }
                many.remove(0)
            }
            _ => {
                self.write_client_packet(
                    0,
                    build_err_packet(1045, "28000", "no route available for this query"),
                )
                .await?;
                return Err(RuntimeError::NoTarget);
            }
        };

        match self.run_command_against(&endpoint, payload).await {
            Ok(meta) => {
                self.router.on_reply(&endpoint, &meta);
                Ok(())
            }
            Err(RuntimeError::Proto(e)) => {
                let class = e.class();
                self.close_backend().await;
                if self.router.on_error(&endpoint, class) == RetryDecision::Retry
                {
                    warn!(session = self.id, error = %e, "backend error, retrying once");
                    let meta = self.run_command_against(&endpoint, payload).await?;
                    self.router.on_reply(&endpoint, &meta);
                    Ok(())
                } else {
                    Err(RuntimeError::Proto(e))
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn run_command_against(
        &mut self,
        endpoint: &Endpoint,
        payload: &[u8],
    ) -> RuntimeResult<ReplyMeta> {
        self.ensure_backend(endpoint).await?;
        let link = self.backend.as_mut().expect("just ensured");
        link.proto.write(payload, ReplyDisposition::Collect)?;
        flush_output(link).await?;

        let meta = drive_backend_reply(link, Some(&mut self.client)).await?;
        let mut guard = self.meta.lock().expect("session meta lock");
        guard.touch_write(Instant::now());
        drop(guard);
        Ok(meta)
    }

    async fn ensure_backend(&mut self, endpoint: &Endpoint) -> RuntimeResult<()> {
        if let Some(link) = &self.backend {
            if link.endpoint == *endpoint {
                return Ok(());
            }
            self.close_backend().await;
        }

        let credentials = self.current_credentials();

        let pooled = self
            .pool
            .borrow_mut()
            .take(&endpoint.server, Instant::now(), credentials.clone());
        self.reconcile_pool_streams(&endpoint.server);

        if let Some(PooledConn { conn_id, proto, .. }) = pooled {
            if let Some(stashed) = self.backend_streams.borrow_mut().remove(&conn_id) {
                let mut link = BackendLink {
                    conn_id,
                    endpoint: endpoint.clone(),
                    proto,
                    stream: stashed.stream,
                };
                let wrote = flush_output(&mut link).await?;
                if wrote {
                    // A change-user packet was queued by the pool's
                    // reuse handshake; its reply is proxy-private.
                    drive_backend_reply(&mut link, None).await?;
                }
                self.backend = Some(link);
                return Ok(());
            }
            debug!(conn_id, "pooled entry had no stashed socket, dialing fresh");
        }

        let stream = TcpStream::connect(endpoint.dial_target()).await?;
        let proxy_header = if self.options.send_proxy_protocol {
            match (self.client.peer_addr(), self.client.local_addr()) {
                (Ok(src), Ok(dst)) => Some(ProxyHeader { src, dst }),
                _ => None,
            }
        } else {
            None
        };
        let want_ssl = self.options.tls_servers.contains(&endpoint.server);
        let mut proto = BackendProto::new(ConnectionOptions {
            credentials,
            want_ssl,
            want_session_track: false,
            client_capabilities: 0,
            init_queries: Vec::new(),
            proxy_header,
        });
        proto.init_connection()?;
        let mut link = BackendLink {
            conn_id: fresh_conn_id(),
            endpoint: endpoint.clone(),
            proto,
            stream: BackendTransport::plain(stream),
        };
        flush_output(&mut link).await?;
        drive_until_established(&mut link).await?;
        self.backend = Some(link);
        Ok(())
    }

    /// `WorkerPool::take` can silently discard dead or reuse-failed
    /// entries; drop their stashed sockets too so they don't leak.
    fn reconcile_pool_streams(&self, server: &str) {
        let live: std::collections::HashSet<u64> =
            self.pool.borrow().conn_ids(server).into_iter().collect();
        self.backend_streams
            .borrow_mut()
            .retain(|id, stashed| stashed.server != server || live.contains(id));
    }

    fn current_credentials(&self) -> Credentials {
        let password_sha1 = self
            .options
            .user_credentials
            .get(&self.authenticated_user)
            .copied()
            .unwrap_or([0u8; 20]);
        Credentials {
            username: self.authenticated_user.clone(),
            password_sha1,
            database: None,
            charset: 45,
        }
    }

    async fn close_backend(&mut self) {
        if let Some(link) = self.backend.take() {
            if link.proto.established() {
                let server = link.endpoint.server.clone();
                let conn_id = link.conn_id;
                let server_running = self.options.server_status.is_running(&server);
                let offered = self.pool.borrow_mut().offer(
                    &server,
                    &self.options.pool_limits,
                    server_running,
                    PooledConn {
                        conn_id,
                        proto: link.proto,
                        created_at: Instant::now(),
                        hung_up: false,
                    },
                );
                if offered.is_none() {
                    self.backend_streams.borrow_mut().insert(
                        conn_id,
                        StashedStream {
                            server,
                            stream: link.stream,
                        },
                    );
                }
            }
        }
    }

    fn track_transaction_state(&mut self, payload: &[u8]) {
        if payload.first().copied() != Some(COM_QUERY) {
            return;
        }
        let sql = String::from_utf8_lossy(&payload[1..]);
        let normalized = sql.trim_start().to_ascii_lowercase();
        if normalized.starts_with("begin") || normalized.starts_with("start transaction") {
            self.session_state.trx_state = TrxState::Active;
        } else if normalized.starts_with("commit") || normalized.starts_with("rollback") {
            self.session_state.trx_state = TrxState::Inactive;
        } else if normalized.starts_with("set autocommit") {
            self.session_state.autocommit = normalized.contains('1');
        }
    }

    async fn read_one_client_packet(&mut self) -> RuntimeResult<Option<Vec<u8>>> {
        let mut assembled = Vec::new();
        loop {
            for packet in split_complete_packets(&mut self.client_buf) {
                let continued = packet.is_continued();
                assembled.extend_from_slice(&packet.payload);
                if !continued {
                    return Ok(Some(assembled));
                }
            }
            let mut buf = [0u8; 8192];
            let n = self.client.read(&mut buf).await?;
            if n == 0 {
                return Ok(if assembled.is_empty() { None } else { Some(assembled) });
            }
            self.client_buf.extend_from_slice(&buf[..n]);
            let mut guard = self.meta.lock().expect("session meta lock");
            guard.touch_read(Instant::now());
        }
    }

    async fn write_client_packet(&mut self, seq: u8, payload: Vec<u8>) -> RuntimeResult<()> {
        let raw = build_packet(seq, payload);
        self.client.write_all(&raw.encode()).await?;
        self.client_seq = seq.wrapping_add(1);
        let mut guard = self.meta.lock().expect("session meta lock");
        guard.touch_write(Instant::now());
        Ok(())
    }
}

async fn flush_output(link: &mut BackendLink) -> RuntimeResult<bool> {
    let out = link.proto.take_output();
    if out.is_empty() {
        return Ok(false);
    }
    link.stream.write_all(&out).await?;
    Ok(true)
}

async fn drive_until_established(link: &mut BackendLink) -> RuntimeResult<()> {
    loop {
        let mut buf = [0u8; 8192];
        let n = link.stream.read(&mut buf).await?;
        if n == 0 {
            return Err(RuntimeError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "backend closed during handshake",
            )));
        }
        let events = link.proto.on_readable(&buf[..n])?;
        flush_output(link).await?;
        for event in events {
            match event {
                BackendEvent::Failed(e) => return Err(RuntimeError::Proto(e)),
                BackendEvent::Established => return Ok(()),
                BackendEvent::NeedsTlsUpgrade => {
                    link.stream.upgrade(&link.endpoint.address).await?;
                    link.proto.tls_established()?;
                    flush_output(link).await?;
                }
                BackendEvent::ReplyReady(_) => {}
            }
        }
    }
}

/// Read backend bytes until one full reply completes. When `client` is
/// `Some`, raw bytes are forwarded to it verbatim as they arrive (the
/// transparent pass-through path for a client-issued command); when
/// `None`, bytes only drive protocol state (proxy-internal traffic such
/// as a reuse `COM_CHANGE_USER`, never client-visible).
async fn drive_backend_reply(
    link: &mut BackendLink,
    mut client: Option<&mut TcpStream>,
) -> RuntimeResult<ReplyMeta> {
    loop {
        let mut buf = [0u8; 8192];
        let n = link.stream.read(&mut buf).await?;
        if n == 0 {
            return Err(RuntimeError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "backend closed mid-reply",
            )));
        }
        if let Some(client) = client.as_deref_mut() {
            client.write_all(&buf[..n]).await?;
        }
        let events = link.proto.on_readable(&buf[..n])?;
        flush_output(link).await?;
        for event in events {
            match event {
                BackendEvent::Failed(e) => return Err(RuntimeError::Proto(e)),
                BackendEvent::ReplyReady(meta) => return Ok(meta),
                BackendEvent::Established => {}
                BackendEvent::NeedsTlsUpgrade => {
                    return Err(RuntimeError::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unexpected TLS upgrade request outside the initial handshake",
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_meta_touch_updates_timestamps_and_counter() {
        let mut meta = SessionMeta::fresh(Instant::now());
        let later = meta.last_read + Duration::from_secs(1);
        meta.touch_read(later);
        assert_eq!(meta.last_read, later);
        assert_eq!(meta.io_events, 1);
    }

    #[test]
    fn err_packet_carries_requested_code_and_sqlstate() {
        let pkt = build_err_packet(1045, "28000", "nope");
        assert_eq!(pkt[0], 0xff);
        assert_eq!(u16::from_le_bytes([pkt[1], pkt[2]]), 1045);
        assert_eq!(&pkt[4..9], b"28000");
    }
}
