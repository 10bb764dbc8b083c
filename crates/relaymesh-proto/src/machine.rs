//! The outer per-connection state machine: handshake, auth, connection
//! init, delayed-write flushing, and routing, per §4.2.

use std::collections::VecDeque;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use relaymesh_wire::{split_complete_packets, RawPacket, MAX_PACKET_PAYLOAD};
use tracing::{debug, warn};

use crate::capabilities::{negotiate_client_capabilities, NegotiationInputs};
use crate::command::{Command, COM_CHANGE_USER, COM_PING, COM_QUERY};
use crate::error::{ProtoError, ProtoResult};
use crate::handshake::{
    build_handshake_response, build_ssl_request, parse_server_handshake, HandshakeResponseInputs,
    ServerHandshake,
};
use crate::reply::{ReplyMeta, ReplyState, ReplyTracker};
use crate::scramble::{auth_switch_response, build_change_user_packet, native_password_response};

/// Outer states a backend connection walks through once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoState {
    Handshaking,
    /// SSLRequest has been queued; waiting for the caller to complete a
    /// TLS handshake on the raw socket and report back via
    /// `tls_established`. No further plaintext bytes are expected from
    /// the backend in this state.
    StartSsl,
    Authenticating,
    ConnectionInit,
    SendDelayQ,
    Routing,
    Failed,
}

/// Credentials the proxy authenticates to a backend with.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password_sha1: [u8; 20],
    pub database: Option<String>,
    pub charset: u8,
}

/// Source/destination pair for an optional PROXY protocol v1 header.
#[derive(Debug, Clone, Copy)]
pub struct ProxyHeader {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl ProxyHeader {
    fn encode(&self) -> Vec<u8> {
        let proto = match (self.src, self.dst) {
            (SocketAddr::V4(_), SocketAddr::V4(_)) => "TCP4",
            _ => "TCP6",
        };
        format!(
            "PROXY {proto} {} {} {} {}\r\n",
            self.src.ip(),
            self.dst.ip(),
            self.src.port(),
            self.dst.port(),
        )
        .into_bytes()
    }
}

/// Static configuration for one backend connection's protocol machine.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub credentials: Credentials,
    pub want_ssl: bool,
    pub want_session_track: bool,
    pub client_capabilities: u32,
    pub init_queries: Vec<String>,
    pub proxy_header: Option<ProxyHeader>,
}

/// How a command's reply should be handled once it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDisposition {
    /// Buffer the full reply and hand it to the caller once complete.
    Collect,
    /// Drop the reply; `ignore_replies` tracks it until it finishes.
    Ignore,
}

/// Output of driving the state machine forward by one `on_readable`.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// A collected reply finished.
    ReplyReady(ReplyMeta),
    /// Handshake, auth and connection-init all finished; ordinary
    /// commands are now being routed.
    Established,
    /// An SSLRequest has been queued for write; the caller must flush
    /// it, then wrap the raw socket in a TLS session and call
    /// `tls_established` once that handshake completes.
    NeedsTlsUpgrade,
    /// The connection failed and must be torn down.
    Failed(ProtoError),
}

/// Drives one backend connection's protocol end to end: framing,
/// handshake, authentication, connection-init queries, and the
/// reply-state sub-machine once routing normal traffic.
pub struct BackendProto {
    state: ProtoState,
    options: ConnectionOptions,
    handshake: Option<ServerHandshake>,
    negotiated_capabilities: u32,
    seq: u8,
    reply: ReplyTracker,
    current_command: Command,
    current_disposition: ReplyDisposition,
    ignore_replies: u32,
    changing_user: bool,
    delayed_queue: VecDeque<(Vec<u8>, ReplyDisposition)>,
    init_query_index: usize,
    skip_next: bool,
    out: BytesMut,
    incoming: BytesMut,
}

impl BackendProto {
    pub fn new(options: ConnectionOptions) -> Self {
        let session_track_capable = options.want_session_track;
        Self {
            state: ProtoState::Handshaking,
            options,
            handshake: None,
            negotiated_capabilities: 0,
            seq: 0,
            reply: ReplyTracker::new(session_track_capable),
            current_command: Command::Other(0),
            current_disposition: ReplyDisposition::Collect,
            ignore_replies: 0,
            changing_user: false,
            delayed_queue: VecDeque::new(),
            init_query_index: 0,
            skip_next: false,
            out: BytesMut::new(),
            incoming: BytesMut::new(),
        }
    }

    pub fn state(&self) -> ProtoState {
        self.state
    }

    /// Drain bytes queued for the socket since the last call.
    pub fn take_output(&mut self) -> Bytes {
        self.out.split().freeze()
    }

    /// Optionally emit the PROXY-protocol header, then enter the
    /// handshake sub-FSM.
    pub fn init_connection(&mut self) -> ProtoResult<()> {
        if let Some(header) = &self.options.proxy_header {
            self.out.extend_from_slice(&header.encode());
        }
        self.state = ProtoState::Handshaking;
        Ok(())
    }

    pub fn established(&self) -> bool {
        self.state == ProtoState::Routing && self.ignore_replies == 0 && self.reply.is_done()
    }

    /// Accept a client command packet (without the 4-byte framing header).
    pub fn write(&mut self, cmd_packet: &[u8], disposition: ReplyDisposition) -> ProtoResult<()> {
        match self.state {
            ProtoState::Routing => self.write_routing(cmd_packet, disposition),
            ProtoState::Failed => Err(ProtoError::Unavailable("connection failed".into())),
            _ => {
                self.delayed_queue
                    .push_back((cmd_packet.to_vec(), disposition));
                Ok(())
            }
        }
    }

    fn write_routing(&mut self, cmd_packet: &[u8], disposition: ReplyDisposition) -> ProtoResult<()> {
        if cmd_packet.is_empty() {
            return Err(ProtoError::BadPacket("empty command packet".into()));
        }
        if cmd_packet[0] == COM_CHANGE_USER {
            return self.send_change_user();
        }
        let flag_byte = cmd_packet.get(5).copied();
        let command = Command::decode(cmd_packet[0], flag_byte);
        self.begin_command(command, disposition);
        self.seq = 0;
        self.frame_and_queue_write(cmd_packet);
        Ok(())
    }

    fn begin_command(&mut self, command: Command, disposition: ReplyDisposition) {
        self.current_command = command;
        self.current_disposition = disposition;
        self.reply.set_changing_user(false);
        self.reply.begin(command);
        if disposition == ReplyDisposition::Ignore {
            self.ignore_replies += 1;
        }
    }

    fn send_change_user(&mut self) -> ProtoResult<()> {
        let scramble = self
            .handshake
            .as_ref()
            .map(|h| h.scramble)
            .ok_or_else(|| ProtoError::Unavailable("handshake not complete".into()))?;
        let packet = build_change_user_packet(
            &self.options.credentials.username,
            &self.options.credentials.password_sha1,
            &scramble,
            self.options.credentials.database.as_deref(),
            self.options.credentials.charset as u16,
            "mysql_native_password",
        );
        self.changing_user = true;
        self.begin_command(Command::Other(COM_CHANGE_USER), ReplyDisposition::Collect);
        self.reply.set_changing_user(true);
        self.seq = 0;
        self.frame_and_queue_write(&packet);
        Ok(())
    }

    /// Writes a reserved ignorable ping, as long as no reply is already
    /// in flight.
    pub fn ping(&mut self) -> ProtoResult<()> {
        if self.state != ProtoState::Routing {
            return Err(ProtoError::Unavailable("connection not routing".into()));
        }
        if *self.reply.state() != ReplyState::Done {
            return Ok(());
        }
        self.begin_command(Command::Other(COM_PING), ReplyDisposition::Ignore);
        self.seq = 0;
        self.frame_and_queue_write(&[COM_PING]);
        Ok(())
    }

    /// Swap in a new client's credentials for a pooled, reused
    /// connection. Always issues `COM_CHANGE_USER` so any session-local
    /// state (temp tables, user vars, locks) left by the prior occupant
    /// is reset before the connection is handed back out.
    pub fn reuse(&mut self, credentials: Credentials) -> ProtoResult<Vec<BackendEvent>> {
        if self.state != ProtoState::Routing {
            return Err(ProtoError::Unavailable("connection not established".into()));
        }
        self.options.credentials = credentials;
        self.send_change_user()?;
        Ok(Vec::new())
    }

    fn frame_and_queue_write(&mut self, payload: &[u8]) {
        if payload.is_empty() {
            let pkt = RawPacket {
                seq: self.next_seq(),
                payload: Bytes::new(),
            };
            self.out.extend_from_slice(&pkt.encode());
            return;
        }
        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + MAX_PACKET_PAYLOAD).min(payload.len());
            let chunk = Bytes::copy_from_slice(&payload[offset..end]);
            let pkt = RawPacket {
                seq: self.next_seq(),
                payload: chunk,
            };
            self.out.extend_from_slice(&pkt.encode());
            offset = end;
        }
    }

    fn next_seq(&mut self) -> u8 {
        let s = self.seq;
        self.seq = self.seq.wrapping_add(1);
        s
    }

    /// Feed newly-received bytes through the state machine, returning
    /// any events raised along the way.
    pub fn on_readable(&mut self, data: &[u8]) -> ProtoResult<Vec<BackendEvent>> {
        self.incoming.extend_from_slice(data);
        let mut events = Vec::new();
        loop {
            let packets = split_complete_packets(&mut self.incoming);
            if packets.is_empty() {
                break;
            }
            for packet in packets {
                self.seq = packet.seq.wrapping_add(1);
                if let Some(event) = self.drive(&packet)? {
                    let is_failed = matches!(event, BackendEvent::Failed(_));
                    if let BackendEvent::Failed(ref e) = event {
                        warn!(error = %e, "backend connection failed");
                    }
                    events.push(event);
                    if is_failed {
                        self.state = ProtoState::Failed;
                        return Ok(events);
                    }
                }
            }
            if self.state != ProtoState::Routing {
                // Non-routing states each consume exactly the packets
                // relevant to their substep; re-loop in case entering
                // the next state produced more structural packets
                // already buffered (e.g. pipelined init-query replies).
                continue;
            } else {
                break;
            }
        }
        Ok(events)
    }

    fn drive(&mut self, packet: &RawPacket) -> ProtoResult<Option<BackendEvent>> {
        match self.state {
            ProtoState::Handshaking => self.drive_handshaking(packet),
            ProtoState::StartSsl => {
                // Entered only by queuing the SSLRequest and raising
                // `NeedsTlsUpgrade`; the caller must finish the TLS
                // handshake out-of-band before any more bytes arrive.
                Ok(None)
            }
            ProtoState::Authenticating => self.drive_authenticating(packet),
            ProtoState::ConnectionInit => self.drive_connection_init(packet),
            ProtoState::SendDelayQ => {
                // Entered programmatically; no packets expected here.
                Ok(None)
            }
            ProtoState::Routing => self.drive_routing(packet),
            ProtoState::Failed => Ok(None),
        }
    }

    fn drive_handshaking(&mut self, packet: &RawPacket) -> ProtoResult<Option<BackendEvent>> {
        let handshake = match parse_server_handshake(&packet.payload) {
            Ok(hs) => hs,
            Err(e) => return Ok(Some(BackendEvent::Failed(e))),
        };

        let negotiated = negotiate_client_capabilities(NegotiationInputs {
            client_caps: self.options.client_capabilities,
            want_ssl: self.options.want_ssl,
            want_session_track: self.options.want_session_track,
            has_initial_db: self.options.credentials.database.is_some(),
        });
        self.negotiated_capabilities = negotiated;
        debug!(
            server_version = %handshake.server_version,
            thread_id = handshake.thread_id,
            "backend handshake received"
        );
        self.handshake = Some(handshake);

        if self.options.want_ssl && negotiated & crate::capabilities::CLIENT_SSL != 0 {
            let request = build_ssl_request(negotiated, self.options.credentials.charset);
            self.frame_and_queue_write(&request);
            self.state = ProtoState::StartSsl;
            return Ok(Some(BackendEvent::NeedsTlsUpgrade));
        }

        self.queue_handshake_response()?;
        self.state = ProtoState::Authenticating;
        Ok(None)
    }

    /// Called by the caller once it has wrapped the raw socket in a TLS
    /// session following a `NeedsTlsUpgrade` event. Builds and queues
    /// the real handshake response, which the caller's next flush will
    /// write through the now-encrypted stream.
    pub fn tls_established(&mut self) -> ProtoResult<()> {
        if self.state != ProtoState::StartSsl {
            return Err(ProtoError::Unavailable("not awaiting a TLS upgrade".into()));
        }
        self.queue_handshake_response()?;
        self.state = ProtoState::Authenticating;
        Ok(())
    }

    fn queue_handshake_response(&mut self) -> ProtoResult<()> {
        let handshake = self
            .handshake
            .as_ref()
            .ok_or_else(|| ProtoError::Unavailable("handshake not complete".into()))?;
        let password_sha1 = self.options.credentials.password_sha1;
        let auth_response = native_password_response(&handshake.scramble, &password_sha1);

        let inputs = HandshakeResponseInputs {
            client_capabilities: self.negotiated_capabilities,
            charset: self.options.credentials.charset,
            username: &self.options.credentials.username,
            auth_response: &auth_response,
            database: self.options.credentials.database.as_deref(),
            auth_plugin: "mysql_native_password",
            connect_attrs: None,
        };
        let response = build_handshake_response(&inputs);
        self.frame_and_queue_write(&response);
        Ok(())
    }

    fn drive_authenticating(&mut self, packet: &RawPacket) -> ProtoResult<Option<BackendEvent>> {
        use relaymesh_wire::{is_auth_switch_request, is_err_packet, is_ok_packet, PayloadReader};

        if is_ok_packet(&packet.payload) {
            self.state = ProtoState::ConnectionInit;
            return self.enter_connection_init();
        }
        if is_err_packet(&packet.payload) {
            let mut r = PayloadReader::new(&packet.payload);
            let _header = r.u8()?;
            let code = r.u16_le()?;
            let _marker = r.u8().unwrap_or(b'#');
            let sqlstate = String::from_utf8_lossy(r.fixed(5).unwrap_or(&[])).into_owned();
            let message = String::from_utf8_lossy(r.rest()).into_owned();
            return Ok(Some(BackendEvent::Failed(ProtoError::AuthFailed {
                code,
                sqlstate,
                message,
            })));
        }
        if is_auth_switch_request(&packet.payload) {
            let password_sha1 = self.options.credentials.password_sha1;
            let response = Self::auth_switch_reply(&packet.payload, &password_sha1)?;
            self.frame_and_queue_write(&response);
            return Ok(None);
        }
        Ok(Some(BackendEvent::Failed(ProtoError::BadPacket(
            "unexpected packet during authentication".into(),
        ))))
    }

    /// Builds the 20-byte native-password response to an AuthSwitchRequest,
    /// XORing the stored client-side hash against the embedded scramble.
    fn auth_switch_reply(payload: &[u8], password_sha1: &[u8; 20]) -> ProtoResult<Vec<u8>> {
        use relaymesh_wire::PayloadReader;

        let mut r = PayloadReader::new(payload);
        let _header = r.u8()?;
        let _plugin = r.nul_str().unwrap_or(b"mysql_native_password");
        let scramble_bytes = r.rest();
        let mut new_scramble = [0u8; 20];
        let take = scramble_bytes.len().min(20);
        new_scramble[..take].copy_from_slice(&scramble_bytes[..take]);
        Ok(auth_switch_response(&new_scramble, password_sha1))
    }

    fn enter_connection_init(&mut self) -> ProtoResult<Option<BackendEvent>> {
        self.init_query_index = 0;
        if self.options.init_queries.is_empty() {
            return self.enter_send_delay_q();
        }
        self.seq = 0;
        for query in self.options.init_queries.clone() {
            let mut payload = vec![COM_QUERY];
            payload.extend_from_slice(query.as_bytes());
            self.frame_and_queue_write(&payload);
            self.seq = 0;
        }
        Ok(None)
    }

    fn drive_connection_init(&mut self, packet: &RawPacket) -> ProtoResult<Option<BackendEvent>> {
        use relaymesh_wire::{is_err_packet, is_ok_packet, PayloadReader};

        if is_ok_packet(&packet.payload) {
            self.init_query_index += 1;
            if self.init_query_index >= self.options.init_queries.len() {
                self.state = ProtoState::SendDelayQ;
                return self.enter_send_delay_q();
            }
            return Ok(None);
        }
        if is_err_packet(&packet.payload) {
            let mut r = PayloadReader::new(&packet.payload);
            let _header = r.u8()?;
            let code = r.u16_le()?;
            let _marker = r.u8().unwrap_or(b'#');
            let message = String::from_utf8_lossy(r.rest()).into_owned();
            return Ok(Some(BackendEvent::Failed(ProtoError::InitQueryFailed {
                index: self.init_query_index,
                code,
                message,
            })));
        }
        Ok(Some(BackendEvent::Failed(ProtoError::InitQueryFailed {
            index: self.init_query_index,
            code: 0,
            message: "unexpected resultset from init query".into(),
        })))
    }

    fn enter_send_delay_q(&mut self) -> ProtoResult<Option<BackendEvent>> {
        self.state = ProtoState::SendDelayQ;
        let queued: Vec<_> = self.delayed_queue.drain(..).collect();
        let last = queued.len().saturating_sub(1);
        for (idx, (cmd_packet, disposition)) in queued.into_iter().enumerate() {
            let disposition = if idx < last {
                ReplyDisposition::Ignore
            } else {
                disposition
            };
            self.state = ProtoState::Routing;
            self.write_routing(&cmd_packet, disposition)?;
        }
        self.state = ProtoState::Routing;
        debug!("backend connection established");
        Ok(Some(BackendEvent::Established))
    }

    fn drive_routing(&mut self, packet: &RawPacket) -> ProtoResult<Option<BackendEvent>> {
        use relaymesh_wire::is_auth_switch_request;

        if self.skip_next {
            self.skip_next = packet.is_continued();
            return Ok(None);
        }
        if packet.is_continued() {
            self.skip_next = true;
            return Ok(None);
        }

        if self.changing_user && is_auth_switch_request(&packet.payload) {
            let password_sha1 = self.options.credentials.password_sha1;
            let response = Self::auth_switch_reply(&packet.payload, &password_sha1)?;
            self.frame_and_queue_write(&response);
            return Ok(None);
        }

        self.reply
            .process_one_packet(&packet.payload, self.current_command)?;

        if *self.reply.state() != ReplyState::Done {
            return Ok(None);
        }

        if self.changing_user {
            self.changing_user = false;
            self.reply.set_changing_user(false);
        }

        match self.current_disposition {
            ReplyDisposition::Ignore => {
                self.ignore_replies = self.ignore_replies.saturating_sub(1);
                Ok(None)
            }
            ReplyDisposition::Collect => Ok(Some(BackendEvent::ReplyReady(self.reply.meta().clone()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(init_queries: Vec<&str>) -> ConnectionOptions {
        ConnectionOptions {
            credentials: Credentials {
                username: "app".into(),
                password_sha1: crate::scramble::password_sha1(b"hunter2"),
                database: Some("mydb".into()),
                charset: 45,
            },
            want_ssl: false,
            want_session_track: false,
            client_capabilities: crate::capabilities::negotiate_client_capabilities(
                Default::default(),
            ),
            init_queries: init_queries.into_iter().map(String::from).collect(),
            proxy_header: None,
        }
    }

    fn raw_packet(seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut v = Vec::new();
        let len = payload.len() as u32;
        v.extend_from_slice(&len.to_le_bytes()[..3]);
        v.push(seq);
        v.extend_from_slice(payload);
        v
    }

    fn sample_handshake() -> Vec<u8> {
        let mut p = Vec::new();
        p.push(0x0a);
        p.extend_from_slice(b"10.6.0-MariaDB\0");
        p.extend_from_slice(&1u32.to_le_bytes());
        p.extend_from_slice(b"12345678");
        p.push(0);
        p.extend_from_slice(&0xa20fu16.to_le_bytes());
        p.push(45);
        p.extend_from_slice(&0x0002u16.to_le_bytes());
        p.extend_from_slice(&0x0000u16.to_le_bytes());
        p.push(21);
        p.extend_from_slice(&[0u8; 10]);
        p.extend_from_slice(b"123456789012\0");
        p.extend_from_slice(b"mysql_native_password\0");
        p
    }

    #[test]
    fn full_connect_sequence_reaches_routing() {
        let mut proto = BackendProto::new(options(vec!["SET NAMES utf8mb4"]));
        proto.init_connection().unwrap();

        let events = proto
            .on_readable(&raw_packet(0, &sample_handshake()))
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(proto.state(), ProtoState::Authenticating);
        assert!(!proto.take_output().is_empty());

        let events = proto.on_readable(&raw_packet(2, &[0x00, 0, 0, 0x02, 0, 0])).unwrap();
        assert!(events.is_empty());
        assert_eq!(proto.state(), ProtoState::ConnectionInit);
        assert!(!proto.take_output().is_empty());

        let events = proto
            .on_readable(&raw_packet(1, &[0x00, 0, 0, 0x02, 0, 0]))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], BackendEvent::Established));
        assert_eq!(proto.state(), ProtoState::Routing);
        assert!(proto.established());
    }

    #[test]
    fn auth_failure_yields_failed_event() {
        let mut proto = BackendProto::new(options(vec![]));
        proto.init_connection().unwrap();
        proto
            .on_readable(&raw_packet(0, &sample_handshake()))
            .unwrap();

        let mut err = vec![0xff];
        err.extend_from_slice(&1045u16.to_le_bytes());
        err.push(b'#');
        err.extend_from_slice(b"28000");
        err.extend_from_slice(b"Access denied");

        let events = proto.on_readable(&raw_packet(2, &err)).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], BackendEvent::Failed(ProtoError::AuthFailed { .. })));
        assert_eq!(proto.state(), ProtoState::Failed);
    }

    #[test]
    fn write_before_routing_is_delayed() {
        let mut proto = BackendProto::new(options(vec![]));
        proto.init_connection().unwrap();
        proto
            .write(&[COM_QUERY, b'x'], ReplyDisposition::Collect)
            .unwrap();
        assert_eq!(proto.delayed_queue.len(), 1);
    }

    #[test]
    fn ping_is_ignored_and_clears_ignore_replies() {
        let mut proto = BackendProto::new(options(vec![]));
        proto.init_connection().unwrap();
        proto
            .on_readable(&raw_packet(0, &sample_handshake()))
            .unwrap();
        proto
            .on_readable(&raw_packet(2, &[0x00, 0, 0, 0x02, 0, 0]))
            .unwrap();

        proto.ping().unwrap();
        assert_eq!(proto.ignore_replies, 1);
        assert!(!proto.established());

        let events = proto
            .on_readable(&raw_packet(0, &[0x00, 0, 0, 0x02, 0, 0, 0]))
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(proto.ignore_replies, 0);
        assert!(proto.established());
    }
}
