//! A minimal MySQL text-protocol client used only to talk to a cluster
//! hub node: handshake, run one query, decode its resultset. This is
//! deliberately independent of `relaymesh_proto::BackendProto` — that
//! state machine drives the proxy's own client-facing routing lifecycle
//! (delay queue, reply tracking for pass-through), whereas a hub query
//! needs the actual row values, decoded once and returned.

use std::collections::VecDeque;

use relaymesh_proto::{
    build_handshake_response, native_password_response, parse_server_handshake,
    HandshakeResponseInputs, ServerHandshake, CLIENT_LONG_PASSWORD, CLIENT_PROTOCOL_41,
    CLIENT_SECURE_CONNECTION, CLIENT_TRANSACTIONS, COM_QUERY,
};
use relaymesh_wire::{
    build_packet, is_eof_packet, is_err_packet, is_ok_packet, split_complete_packets,
    PayloadReader, RawPacket,
};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{ClusterError, ClusterResult};

const HUB_CLIENT_CAPS: u32 =
    CLIENT_LONG_PASSWORD | CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_TRANSACTIONS;

/// A decoded resultset row: one entry per column, `None` for SQL NULL.
pub type Row = Vec<Option<Vec<u8>>>;

struct PacketStream {
    stream: TcpStream,
    buf: BytesMut,
    pending: VecDeque<RawPacket>,
}

impl PacketStream {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(4096),
            pending: VecDeque::new(),
        }
    }

    async fn next_packet(&mut self) -> ClusterResult<RawPacket> {
        loop {
            if let Some(p) = self.pending.pop_front() {
                return Ok(p);
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(ClusterError::ConnectionClosed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
            self.pending.extend(split_complete_packets(&mut self.buf));
        }
    }

    async fn write_packet(&mut self, seq: u8, payload: Vec<u8>) -> ClusterResult<()> {
        let raw = build_packet(seq, payload);
        self.stream.write_all(&raw.encode()).await?;
        Ok(())
    }
}

/// A short-lived connection to a hub node: exists only for the
/// duration of one membership refresh cycle.
pub struct HubClient {
    stream: PacketStream,
}

impl HubClient {
    /// Connect and authenticate against a hub candidate.
    pub async fn connect(
        addr: &str,
        username: &str,
        password_sha1: &[u8; 20],
    ) -> ClusterResult<Self> {
        let tcp = TcpStream::connect(addr).await?;
        let mut stream = PacketStream::new(tcp);

        let handshake_packet = stream.next_packet().await?;
        let handshake: ServerHandshake = parse_server_handshake(&handshake_packet.payload)?;

        let auth_response = native_password_response(&handshake.scramble, password_sha1);
        let response = build_handshake_response(&HandshakeResponseInputs {
            client_capabilities: HUB_CLIENT_CAPS,
            charset: handshake.charset,
            username,
            auth_response: &auth_response,
            database: None,
            auth_plugin: "mysql_native_password",
            connect_attrs: None,
        });
        stream
            .write_packet(handshake_packet.seq.wrapping_add(1), response)
            .await?;

        let reply = stream.next_packet().await?;
        if is_err_packet(&reply.payload) {
            return Err(ClusterError::AuthFailed(describe_err(&reply.payload)));
        }
        if !is_ok_packet(&reply.payload) {
            return Err(ClusterError::BadResponse(
                "expected OK packet after handshake response".into(),
            ));
        }

        Ok(Self { stream })
    }

    /// Run one SQL statement and return its decoded rows. Statements
    /// with no resultset (DDL, `SET`, ...) return an empty row list.
    pub async fn query(&mut self, sql: &str) -> ClusterResult<Vec<Row>> {
        let mut payload = Vec::with_capacity(sql.len() + 1);
        payload.push(COM_QUERY);
        payload.extend_from_slice(sql.as_bytes());
        self.stream.write_packet(0, payload).await?;

        let first = self.stream.next_packet().await?;
        if is_err_packet(&first.payload) {
            return Err(ClusterError::QueryFailed(describe_err(&first.payload)));
        }
        if is_ok_packet(&first.payload) {
            return Ok(Vec::new());
        }

        let mut r = PayloadReader::new(&first.payload);
        let column_count = r.lenenc_int()? as usize;

        for _ in 0..column_count {
            let packet = self.stream.next_packet().await?;
            if is_err_packet(&packet.payload) {
                return Err(ClusterError::QueryFailed(describe_err(&packet.payload)));
            }
        }

        let eof = self.stream.next_packet().await?;
        if !is_eof_packet(&eof.payload) {
            return Err(ClusterError::BadResponse(
                "expected EOF after column definitions".into(),
            ));
        }

        let mut rows = Vec::new();
        loop {
            let packet = self.stream.next_packet().await?;
            if is_eof_packet(&packet.payload) {
                break;
            }
            if is_err_packet(&packet.payload) {
                return Err(ClusterError::QueryFailed(describe_err(&packet.payload)));
            }
            rows.push(decode_row(&packet.payload, column_count)?);
        }

        Ok(rows)
    }
}

fn decode_row(payload: &[u8], column_count: usize) -> ClusterResult<Row> {
    let mut r = PayloadReader::new(payload);
    let mut row = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        if r.peek_u8()? == 0xfb {
            r.u8()?;
            row.push(None);
        } else {
            row.push(Some(r.lenenc_str()?.to_vec()));
        }
    }
    Ok(row)
}

fn describe_err(payload: &[u8]) -> String {
    // ERR packet: 0xff, u16 error code, optional '#' + 5-byte sqlstate, message.
    let mut r = PayloadReader::new(payload);
    let _ = r.u8();
    let code = r.u16_le().unwrap_or(0);
    if r.peek_u8() == Ok(b'#') {
        let _ = r.fixed(6);
    }
    let message = String::from_utf8_lossy(r.rest()).into_owned();
    format!("({code}) {message}")
}
