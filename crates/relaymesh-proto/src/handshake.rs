//! Handshake v10 parsing (server → proxy) and handshake-response
//! building (proxy → server), per §6.

use relaymesh_wire::PayloadReader;

use crate::error::{ProtoError, ProtoResult};
use crate::scramble::Scramble;

/// The server's initial handshake packet, decoded.
#[derive(Debug, Clone)]
pub struct ServerHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub scramble: Scramble,
    pub capabilities: u32,
    pub charset: u8,
    pub status: u16,
    pub auth_plugin: Option<String>,
}

/// Parse a handshake-v10 packet payload.
pub fn parse_server_handshake(payload: &[u8]) -> ProtoResult<ServerHandshake> {
    let mut r = PayloadReader::new(payload);
    let protocol_version = r.u8()?;
    let server_version = String::from_utf8_lossy(r.nul_str()?).into_owned();
    let thread_id = r.u32_le()?;
    let scramble_1 = r.fixed(8)?;
    let _filler = r.u8()?;
    let cap_lo = r.u16_le()?;
    let charset = r.u8()?;
    let status = r.u16_le()?;
    let cap_hi = r.u16_le()?;
    let scramble_len = r.u8()?;
    let _reserved = r.fixed(10)?;

    let capabilities = (cap_lo as u32) | ((cap_hi as u32) << 16);

    let part2_len = std::cmp::max(13, scramble_len as usize - 8).min(r.remaining());
    let scramble_2_raw = r.fixed(part2_len)?;
    // scramble_2 is NUL-terminated in the wire form; trim a trailing NUL
    // if present before taking the first 12 bytes that complete the 20
    // total scramble bytes.
    let scramble_2 = &scramble_2_raw[..scramble_2_raw.len().min(13)];
    let scramble_2 = scramble_2.strip_suffix(&[0]).unwrap_or(scramble_2);

    let mut scramble = [0u8; 20];
    scramble[..8].copy_from_slice(scramble_1);
    let take = scramble_2.len().min(12);
    scramble[8..8 + take].copy_from_slice(&scramble_2[..take]);

    let auth_plugin = if !r.is_empty() {
        Some(String::from_utf8_lossy(r.nul_str().unwrap_or(r.rest())).into_owned())
    } else {
        None
    };

    if protocol_version != 0x0a {
        return Err(ProtoError::BadPacket(format!(
            "unsupported handshake protocol version {protocol_version}"
        )));
    }

    Ok(ServerHandshake {
        protocol_version,
        server_version,
        thread_id,
        scramble,
        capabilities,
        charset,
        status,
        auth_plugin,
    })
}

/// Inputs needed to build the proxy's handshake-response packet.
pub struct HandshakeResponseInputs<'a> {
    pub client_capabilities: u32,
    pub charset: u8,
    pub username: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin: &'a str,
    pub connect_attrs: Option<&'a [u8]>,
}

/// The max-packet size the proxy always advertises.
pub const MAX_PACKET_SIZE: u32 = 16_777_216;

/// Build the handshake-response payload the proxy sends to a backend.
pub fn build_handshake_response(inputs: &HandshakeResponseInputs<'_>) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&inputs.client_capabilities.to_le_bytes());
    out.extend_from_slice(&MAX_PACKET_SIZE.to_le_bytes());
    out.push(inputs.charset);
    out.extend_from_slice(&[0u8; 19]);
    // MariaDB extended-capabilities field occupies the slot a vanilla
    // MySQL client would reserve; the proxy does not negotiate any
    // extended (>=32nd bit) capability so it is always zero.
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(inputs.username.as_bytes());
    out.push(0);

    relaymesh_wire::write_lenenc_str(&mut out, inputs.auth_response);

    if let Some(db) = inputs.database {
        out.extend_from_slice(db.as_bytes());
        out.push(0);
    }
    out.extend_from_slice(inputs.auth_plugin.as_bytes());
    out.push(0);
    if let Some(attrs) = inputs.connect_attrs {
        out.extend_from_slice(attrs);
    }
    out
}

/// Build the truncated "SSLRequest" packet that precedes a TLS upgrade:
/// capability flags (with `CLIENT_SSL` set), max packet size, charset,
/// and filler bytes only — everything a handshake response carries
/// before the username, since nothing past this point may cross the
/// wire in cleartext once TLS has been requested.
pub fn build_ssl_request(client_capabilities: u32, charset: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    out.extend_from_slice(&client_capabilities.to_le_bytes());
    out.extend_from_slice(&MAX_PACKET_SIZE.to_le_bytes());
    out.push(charset);
    out.extend_from_slice(&[0u8; 19]);
    out.extend_from_slice(&[0u8; 4]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_handshake_bytes() -> Vec<u8> {
        let mut p = Vec::new();
        p.push(0x0a);
        p.extend_from_slice(b"5.5.5-10.6.0-MariaDB\0");
        p.extend_from_slice(&42u32.to_le_bytes());
        p.extend_from_slice(b"12345678"); // scramble_1
        p.push(0); // filler
        p.extend_from_slice(&0xa20fu16.to_le_bytes()); // cap lo
        p.push(45); // charset
        p.extend_from_slice(&0x0002u16.to_le_bytes()); // status
        p.extend_from_slice(&0x0000u16.to_le_bytes()); // cap hi
        p.push(21); // scramble len
        p.extend_from_slice(&[0u8; 10]);
        p.extend_from_slice(b"123456789012\0"); // scramble_2 + NUL
        p.extend_from_slice(b"mysql_native_password\0");
        p
    }

    #[test]
    fn parses_sample_handshake() {
        let hs = parse_server_handshake(&sample_handshake_bytes()).unwrap();
        assert_eq!(hs.protocol_version, 0x0a);
        assert_eq!(hs.server_version, "5.5.5-10.6.0-MariaDB");
        assert_eq!(hs.thread_id, 42);
        assert_eq!(&hs.scramble[..8], b"12345678");
        assert_eq!(&hs.scramble[8..20], b"123456789012");
        assert_eq!(hs.auth_plugin.as_deref(), Some("mysql_native_password"));
    }

    #[test]
    fn rejects_unsupported_protocol_version() {
        let mut bytes = sample_handshake_bytes();
        bytes[0] = 0x09;
        assert!(parse_server_handshake(&bytes).is_err());
    }

    #[test]
    fn builds_handshake_response_with_expected_layout() {
        let inputs = HandshakeResponseInputs {
            client_capabilities: 0x0000_a20f,
            charset: 45,
            username: "app",
            auth_response: &[1, 2, 3, 4],
            database: Some("mydb"),
            auth_plugin: "mysql_native_password",
            connect_attrs: None,
        };
        let resp = build_handshake_response(&inputs);
        assert_eq!(&resp[0..4], &0x0000_a20fu32.to_le_bytes());
        assert_eq!(&resp[4..8], &MAX_PACKET_SIZE.to_le_bytes());
        assert_eq!(resp[8], 45);
        assert!(resp.ends_with(b"mysql_native_password\0"));
    }

    #[test]
    fn ssl_request_carries_only_the_fixed_header() {
        let req = build_ssl_request(crate::capabilities::CLIENT_SSL, 45);
        assert_eq!(req.len(), 32);
        assert_eq!(
            u32::from_le_bytes(req[0..4].try_into().unwrap()),
            crate::capabilities::CLIENT_SSL
        );
        assert_eq!(&req[4..8], &MAX_PACKET_SIZE.to_le_bytes());
        assert_eq!(req[8], 45);
    }
}
