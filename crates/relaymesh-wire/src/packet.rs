//! Packet framing: splitting complete packets off a receive buffer.

use bytes::{Buf, Bytes, BytesMut};

/// A payload length of exactly this value means the logical packet
/// continues in the next physical packet.
pub const MAX_PACKET_PAYLOAD: usize = 0x00FF_FFFF;

/// One physical wire packet: a sequence number and its raw payload.
///
/// A logical response may span several `RawPacket`s when the payload
/// exceeds [`MAX_PACKET_PAYLOAD`]; the reply-state machine (in
/// `relaymesh-proto`) is responsible for treating max-size packets as
/// continuations rather than structural boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub seq: u8,
    pub payload: Bytes,
}

impl RawPacket {
    /// Whether this physical packet's payload is exactly max-size, i.e.
    /// another physical packet continues the same logical packet.
    pub fn is_continued(&self) -> bool {
        self.payload.len() == MAX_PACKET_PAYLOAD
    }

    /// Re-encode this packet back into `u24 length || u8 seq || payload`.
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(4 + self.payload.len());
        let len = self.payload.len() as u32;
        out.extend_from_slice(&len.to_le_bytes()[..3]);
        out.extend_from_slice(&[self.seq]);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Build a single raw packet from a sequence id and payload bytes.
pub fn build_packet(seq: u8, payload: impl Into<Bytes>) -> RawPacket {
    RawPacket {
        seq,
        payload: payload.into(),
    }
}

/// Peek the header at `buf[offset..]` without consuming anything.
/// Returns `(payload_len, total_len)` if a full header is present.
fn peek_header(buf: &[u8], offset: usize) -> Option<(usize, usize)> {
    if buf.len() < offset + 4 {
        return None;
    }
    let len = (buf[offset] as usize) | ((buf[offset + 1] as usize) << 8) | ((buf[offset + 2] as usize) << 16);
    Some((len, offset + 4 + len))
}

/// Find the end offset of the next *whole* chain of physical packets
/// (one packet, or a max-size run terminated by a short one), if the
/// whole chain is present in `buf`. Returns `None` if more bytes are
/// needed before any further packet can be extracted.
fn scan_chain_end(buf: &[u8]) -> Option<usize> {
    let mut offset = 0usize;
    loop {
        let (len, end) = peek_header(buf, offset)?;
        if buf.len() < end {
            return None;
        }
        offset = end;
        if len != MAX_PACKET_PAYLOAD {
            return Some(offset);
        }
        // Continuation: keep scanning for the terminating short packet.
    }
}

/// Slice off all wholly-contained packets from the front of `buf`.
///
/// If the first packet begins a large-packet chain, the whole chain
/// (up to and including the terminating short packet) is required to be
/// present before any of it is returned — a partially-received chain is
/// left untouched in `buf` for the next read to complete.
///
/// Splitting is zero-copy: `BytesMut::split_to` / `Bytes::split_off` only
/// adjust the shared buffer's refcount and offsets.
pub fn split_complete_packets(buf: &mut BytesMut) -> Vec<RawPacket> {
    let mut out = Vec::new();
    loop {
        let Some(chain_end) = scan_chain_end(buf) else {
            break;
        };
        let mut chain = buf.split_to(chain_end);
        while !chain.is_empty() {
            let len = (chain[0] as usize) | ((chain[1] as usize) << 8) | ((chain[2] as usize) << 16);
            let seq = chain[3];
            chain.advance(4);
            let payload = chain.split_to(len).freeze();
            out.push(RawPacket { seq, payload });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_raw(seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut v = Vec::new();
        let len = payload.len() as u32;
        v.extend_from_slice(&len.to_le_bytes()[..3]);
        v.push(seq);
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn single_small_packet() {
        let mut buf = BytesMut::from(&encode_raw(0, b"hello")[..]);
        let packets = split_complete_packets(&mut buf);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].seq, 0);
        assert_eq!(&packets[0].payload[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn incomplete_packet_is_left_alone() {
        let full = encode_raw(0, b"hello world");
        let mut buf = BytesMut::from(&full[..full.len() - 2]);
        let packets = split_complete_packets(&mut buf);
        assert!(packets.is_empty());
        assert_eq!(buf.len(), full.len() - 2);
    }

    #[test]
    fn two_packets_back_to_back() {
        let mut bytes = encode_raw(0, b"a");
        bytes.extend(encode_raw(1, b"bb"));
        let mut buf = BytesMut::from(&bytes[..]);
        let packets = split_complete_packets(&mut buf);
        assert_eq!(packets.len(), 2);
        assert_eq!(&packets[0].payload[..], b"a");
        assert_eq!(&packets[1].payload[..], b"bb");
    }

    #[test]
    fn large_packet_chain_requires_terminator_present() {
        let big_payload = vec![0xABu8; MAX_PACKET_PAYLOAD];
        let mut bytes = encode_raw(0, &big_payload);
        // Terminator not yet arrived: nothing should be yielded.
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(split_complete_packets(&mut buf).is_empty());

        // Now the short terminator packet arrives.
        bytes.extend(encode_raw(1, b"tail"));
        let mut buf = BytesMut::from(&bytes[..]);
        let packets = split_complete_packets(&mut buf);
        assert_eq!(packets.len(), 2);
        assert!(packets[0].is_continued());
        assert_eq!(packets[0].payload.len(), MAX_PACKET_PAYLOAD);
        assert_eq!(&packets[1].payload[..], b"tail");
    }

    #[test]
    fn large_packet_chain_with_zero_length_terminator() {
        let big_payload = vec![0x11u8; MAX_PACKET_PAYLOAD];
        let mut bytes = encode_raw(0, &big_payload);
        bytes.extend(encode_raw(1, b""));
        let mut buf = BytesMut::from(&bytes[..]);
        let packets = split_complete_packets(&mut buf);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[1].payload.len(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn roundtrip_encode_matches_original_bytes() {
        let original = encode_raw(7, b"SELECT 1");
        let mut buf = BytesMut::from(&original[..]);
        let packets = split_complete_packets(&mut buf);
        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0].encode()[..], &original[..]);
    }
}
