//! MySQL/MariaDB wire protocol framing.
//!
//! A packet is `u24 length || u8 seq || payload[length]`. Payloads longer
//! than 2^24-1 bytes are split across a chain of max-size packets
//! terminated by one shorter (possibly empty) packet. This crate frames
//! and unframes that wire format and provides the primitive readers used
//! to walk a packet payload (length-encoded ints/strings, fixed bytes).
//!
//! Buffers are held in [`bytes::BytesMut`]/[`bytes::Bytes`] so that
//! splitting complete packets off the front of a receive buffer never
//! copies payload bytes.

mod error;
mod lenenc;
mod packet;
mod predicates;

pub use error::{WireError, WireResult};
pub use lenenc::{write_lenenc_int, write_lenenc_str, PayloadReader};
pub use packet::{build_packet, split_complete_packets, RawPacket, MAX_PACKET_PAYLOAD};
pub use predicates::{
    is_auth_switch_request, is_eof_packet, is_err_packet, is_local_infile, is_ok_packet,
    MYSQL_EOF_PACKET_MAX_LEN,
};
