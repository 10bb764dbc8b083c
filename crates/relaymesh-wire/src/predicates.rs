//! Predicates on a packet's first payload byte (+ length), used by the
//! reply-state machine to classify a packet without fully decoding it.

/// Payload length at or below which a leading 0xfe byte is an EOF packet
/// rather than the length-encoded-int header of a column count, or an
/// AuthSwitchRequest during the handshake.
pub const MYSQL_EOF_PACKET_MAX_LEN: usize = 8;

pub fn is_ok_packet(payload: &[u8]) -> bool {
    matches!(payload.first(), Some(0x00))
}

pub fn is_err_packet(payload: &[u8]) -> bool {
    matches!(payload.first(), Some(0xff))
}

pub fn is_eof_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&0xfe) && payload.len() <= MYSQL_EOF_PACKET_MAX_LEN
}

pub fn is_local_infile(payload: &[u8]) -> bool {
    matches!(payload.first(), Some(0xfb))
}

/// An AuthSwitchRequest is tagged with the same leading byte as EOF
/// (0xfe) but carries a real payload (plugin name + auth data) that
/// makes it longer than a bare EOF packet can be.
pub fn is_auth_switch_request(payload: &[u8]) -> bool {
    payload.first() == Some(&0xfe) && payload.len() > MYSQL_EOF_PACKET_MAX_LEN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_err_local_infile() {
        assert!(is_ok_packet(&[0x00, 1, 2]));
        assert!(is_err_packet(&[0xff, 1, 2]));
        assert!(is_local_infile(&[0xfb, b'/', b't']));
    }

    #[test]
    fn eof_vs_auth_switch_request() {
        let eof = [0xfe, 0x00, 0x00, 0x02, 0x00];
        assert!(is_eof_packet(&eof));
        assert!(!is_auth_switch_request(&eof));

        let mut switch = vec![0xfe];
        switch.extend_from_slice(b"mysql_native_password\0");
        switch.extend_from_slice(&[0u8; 20]);
        assert!(is_auth_switch_request(&switch));
        assert!(!is_eof_packet(&switch));
    }
}
