//! `mysql_native_password` hashing and the `COM_CHANGE_USER` token
//! derivation described in §4.2.

use sha1::{Digest, Sha1};

/// A 20-byte nonce the server sends in its handshake.
pub type Scramble = [u8; 20];

fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn xor20(a: &[u8; 20], b: &[u8; 20]) -> [u8; 20] {
    let mut out = [0u8; 20];
    for i in 0..20 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// `mysql_native_password` response: `SHA1(password)` XOR
/// `SHA1(scramble || SHA1(SHA1(password)))`.
///
/// `password_sha1` is `SHA1(password)`, the client-side hash the proxy
/// stores instead of the plaintext password.
pub fn native_password_response(scramble: &Scramble, password_sha1: &[u8; 20]) -> [u8; 20] {
    let double_hash = sha1(password_sha1);
    let mut msg = Vec::with_capacity(20 + double_hash.len());
    msg.extend_from_slice(scramble);
    msg.extend_from_slice(&double_hash);
    let inner = sha1(&msg);
    xor20(password_sha1, &inner)
}

/// Derive `SHA1(password)` from a plaintext password, the form stored
/// for later scramble-dependent (re-)authentication.
pub fn password_sha1(password: &[u8]) -> [u8; 20] {
    sha1(password)
}

/// Build the `COM_CHANGE_USER` command payload (without the 4-byte
/// packet header): `0x11 | username\0 | token_len u8 | token | db\0 |
/// charset u16 | plugin\0 | connect_attrs`.
pub fn build_change_user_packet(
    username: &str,
    password_sha1: &[u8; 20],
    scramble: &Scramble,
    database: Option<&str>,
    charset: u16,
    plugin: &str,
) -> Vec<u8> {
    let token = native_password_response(scramble, password_sha1);
    let mut out = Vec::with_capacity(64);
    out.push(0x11);
    out.extend_from_slice(username.as_bytes());
    out.push(0);
    out.push(token.len() as u8);
    out.extend_from_slice(&token);
    if let Some(db) = database {
        out.extend_from_slice(db.as_bytes());
    }
    out.push(0);
    out.extend_from_slice(&charset.to_le_bytes());
    out.extend_from_slice(plugin.as_bytes());
    out.push(0);
    out
}

/// Re-derive the native-password response against a *new* scramble sent
/// in an AuthSwitchRequest reply to a change-user packet.
pub fn auth_switch_response(new_scramble: &Scramble, password_sha1: &[u8; 20]) -> [u8; 20] {
    native_password_response(new_scramble, password_sha1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_sha1_is_deterministic() {
        let a = password_sha1(b"hunter2");
        let b = password_sha1(b"hunter2");
        assert_eq!(a, b);
        assert_ne!(a, password_sha1(b"other"));
    }

    #[test]
    fn native_password_response_changes_with_scramble() {
        let pw = password_sha1(b"hunter2");
        let s1: Scramble = [1u8; 20];
        let s2: Scramble = [2u8; 20];
        assert_ne!(
            native_password_response(&s1, &pw),
            native_password_response(&s2, &pw)
        );
    }

    #[test]
    fn change_user_packet_has_expected_shape() {
        let pw = password_sha1(b"hunter2");
        let scramble: Scramble = [7u8; 20];
        let pkt = build_change_user_packet(
            "app",
            &pw,
            &scramble,
            Some("mydb"),
            45,
            "mysql_native_password",
        );
        assert_eq!(pkt[0], 0x11);
        assert!(pkt.ends_with(b"mysql_native_password\0"));
        // username\0
        assert_eq!(&pkt[1..4], b"app");
        assert_eq!(pkt[4], 0);
        // token_len
        assert_eq!(pkt[5], 20);
    }

    #[test]
    fn auth_switch_response_matches_direct_derivation() {
        let pw = password_sha1(b"hunter2");
        let scramble: Scramble = [9u8; 20];
        assert_eq!(
            auth_switch_response(&scramble, &pw),
            native_password_response(&scramble, &pw)
        );
    }
}
