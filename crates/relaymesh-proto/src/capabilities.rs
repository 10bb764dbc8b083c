//! Capability-flag bitmasks and status-flag bitmasks from the MySQL
//! handshake protocol, plus the client-capability negotiation rule.

#![allow(dead_code)]

pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
pub const CLIENT_FOUND_ROWS: u32 = 0x0000_0002;
pub const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
pub const CLIENT_NO_SCHEMA: u32 = 0x0000_0010;
pub const CLIENT_COMPRESS: u32 = 0x0000_0020;
pub const CLIENT_ODBC: u32 = 0x0000_0040;
pub const CLIENT_LOCAL_FILES: u32 = 0x0000_0080;
pub const CLIENT_IGNORE_SPACE: u32 = 0x0000_0100;
pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
pub const CLIENT_INTERACTIVE: u32 = 0x0000_0400;
pub const CLIENT_SSL: u32 = 0x0000_0800;
pub const CLIENT_IGNORE_SIGPIPE: u32 = 0x0000_1000;
pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
pub const CLIENT_RESERVED: u32 = 0x0000_4000;
pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
pub const CLIENT_MULTI_STATEMENTS: u32 = 0x0001_0000;
pub const CLIENT_MULTI_RESULTS: u32 = 0x0002_0000;
pub const CLIENT_PS_MULTI_RESULTS: u32 = 0x0004_0000;
pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
pub const CLIENT_CONNECT_ATTRS: u32 = 0x0010_0000;
pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 0x0020_0000;
pub const CLIENT_SESSION_TRACK: u32 = 0x0080_0000;
pub const CLIENT_DEPRECATE_EOF: u32 = 0x0100_0000;

/// Status flags carried in OK/EOF packets.
pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
pub const SERVER_MORE_RESULTS_EXIST: u16 = 0x0008;
pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;
pub const SERVER_SESSION_STATE_CHANGED: u16 = 0x4000;

/// Capabilities the proxy itself always requests of a backend,
/// independent of what the original client asked for.
const ALWAYS_REQUESTED: u32 = CLIENT_PROTOCOL_41
    | CLIENT_LONG_PASSWORD
    | CLIENT_LONG_FLAG
    | CLIENT_TRANSACTIONS
    | CLIENT_SECURE_CONNECTION
    | CLIENT_MULTI_STATEMENTS
    | CLIENT_MULTI_RESULTS
    | CLIENT_PS_MULTI_RESULTS
    | CLIENT_PLUGIN_AUTH;

/// Inputs that steer capability negotiation for one backend connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct NegotiationInputs {
    /// Capabilities the original client session negotiated.
    pub client_caps: u32,
    /// Whether this backend connection should request a TLS upgrade.
    pub want_ssl: bool,
    /// Whether the owning service requires session-state tracking.
    pub want_session_track: bool,
    /// Whether the session chose an initial database.
    pub has_initial_db: bool,
}

/// Compute the capability mask the proxy sends in its handshake response
/// to a backend server, per §4.2a: the client's own mask ANDed against a
/// fixed client-compatible bitset, OR'd with always/conditionally
/// requested flags.
pub fn negotiate_client_capabilities(inputs: NegotiationInputs) -> u32 {
    let mut caps = inputs.client_caps & ALWAYS_REQUESTED;
    caps |= ALWAYS_REQUESTED;
    if inputs.want_ssl {
        caps |= CLIENT_SSL;
    }
    if inputs.want_session_track {
        caps |= CLIENT_SESSION_TRACK;
    }
    if inputs.has_initial_db {
        caps |= CLIENT_CONNECT_WITH_DB;
    }
    caps
}

/// Whether both sides of a negotiation claim support for connect-attrs.
pub fn both_support_connect_attrs(client_caps: u32, server_caps: u32) -> bool {
    client_caps & server_caps & CLIENT_CONNECT_ATTRS != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_includes_multi_statements_and_plugin_auth() {
        let caps = negotiate_client_capabilities(NegotiationInputs::default());
        assert!(caps & CLIENT_MULTI_STATEMENTS != 0);
        assert!(caps & CLIENT_PLUGIN_AUTH != 0);
    }

    #[test]
    fn ssl_flag_set_only_when_requested() {
        let without = negotiate_client_capabilities(NegotiationInputs::default());
        assert_eq!(without & CLIENT_SSL, 0);

        let with = negotiate_client_capabilities(NegotiationInputs {
            want_ssl: true,
            ..Default::default()
        });
        assert_ne!(with & CLIENT_SSL, 0);
    }

    #[test]
    fn connect_with_db_only_when_database_chosen() {
        let caps = negotiate_client_capabilities(NegotiationInputs {
            has_initial_db: true,
            ..Default::default()
        });
        assert_ne!(caps & CLIENT_CONNECT_WITH_DB, 0);
    }

    #[test]
    fn session_track_follows_service_demand() {
        let caps = negotiate_client_capabilities(NegotiationInputs {
            want_session_track: true,
            ..Default::default()
        });
        assert_ne!(caps & CLIENT_SESSION_TRACK, 0);
    }

    #[test]
    fn connect_attrs_requires_both_sides() {
        assert!(both_support_connect_attrs(
            CLIENT_CONNECT_ATTRS,
            CLIENT_CONNECT_ATTRS
        ));
        assert!(!both_support_connect_attrs(CLIENT_CONNECT_ATTRS, 0));
    }
}
