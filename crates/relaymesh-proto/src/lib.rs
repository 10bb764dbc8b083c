//! Per-backend MySQL/MariaDB protocol state machine.
//!
//! Owns the handshake/auth/connection-init/routing lifecycle of one
//! backend connection (`BackendProto`), the reply-state sub-machine that
//! walks a single response packet-by-packet (`ReplyTracker`), the
//! proxy's own client-facing greeting and auth verification
//! (`greeting`), and the capability negotiation, scrambling and
//! command-decoding primitives they're built from.

mod capabilities;
mod command;
mod error;
mod greeting;
mod handshake;
mod machine;
mod reply;
mod scramble;

pub use capabilities::{
    both_support_connect_attrs, negotiate_client_capabilities, NegotiationInputs,
    CLIENT_CONNECT_ATTRS, CLIENT_CONNECT_WITH_DB, CLIENT_LONG_PASSWORD, CLIENT_MULTI_RESULTS,
    CLIENT_MULTI_STATEMENTS, CLIENT_PROTOCOL_41, CLIENT_SECURE_CONNECTION, CLIENT_SESSION_TRACK,
    CLIENT_SSL, CLIENT_TRANSACTIONS, SERVER_MORE_RESULTS_EXIST, SERVER_SESSION_STATE_CHANGED,
    SERVER_STATUS_AUTOCOMMIT, SERVER_STATUS_IN_TRANS,
};
pub use command::{Command, COM_CHANGE_USER, COM_PING, COM_QUERY};
pub use error::{ErrorClass, ProtoError, ProtoResult};
pub use greeting::{
    build_access_denied, build_auth_ok, build_server_greeting, parse_client_handshake_response,
    random_scramble, verify_native_password, ClientHandshakeResponse, ServerGreeting,
};
pub use handshake::{
    build_handshake_response, build_ssl_request, parse_server_handshake, HandshakeResponseInputs,
    ServerHandshake, MAX_PACKET_SIZE,
};
pub use machine::{
    BackendEvent, BackendProto, ConnectionOptions, Credentials, ProtoState, ProxyHeader,
    ReplyDisposition,
};
pub use reply::{BackendError, ReplyMeta, ReplyState, ReplyTracker};
pub use scramble::{
    auth_switch_response, build_change_user_packet, native_password_response, password_sha1,
    Scramble,
};
