//! # Protocol Layer
//!
//! The channel-encryption handshake: frame bodies, the client's response
//! step, and the server-side helpers used to verify it.
//!
//! The handshake is server-driven. After the transport connects, the
//! client stays silent until the server's unsolicited encryption request
//! arrives; the connection state machine that sequences this lives with
//! the client in [`crate::service::client`].

pub mod handshake;
