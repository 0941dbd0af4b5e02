//! # Error Types
//!
//! Error handling for the CM client core.
//!
//! This module defines all error variants that can occur while driving a CM
//! session, from low-level I/O failures to handshake and job-level errors.
//!
//! ## Error Categories
//! - **I/O and connect errors**: socket failures, connect/handshake timeouts
//! - **Framing errors**: bad magic and oversized frames, always fatal
//! - **Cryptographic errors**: key wrap and channel decrypt failures, fatal
//! - **Job errors**: per-job timeout, connection loss failing pending jobs
//!
//! All errors implement `std::error::Error` for interoperability.

use std::io;
use thiserror::Error;

use crate::core::envelope::ResultCode;

/// Error message constants to reduce allocations in error paths.
/// Static strings are borrowed, avoiding heap allocations for common cases.
pub mod constants {
    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_NOT_CONNECTED: &str = "Client is not connected";
    pub const ERR_SERVERS_EXHAUSTED: &str = "All known servers exhausted";

    /// Handshake errors
    pub const ERR_UNEXPECTED_FRAME: &str = "Unexpected frame during handshake";
    pub const ERR_UNKNOWN_UNIVERSE: &str = "No public key for declared universe";
    pub const ERR_KEY_MAC_MISMATCH: &str = "Session key MAC verification failed";
    pub const ERR_WRAPPED_KEY_SHORT: &str = "Wrapped session key too short";

    /// Framing errors
    pub const ERR_INVALID_MAGIC: &str = "Invalid frame magic";
    pub const ERR_TRUNCATED_HEADER: &str = "Truncated envelope header";
}

/// Primary error type for all CM client operations.
#[derive(Error, Debug)]
pub enum CmError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Connect timed out")]
    ConnectTimeout,

    #[error("Client is not connected")]
    NotConnected,

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Invalid frame magic")]
    InvalidMagic,

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Handshake rejected by server: {0:?}")]
    HandshakeResult(ResultCode),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Job timed out")]
    JobTimeout,

    #[error("Job cancelled")]
    JobCancelled,

    #[error("Operation timed out")]
    Timeout,

    #[error("Discovery failed: {0}")]
    Discovery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Callback handler panicked: {0}")]
    CallbackPanic(String),
}

/// Type alias for Results using CmError.
pub type Result<T> = std::result::Result<T, CmError>;

impl CmError {
    /// Whether this error is fatal to the current connection.
    ///
    /// Fatal errors tear the connection down; non-fatal ones are local to a
    /// single operation (a job timeout does not kill the session).
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            CmError::JobTimeout | CmError::JobCancelled | CmError::Timeout | CmError::NotConnected
        )
    }
}
