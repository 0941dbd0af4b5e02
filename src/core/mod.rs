//! # Core Wire Components
//!
//! Low-level frame handling, the tokio codec, and the message envelope.
//!
//! This module is the foundation of the protocol: framing of untrusted
//! network input, the envelope header riding inside each decrypted frame,
//! and the 64-bit session identity stamped on outgoing messages.
//!
//! ## Wire Format (stream transports)
//! ```text
//! [Length(4, LE)] [Magic(4, LE)] [Payload(N)]
//! ```
//!
//! Message transports carry the payload alone; the transport itself
//! preserves frame boundaries.
//!
//! ## Security
//! - Length claims are validated against `MAX_PAYLOAD_SIZE` before any
//!   allocation
//! - A magic mismatch is a fatal framing error, never a resumable desync

pub mod codec;
pub mod envelope;
pub mod frame;
