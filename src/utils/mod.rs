//! # Utility Modules
//!
//! Supporting utilities for cryptography, timeouts, logging, and metrics.
//!
//! ## Components
//! - **Crypto**: XChaCha20-Poly1305 AEAD session channel
//! - **Timeout**: async timeout wrappers and default durations
//! - **Logging**: structured logging configuration
//! - **Metrics**: thread-safe observability counters
//!
//! ## Security
//! - Cryptographically secure RNG (`OsRng`)
//! - Memory zeroing for session keys (zeroize crate)

pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod timeout;
