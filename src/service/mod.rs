//! # Session Services
//!
//! The client-facing layer: the connection manager client itself, the
//! encrypted channel it drives, request/response job correlation, and the
//! callback dispatcher that delivers decoded events to application code.

pub mod callbacks;
pub mod channel;
pub mod client;
pub mod jobs;
