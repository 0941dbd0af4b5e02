//! # cm-protocol
//!
//! Asynchronous client core for CM front-end session networks.
//!
//! The crate covers the connection and session engine: transport framing,
//! the encryption handshake, server selection and failover, correlation
//! of request/response jobs over one multiplexed connection, and the
//! callback dispatcher that delivers decoded events to application code.
//!
//! ## Quick Start
//! ```no_run
//! use cm_protocol::config::ClientConfig;
//! use cm_protocol::service::callbacks::CmEventKind;
//! use cm_protocol::service::client::CmClient;
//! use std::time::Duration;
//!
//! # async fn run() -> cm_protocol::error::Result<()> {
//! let mut config = ClientConfig::default();
//! config.servers = vec!["203.0.113.10:27017".to_string()];
//!
//! let client = CmClient::from_config(config)?;
//! client.dispatcher().subscribe(CmEventKind::Connected, |event| {
//!     println!("connected: {event:?}");
//! });
//! client.connect();
//!
//! loop {
//!     client.dispatcher().run_once(Duration::from_millis(100)).await?;
//! }
//! # }
//! ```
//!
//! ## Layering
//! - [`core`]: frames, the stream codec, and the message envelope
//! - [`transport`]: TCP-stream and QUIC-message transports
//! - [`protocol`]: the channel encryption handshake
//! - [`directory`]: server health tracking and discovery
//! - [`service`]: the client, job correlator, and callback dispatcher
//! - [`utils`]: crypto channel, timeouts, logging, metrics

pub mod config;
pub mod core;
pub mod directory;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::config::{ClientConfig, CmConfig};
pub use crate::core::envelope::{MessageEnvelope, MsgKind, ResultCode, SessionIdentity, Universe};
pub use crate::error::{CmError, Result};
pub use crate::service::callbacks::{CallbackDispatcher, CmEvent, CmEventKind};
pub use crate::service::client::{CmClient, ConnectionState};
pub use crate::service::jobs::{JobCorrelator, JobHandle, JobId, JobStream};
pub use crate::transport::{Endpoint, TransportKind};
