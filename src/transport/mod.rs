//! # Transport Layer
//!
//! Abstracts the underlying connection behind connect / send-frame /
//! receive-frame / disconnect.
//!
//! Two variants: a stream-socket transport (TCP, message boundaries from
//! [`crate::core::codec::FrameCodec`]) and a message-socket transport
//! (QUIC, one unidirectional stream per frame, no length prefix). Both
//! report disconnection uniformly, so upper layers never know which one
//! is active.

pub mod quic;
pub mod tcp;
pub mod tls;

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{CmError, Result};
use crate::utils::timeout::with_timeout;

/// Declared transport capability of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Stream socket; frames carry an explicit length prefix and magic
    Stream,
    /// Message-oriented secure socket; the transport preserves boundaries
    Message,
}

/// Network address plus transport capability.
///
/// Immutable once read from the directory snapshot used for one
/// connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub addr: SocketAddr,
    pub kind: TransportKind,
}

impl Endpoint {
    pub fn new(addr: SocketAddr, kind: TransportKind) -> Self {
        Self { addr, kind }
    }

    pub fn stream(addr: SocketAddr) -> Self {
        Self::new(addr, TransportKind::Stream)
    }

    pub fn message(addr: SocketAddr) -> Self {
        Self::new(addr, TransportKind::Message)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:?})", self.addr, self.kind)
    }
}

/// A connected transport carrying opaque frames.
///
/// Used from a single io task; writes are serialized by that ownership.
#[async_trait]
pub trait Transport: Send {
    /// Send one frame payload.
    async fn send_frame(&mut self, payload: Bytes) -> Result<()>;

    /// Receive the next frame payload.
    ///
    /// `Ok(None)` is a clean close by the peer; `Err` is an abrupt
    /// disconnect or a fatal framing error.
    async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>>;

    /// Close the connection from this side.
    async fn shutdown(&mut self) -> Result<()>;
}

/// Connect to an endpoint, honoring its declared transport capability.
///
/// # Errors
/// Returns `CmError::ConnectTimeout` if the attempt does not finish in
/// `timeout`, or `CmError::Connect` on refusal/reset.
pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Box<dyn Transport>> {
    with_timeout(
        async {
            match endpoint.kind {
                TransportKind::Stream => {
                    let t = tcp::TcpTransport::connect(endpoint.addr).await?;
                    Ok(Box::new(t) as Box<dyn Transport>)
                }
                TransportKind::Message => {
                    let t = quic::QuicTransport::connect(endpoint.addr).await?;
                    Ok(Box::new(t) as Box<dyn Transport>)
                }
            }
        },
        timeout,
        CmError::ConnectTimeout,
    )
    .await
}
