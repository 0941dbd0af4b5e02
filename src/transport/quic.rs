//! Message-socket transport over QUIC.
//!
//! Each frame travels as one unidirectional stream: the sender writes the
//! payload and finishes the stream, the receiver reads the stream to its
//! end. The transport itself preserves message boundaries, so frames
//! carry no length prefix or magic on this variant.

use async_trait::async_trait;
use bytes::Bytes;
use quinn::{ConnectionError, ReadToEndError};
use tracing::{debug, instrument};

use crate::config::MAX_PAYLOAD_SIZE;
use crate::error::{CmError, Result};
use crate::transport::{tls, Transport};

/// Server name presented during the QUIC TLS handshake.
const SERVER_NAME: &str = "cm-frontend";

/// QUIC transport; one unidirectional stream per frame.
pub struct QuicTransport {
    // The endpoint must outlive the connection driving it.
    endpoint: quinn::Endpoint,
    connection: quinn::Connection,
}

impl QuicTransport {
    /// Dial a front-end over QUIC.
    #[instrument]
    pub async fn connect(addr: std::net::SocketAddr) -> Result<Self> {
        let bind: std::net::SocketAddr = if addr.is_ipv6() {
            "[::]:0".parse().expect("literal address")
        } else {
            "0.0.0.0:0".parse().expect("literal address")
        };

        let mut endpoint = quinn::Endpoint::client(bind)
            .map_err(|e| CmError::Connect(format!("quic endpoint bind failed: {e}")))?;
        endpoint.set_default_client_config(tls::build_client_config()?);

        let connection = endpoint
            .connect(addr, SERVER_NAME)
            .map_err(|e| CmError::Connect(format!("quic connect to {addr} failed: {e}")))?
            .await
            .map_err(|e| CmError::Connect(format!("quic handshake with {addr} failed: {e}")))?;

        debug!(peer = %addr, "quic connected");
        Ok(Self {
            endpoint,
            connection,
        })
    }

    fn map_closed(err: ConnectionError) -> Result<Option<Vec<u8>>> {
        match err {
            // Intentional close by either side
            ConnectionError::ApplicationClosed(_) | ConnectionError::LocallyClosed => Ok(None),
            _ => Err(CmError::ConnectionLost),
        }
    }
}

#[async_trait]
impl Transport for QuicTransport {
    async fn send_frame(&mut self, payload: Bytes) -> Result<()> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CmError::OversizedFrame(payload.len()));
        }

        let mut stream = self
            .connection
            .open_uni()
            .await
            .map_err(|_| CmError::ConnectionLost)?;
        stream
            .write_all(&payload)
            .await
            .map_err(|_| CmError::ConnectionLost)?;
        stream.finish().map_err(|_| CmError::ConnectionLost)?;
        Ok(())
    }

    async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut stream = match self.connection.accept_uni().await {
            Ok(stream) => stream,
            Err(err) => return Self::map_closed(err),
        };

        match stream.read_to_end(MAX_PAYLOAD_SIZE).await {
            Ok(payload) => Ok(Some(payload)),
            Err(ReadToEndError::TooLong) => Err(CmError::OversizedFrame(MAX_PAYLOAD_SIZE + 1)),
            Err(ReadToEndError::Read(_)) => Err(CmError::ConnectionLost),
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.connection.close(0u32.into(), b"client disconnect");
        self.endpoint.wait_idle().await;
        Ok(())
    }
}
