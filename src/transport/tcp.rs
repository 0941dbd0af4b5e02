//! Stream-socket transport over TCP.
//!
//! Message boundaries come from [`FrameCodec`]; arbitrary chunk
//! boundaries on the socket are tolerated by the codec's buffering.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, instrument};

use crate::core::codec::FrameCodec;
use crate::core::frame::Frame;
use crate::error::{CmError, Result};
use crate::transport::Transport;

/// TCP transport framing messages with [`FrameCodec`].
pub struct TcpTransport {
    framed: Framed<TcpStream, FrameCodec>,
}

impl TcpTransport {
    /// Open a TCP connection. Nagle is disabled; the protocol already
    /// batches into frames.
    #[instrument]
    pub async fn connect(addr: std::net::SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| CmError::Connect(format!("tcp connect to {addr} failed: {e}")))?;
        stream.set_nodelay(true)?;

        debug!(peer = %addr, "tcp connected");
        Ok(Self {
            framed: Framed::new(stream, FrameCodec),
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send_frame(&mut self, payload: Bytes) -> Result<()> {
        self.framed.send(Frame::new(payload.to_vec())).await
    }

    async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(Some(frame.payload)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.framed.close().await?;
        Ok(())
    }
}
