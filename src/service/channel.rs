//! The session channel a client drives: a transport plus, once the
//! handshake completes, the symmetric crypto channel sealing every frame.
//!
//! Before activation frames pass through unmodified (the handshake
//! exchange itself); afterwards every payload is sealed on send and
//! opened on receive, and a decrypt failure tears the connection down.

use bytes::Bytes;
use tokio::time::Instant;
use tracing::debug;

use crate::core::envelope::MessageEnvelope;
use crate::error::Result;
use crate::protocol::handshake::SessionKey;
use crate::transport::Transport;
use crate::utils::crypto::CryptoChannel;

/// One connection's framing + encryption state.
pub struct SessionChannel {
    transport: Box<dyn Transport>,
    crypto: Option<CryptoChannel>,
    last_activity: Instant,
}

impl SessionChannel {
    /// Wrap a freshly-connected transport; plaintext until
    /// [`SessionChannel::activate`].
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            crypto: None,
            last_activity: Instant::now(),
        }
    }

    /// Switch the channel to encrypted operation.
    pub fn activate(&mut self, key: &SessionKey) {
        self.crypto = Some(key.open_channel());
        debug!("session channel encrypted");
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypto.is_some()
    }

    /// Time since the last frame was received.
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.elapsed()
    }

    /// Encode, seal, and send one envelope. Returns the payload size.
    ///
    /// # Errors
    /// Transport and encryption failures; both are fatal to the
    /// connection.
    pub async fn send_envelope(&mut self, envelope: &MessageEnvelope) -> Result<usize> {
        let mut payload = envelope.encode();
        if let Some(crypto) = &self.crypto {
            payload = crypto.seal(&payload)?;
        }
        let len = payload.len();
        self.transport.send_frame(Bytes::from(payload)).await?;
        Ok(len)
    }

    /// Receive, open, and decode the next envelope.
    ///
    /// `Ok(None)` is a clean close by the peer.
    ///
    /// # Errors
    /// `CmError::DecryptionFailure` (tampering or desync) and framing
    /// errors are fatal; the caller must tear the connection down.
    pub async fn recv_envelope(&mut self) -> Result<Option<MessageEnvelope>> {
        let Some(frame) = self.transport.recv_frame().await? else {
            return Ok(None);
        };
        self.last_activity = Instant::now();

        let payload = match &self.crypto {
            Some(crypto) => crypto.open(&frame)?,
            None => frame,
        };

        Ok(Some(MessageEnvelope::decode(&payload)?))
    }

    /// Close the underlying transport.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.transport.shutdown().await
    }
}
