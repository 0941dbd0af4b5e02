//! Frame wire format for stream transports.
//!
//! One frame is a length prefix, a magic value, and an opaque payload. The
//! payload is ciphertext once the encryption handshake completes and a
//! plaintext envelope before that.

use bytes::{Buf, BufMut, BytesMut};

use crate::config::{FRAME_MAGIC, MAX_PAYLOAD_SIZE};
use crate::error::{CmError, Result};

/// Size of the length prefix plus magic value.
pub const FRAME_HEADER_SIZE: usize = 8;

/// One length-delimited unit of bytes exchanged over the transport.
///
/// Transient: a `Frame` exists only between the socket read and envelope
/// decode (or between envelope encode and the socket write).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    /// Serialize the frame for a stream transport.
    ///
    /// # Errors
    /// Returns `CmError::OversizedFrame` if the payload exceeds
    /// `MAX_PAYLOAD_SIZE`.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CmError::OversizedFrame(self.payload.len()));
        }

        let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        out.put_u32_le(self.payload.len() as u32);
        out.put_u32_le(FRAME_MAGIC);
        out.extend_from_slice(&self.payload);
        Ok(out.to_vec())
    }

    /// Parse one complete frame from a byte slice.
    ///
    /// The slice must contain exactly one frame; streaming input goes
    /// through [`crate::core::codec::FrameCodec`] instead.
    ///
    /// # Errors
    /// - `CmError::Framing` on a truncated buffer
    /// - `CmError::OversizedFrame` when the length claim exceeds the cap
    ///   (checked before the payload is touched)
    /// - `CmError::InvalidMagic` on a magic mismatch
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(CmError::Framing("truncated frame header".into()));
        }

        let mut header = &buf[..FRAME_HEADER_SIZE];
        let length = header.get_u32_le() as usize;
        let magic = header.get_u32_le();

        if length > MAX_PAYLOAD_SIZE {
            return Err(CmError::OversizedFrame(length));
        }
        if magic != FRAME_MAGIC {
            return Err(CmError::InvalidMagic);
        }
        if buf.len() < FRAME_HEADER_SIZE + length {
            return Err(CmError::Framing("truncated frame payload".into()));
        }

        Ok(Self {
            payload: buf[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + length].to_vec(),
        })
    }
}
