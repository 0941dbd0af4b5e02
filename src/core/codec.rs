//! Tokio codec for framing over byte streams.
//!
//! Stream transports deliver arbitrary chunk boundaries; the codec buffers
//! until a full length-prefixed frame is available and never consumes a
//! partial frame. A bad magic or an oversized length claim is a fatal
//! framing error: the connection is torn down, never resynced.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::{FRAME_MAGIC, MAX_PAYLOAD_SIZE};
use crate::core::frame::{Frame, FRAME_HEADER_SIZE};
use crate::error::CmError;

/// Codec turning a byte stream into discrete protocol frames and back.
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CmError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least the length prefix and magic
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Peek without consuming: a partial frame must stay buffered
        let length = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        let magic = u32::from_le_bytes([src[4], src[5], src[6], src[7]]);

        // Validate the length claim before reserving anything
        if length > MAX_PAYLOAD_SIZE {
            return Err(CmError::OversizedFrame(length));
        }
        if magic != FRAME_MAGIC {
            return Err(CmError::InvalidMagic);
        }

        let total = FRAME_HEADER_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_SIZE);
        let payload = src.split_to(length);

        Ok(Some(Frame::new(payload.to_vec())))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CmError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CmError::OversizedFrame(item.payload.len()));
        }

        dst.reserve(FRAME_HEADER_SIZE + item.payload.len());
        dst.put_u32_le(item.payload.len() as u32);
        dst.put_u32_le(FRAME_MAGIC);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}
