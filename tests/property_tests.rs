//! Property-based tests using proptest
//!
//! These tests validate wire-format invariants across randomly generated
//! inputs: frame round-trips, codec behavior under arbitrary chunking,
//! and envelope header packing.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::{BufMut, BytesMut};
use cm_protocol::config::{FRAME_MAGIC, MAX_PAYLOAD_SIZE};
use cm_protocol::core::codec::FrameCodec;
use cm_protocol::core::envelope::{MessageEnvelope, MsgKind, SessionIdentity, Universe};
use cm_protocol::core::frame::Frame;
use cm_protocol::error::CmError;
use proptest::prelude::*;
use tokio_util::codec::{Decoder, Encoder};

// Property: any payload up to the cap survives a frame round-trip
proptest! {
    #[test]
    fn prop_frame_roundtrip(payload in prop::collection::vec(any::<u8>(), 0..10000)) {
        let frame = Frame::new(payload.clone());
        let bytes = frame.to_bytes().expect("within cap");
        let decoded = Frame::from_bytes(&bytes).expect("decode should not fail");
        prop_assert_eq!(decoded.payload, payload);
    }
}

// Property: frame serialization is deterministic
proptest! {
    #[test]
    fn prop_frame_serialization_deterministic(payload in prop::collection::vec(any::<u8>(), 0..1000)) {
        let frame = Frame::new(payload);
        prop_assert_eq!(frame.to_bytes().unwrap(), frame.to_bytes().unwrap());
    }
}

// Property: the codec reassembles frames from arbitrary chunk boundaries
proptest! {
    #[test]
    fn prop_codec_tolerates_any_chunking(
        payload in prop::collection::vec(any::<u8>(), 0..2000),
        chunk in 1usize..64,
    ) {
        let mut codec = FrameCodec;
        let mut wire = BytesMut::new();
        codec.encode(Frame::new(payload.clone()), &mut wire).unwrap();

        let mut buffered = BytesMut::new();
        let mut decoded = None;
        for piece in wire.chunks(chunk) {
            buffered.extend_from_slice(piece);
            if let Some(frame) = codec.decode(&mut buffered).unwrap() {
                decoded = Some(frame);
            }
        }
        prop_assert_eq!(decoded.expect("one full frame").payload, payload);
    }
}

// Property: oversized length claims are rejected up front, with only the
// header present, so no proportional allocation can have happened
proptest! {
    #[test]
    fn prop_oversized_claim_rejected(excess in 1u32..1000) {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u32_le(MAX_PAYLOAD_SIZE as u32 + excess);
        buf.put_u32_le(FRAME_MAGIC);

        prop_assert!(matches!(
            codec.decode(&mut buf),
            Err(CmError::OversizedFrame(_))
        ));
    }
}

// Property: a wrong magic value is always a framing error
proptest! {
    #[test]
    fn prop_bad_magic_always_fatal(magic in any::<u32>(), len in 0u32..1024) {
        prop_assume!(magic != FRAME_MAGIC);

        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u32_le(len);
        buf.put_u32_le(magic);
        buf.extend_from_slice(&vec![0u8; len as usize]);

        prop_assert!(matches!(codec.decode(&mut buf), Err(CmError::InvalidMagic)));
    }
}

// Property: envelope headers round-trip for any field values
proptest! {
    #[test]
    fn prop_envelope_roundtrip(
        code in 0u32..0x7FFF_FFFF,
        structured in any::<bool>(),
        identity in any::<u64>(),
        source in any::<u64>(),
        target in any::<u64>(),
        body in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let mut envelope = if structured {
            let mut e = MessageEnvelope::new(MsgKind::Unknown(code), body.clone());
            e.header.raw = cm_protocol::core::envelope::RawMsgType::new(MsgKind::Unknown(code), true);
            e
        } else {
            MessageEnvelope::new(MsgKind::Unknown(code), body.clone())
        };
        envelope.header.identity = identity;
        envelope.header.source_job = source;
        envelope.header.target_job = target;

        let decoded = MessageEnvelope::decode(&envelope.encode()).unwrap();
        prop_assert_eq!(decoded, envelope);
    }
}

// Property: session identity packing preserves every component
proptest! {
    #[test]
    fn prop_identity_packing(
        account_type in 0u8..16,
        instance in 0u32..0x000F_FFFF,
        account_id in any::<u32>(),
    ) {
        let identity = SessionIdentity::new(Universe::Public, account_type, instance, account_id);
        prop_assert_eq!(identity.universe(), Universe::Public);
        prop_assert_eq!(identity.account_type(), account_type);
        prop_assert_eq!(identity.instance(), instance);
        prop_assert_eq!(identity.account_id(), account_id);
    }
}
