//! Message envelope: the logical, typed message riding inside a frame.
//!
//! After decryption every frame payload starts with a fixed 28-byte header
//! carrying the message-type code (high bit flags a structured body), the
//! sender's session identity, and the optional job-correlation id pair.
//! The body is opaque to the core; typed bodies go through the external
//! serializer via [`MessageEnvelope::encode_body`] and
//! [`MessageEnvelope::decode_body`].

use bytes::{Buf, BufMut, BytesMut};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{constants, CmError, Result};

/// High bit of the raw message-type code flagging a structured
/// (serde-encoded) body.
pub const STRUCTURED_FLAG: u32 = 0x8000_0000;

/// Fixed envelope header size on the wire.
pub const ENVELOPE_HEADER_SIZE: usize = 28;

/// Raw message-type code as carried on the wire, including the
/// structured-body flag bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawMsgType(pub u32);

impl RawMsgType {
    pub fn new(kind: MsgKind, structured: bool) -> Self {
        let code = kind.code();
        Self(if structured { code | STRUCTURED_FLAG } else { code })
    }

    /// Type code with the flag bit stripped.
    pub fn code(self) -> u32 {
        self.0 & !STRUCTURED_FLAG
    }

    pub fn is_structured(self) -> bool {
        self.0 & STRUCTURED_FLAG != 0
    }

    /// The closed message kind this code maps to, if the core knows it.
    pub fn kind(self) -> MsgKind {
        MsgKind::from_code(self.code())
    }
}

/// Message kinds the core routes on.
///
/// The per-feature kinds of the wider protocol ride through as
/// `Unknown(code)` and are delivered to the callback dispatcher untouched;
/// the core only interprets the channel-setup and keepalive kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgKind {
    Invalid,
    /// Server's unsolicited request to establish channel encryption
    ChannelEncryptRequest,
    /// Client's wrapped session key + nonce MAC
    ChannelEncryptResponse,
    /// Server's verdict on the encryption handshake
    ChannelEncryptResult,
    /// Idle keepalive, sent on a fixed interval once encrypted
    Heartbeat,
    /// Terminator for multi-reply jobs
    JobComplete,
    /// Message kind the core does not interpret
    Unknown(u32),
}

impl MsgKind {
    pub fn code(self) -> u32 {
        match self {
            MsgKind::Invalid => 0,
            MsgKind::ChannelEncryptRequest => 1,
            MsgKind::ChannelEncryptResponse => 2,
            MsgKind::ChannelEncryptResult => 3,
            MsgKind::Heartbeat => 10,
            MsgKind::JobComplete => 11,
            MsgKind::Unknown(code) => code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            0 => MsgKind::Invalid,
            1 => MsgKind::ChannelEncryptRequest,
            2 => MsgKind::ChannelEncryptResponse,
            3 => MsgKind::ChannelEncryptResult,
            10 => MsgKind::Heartbeat,
            11 => MsgKind::JobComplete,
            other => MsgKind::Unknown(other),
        }
    }
}

/// Result code carried by the encryption-result frame and surfaced in
/// connection events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultCode(pub u32);

impl ResultCode {
    pub const OK: ResultCode = ResultCode(1);
    pub const FAIL: ResultCode = ResultCode(2);
    pub const TRY_ANOTHER: ResultCode = ResultCode(3);
    pub const TIMEOUT: ResultCode = ResultCode(4);

    pub fn is_ok(self) -> bool {
        self == ResultCode::OK
    }
}

/// Universe a session belongs to. Selects the fixed public key used to
/// wrap the session key during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Universe {
    Invalid = 0,
    Public = 1,
    Beta = 2,
    Internal = 3,
    Dev = 4,
}

impl Universe {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => Universe::Public,
            2 => Universe::Beta,
            3 => Universe::Internal,
            4 => Universe::Dev,
            _ => Universe::Invalid,
        }
    }
}

/// 64-bit addressable session identity stamped on outgoing messages.
///
/// Packing, high to low: universe (8 bits), account type (4 bits),
/// instance (20 bits), account id (32 bits). Created at logon by the
/// embedding application, cleared by the client at disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionIdentity(u64);

impl SessionIdentity {
    pub fn new(universe: Universe, account_type: u8, instance: u32, account_id: u32) -> Self {
        let packed = ((universe as u64) << 56)
            | (u64::from(account_type & 0x0F) << 52)
            | (u64::from(instance & 0x000F_FFFF) << 32)
            | u64::from(account_id);
        Self(packed)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn universe(self) -> Universe {
        Universe::from_u32(((self.0 >> 56) & 0xFF) as u32)
    }

    pub fn account_type(self) -> u8 {
        ((self.0 >> 52) & 0x0F) as u8
    }

    pub fn instance(self) -> u32 {
        ((self.0 >> 32) & 0x000F_FFFF) as u32
    }

    pub fn account_id(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }
}

/// Fixed wire header of every envelope.
///
/// Job ids use 0 as "none"; a non-zero `target_job` references the
/// `source_job` of an earlier request on the same connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub raw: RawMsgType,
    pub identity: u64,
    pub source_job: u64,
    pub target_job: u64,
}

impl EnvelopeHeader {
    pub fn new(raw: RawMsgType) -> Self {
        Self {
            raw,
            identity: 0,
            source_job: 0,
            target_job: 0,
        }
    }
}

/// The logical, typed message riding inside a frame after decryption.
///
/// Created by the sender or by decoding an inbound frame; consumed
/// immediately by routing logic, not retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub header: EnvelopeHeader,
    pub body: Vec<u8>,
}

impl MessageEnvelope {
    /// Envelope with a raw (unstructured) body.
    pub fn new(kind: MsgKind, body: Vec<u8>) -> Self {
        Self {
            header: EnvelopeHeader::new(RawMsgType::new(kind, false)),
            body,
        }
    }

    /// Envelope with a structured body, encoded through the external
    /// serializer.
    ///
    /// # Errors
    /// Propagates serializer failures.
    pub fn structured<T: Serialize>(kind: MsgKind, body: &T) -> Result<Self> {
        Ok(Self {
            header: EnvelopeHeader::new(RawMsgType::new(kind, true)),
            body: encode_body(body)?,
        })
    }

    pub fn kind(&self) -> MsgKind {
        self.header.raw.kind()
    }

    /// Decode the structured body into a typed value.
    ///
    /// # Errors
    /// Fails if the envelope is not flagged structured or the serializer
    /// rejects the bytes.
    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T> {
        if !self.header.raw.is_structured() {
            return Err(CmError::Framing(
                "envelope body is not structured".to_string(),
            ));
        }
        decode_body(&self.body)
    }

    /// Serialize header + body into a frame payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(ENVELOPE_HEADER_SIZE + self.body.len());
        out.put_u32_le(self.header.raw.0);
        out.put_u64_le(self.header.identity);
        out.put_u64_le(self.header.source_job);
        out.put_u64_le(self.header.target_job);
        out.extend_from_slice(&self.body);
        out.to_vec()
    }

    /// Parse an envelope from a decrypted frame payload.
    ///
    /// # Errors
    /// Returns `CmError::Framing` on a truncated header.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < ENVELOPE_HEADER_SIZE {
            return Err(CmError::Framing(constants::ERR_TRUNCATED_HEADER.into()));
        }

        let mut buf = &payload[..ENVELOPE_HEADER_SIZE];
        let raw = RawMsgType(buf.get_u32_le());
        let identity = buf.get_u64_le();
        let source_job = buf.get_u64_le();
        let target_job = buf.get_u64_le();

        Ok(Self {
            header: EnvelopeHeader {
                raw,
                identity,
                source_job,
                target_job,
            },
            body: payload[ENVELOPE_HEADER_SIZE..].to_vec(),
        })
    }
}

/// External-serializer boundary: encode a typed body to opaque bytes.
pub fn encode_body<T: Serialize>(body: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(body)?)
}

/// External-serializer boundary: decode opaque bytes into a typed body.
pub fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_flag_roundtrip() {
        let raw = RawMsgType::new(MsgKind::Heartbeat, true);
        assert!(raw.is_structured());
        assert_eq!(raw.code(), MsgKind::Heartbeat.code());
        assert_eq!(raw.kind(), MsgKind::Heartbeat);

        let plain = RawMsgType::new(MsgKind::Heartbeat, false);
        assert!(!plain.is_structured());
        assert_eq!(plain.kind(), MsgKind::Heartbeat);
    }

    #[test]
    fn unknown_kind_preserves_code() {
        let raw = RawMsgType::new(MsgKind::Unknown(5021), false);
        assert_eq!(raw.kind(), MsgKind::Unknown(5021));
        assert_eq!(MsgKind::Unknown(5021).code(), 5021);
    }

    #[test]
    fn identity_packing() {
        let id = SessionIdentity::new(Universe::Public, 1, 2, 0xDEAD_BEEF);
        assert_eq!(id.universe(), Universe::Public);
        assert_eq!(id.account_type(), 1);
        assert_eq!(id.instance(), 2);
        assert_eq!(id.account_id(), 0xDEAD_BEEF);
        assert_eq!(SessionIdentity::from_raw(id.raw()), id);
    }

    #[test]
    fn envelope_header_roundtrip() {
        let mut env = MessageEnvelope::new(MsgKind::Unknown(731), vec![1, 2, 3]);
        env.header.identity = 42;
        env.header.source_job = 7;
        env.header.target_job = 9;

        let payload = env.encode();
        let decoded = MessageEnvelope::decode(&payload).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn truncated_header_rejected() {
        assert!(matches!(
            MessageEnvelope::decode(&[0u8; ENVELOPE_HEADER_SIZE - 1]),
            Err(CmError::Framing(_))
        ));
    }

    #[test]
    fn structured_body_roundtrip() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Hello {
            who: String,
            n: u32,
        }

        let body = Hello {
            who: "cm".into(),
            n: 3,
        };
        let env = MessageEnvelope::structured(MsgKind::Unknown(900), &body).unwrap();
        assert!(env.header.raw.is_structured());
        assert_eq!(env.decode_body::<Hello>().unwrap(), body);
    }
}
