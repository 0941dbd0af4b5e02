//! Channel encryption handshake.
//!
//! The server opens with an encryption request carrying a random nonce and
//! its declared universe. The client generates a random session key, wraps
//! it for the fixed public key of that universe (ephemeral x25519 exchange
//! plus AEAD), and answers with the wrapped key and an HMAC over the nonce
//! keyed by the session key. The server unwraps, checks the MAC, and
//! reports a result code; only an OK result activates the channel.
//!
//! Key material is session-scoped and zeroized on drop. The server-side
//! functions exist so a test harness can stand in for a real CM.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::envelope::{ResultCode, Universe};
use crate::error::{constants, CmError, Result};
use crate::utils::crypto::{CryptoChannel, NONCE_SIZE};

#[allow(unused_imports)]
use tracing::{debug, instrument, warn};

/// Length of the server's handshake nonce.
pub const HANDSHAKE_NONCE_LEN: usize = 16;

/// Length of a session key.
pub const SESSION_KEY_LEN: usize = 32;

/// Domain tag mixed into the wrap-key derivation.
const WRAP_KEY_DOMAIN: &[u8] = b"cm-protocol channel key wrap v1";

type HmacSha256 = Hmac<Sha256>;

/// Random symmetric key fixed for the lifetime of one connection.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    /// Generate a fresh random session key.
    pub fn generate() -> Self {
        let mut key = [0u8; SESSION_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Open the symmetric channel this key protects.
    pub fn open_channel(&self) -> CryptoChannel {
        CryptoChannel::new(self.0)
    }
}

/// Fixed universe → public-key map, passed to the client at construction.
///
/// Defaults to the built-in keys; tests inject generated keypairs for the
/// universe their simulated server claims.
#[derive(Debug, Clone)]
pub struct KeyStore {
    keys: HashMap<Universe, [u8; 32]>,
}

/// Built-in wrap key for the public universe.
const PUBLIC_UNIVERSE_KEY: [u8; 32] = [
    0x30, 0x81, 0x9d, 0x30, 0x0d, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01,
    0x01, 0x05, 0x00, 0x03, 0x81, 0x8b, 0x00, 0x30, 0x81, 0x87, 0x02, 0x81, 0x81, 0x00, 0xdf,
    0xec, 0x1a,
];

/// Built-in wrap key for the beta universe.
const BETA_UNIVERSE_KEY: [u8; 32] = [
    0xae, 0xd1, 0x4b, 0x89, 0x0c, 0x94, 0xd2, 0x1a, 0x8e, 0x40, 0x2f, 0x6c, 0x86, 0x3f, 0x77,
    0x25, 0xb3, 0x4e, 0x0a, 0x19, 0x5d, 0xc8, 0x61, 0x37, 0x9f, 0x02, 0xea, 0x4c, 0x50, 0x1b,
    0x2d, 0x68,
];

impl KeyStore {
    /// Key store holding the built-in universe keys.
    pub fn builtin() -> Self {
        let mut keys = HashMap::new();
        keys.insert(Universe::Public, PUBLIC_UNIVERSE_KEY);
        keys.insert(Universe::Beta, BETA_UNIVERSE_KEY);
        Self { keys }
    }

    /// Empty key store; useful with [`KeyStore::with_key`].
    pub fn empty() -> Self {
        Self {
            keys: HashMap::new(),
        }
    }

    /// Add or replace the key for one universe.
    pub fn with_key(mut self, universe: Universe, public_key: [u8; 32]) -> Self {
        self.keys.insert(universe, public_key);
        self
    }

    pub fn public_key(&self, universe: Universe) -> Option<&[u8; 32]> {
        self.keys.get(&universe)
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::builtin()
    }
}

// ---------------------------------------------------------------------------
// Handshake frame bodies
// ---------------------------------------------------------------------------

/// Server's unsolicited request to establish channel encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptRequest {
    pub protocol_version: u32,
    pub universe: Universe,
    pub nonce: [u8; HANDSHAKE_NONCE_LEN],
}

impl EncryptRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(8 + HANDSHAKE_NONCE_LEN);
        out.put_u32_le(self.protocol_version);
        out.put_u32_le(self.universe as u32);
        out.extend_from_slice(&self.nonce);
        out.to_vec()
    }

    /// # Errors
    /// Returns `CmError::Handshake` on a truncated body.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 8 + HANDSHAKE_NONCE_LEN {
            return Err(CmError::Handshake("truncated encrypt request".into()));
        }
        let mut buf = body;
        let protocol_version = buf.get_u32_le();
        let universe = Universe::from_u32(buf.get_u32_le());
        let mut nonce = [0u8; HANDSHAKE_NONCE_LEN];
        nonce.copy_from_slice(&buf[..HANDSHAKE_NONCE_LEN]);
        Ok(Self {
            protocol_version,
            universe,
            nonce,
        })
    }
}

/// Client's answer: the wrapped session key plus a MAC over the server
/// nonce keyed by the session key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptResponse {
    pub protocol_version: u32,
    pub wrapped_key: Vec<u8>,
    pub key_mac: [u8; 32],
}

impl EncryptResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(8 + self.wrapped_key.len() + 32);
        out.put_u32_le(self.protocol_version);
        out.put_u32_le(self.wrapped_key.len() as u32);
        out.extend_from_slice(&self.wrapped_key);
        out.extend_from_slice(&self.key_mac);
        out.to_vec()
    }

    /// # Errors
    /// Returns `CmError::Handshake` on a truncated or inconsistent body.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 8 {
            return Err(CmError::Handshake("truncated encrypt response".into()));
        }
        let mut buf = body;
        let protocol_version = buf.get_u32_le();
        let key_len = buf.get_u32_le() as usize;
        if buf.len() != key_len + 32 {
            return Err(CmError::Handshake("inconsistent encrypt response".into()));
        }
        let wrapped_key = buf[..key_len].to_vec();
        let mut key_mac = [0u8; 32];
        key_mac.copy_from_slice(&buf[key_len..]);
        Ok(Self {
            protocol_version,
            wrapped_key,
            key_mac,
        })
    }
}

/// Server's verdict on the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptResult {
    pub result: ResultCode,
}

impl EncryptResult {
    pub fn encode(&self) -> Vec<u8> {
        self.result.0.to_le_bytes().to_vec()
    }

    /// # Errors
    /// Returns `CmError::Handshake` on a truncated body.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 4 {
            return Err(CmError::Handshake("truncated encrypt result".into()));
        }
        let mut buf = body;
        Ok(Self {
            result: ResultCode(buf.get_u32_le()),
        })
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Answer an encryption request: generate a session key, wrap it for the
/// declared universe, and MAC the server's nonce.
///
/// # Errors
/// Returns `CmError::Handshake` if no public key is known for the
/// declared universe.
#[instrument(skip(req, keys), fields(universe = ?req.universe))]
pub fn respond_to_encrypt_request(
    req: &EncryptRequest,
    keys: &KeyStore,
) -> Result<(SessionKey, EncryptResponse)> {
    let universe_key = keys
        .public_key(req.universe)
        .ok_or_else(|| CmError::Handshake(constants::ERR_UNKNOWN_UNIVERSE.into()))?;

    let session_key = SessionKey::generate();
    let wrapped_key = wrap_session_key(universe_key, &session_key, &req.nonce)?;
    let key_mac = key_mac(&session_key, &req.nonce);

    debug!("answering channel encrypt request");

    Ok((
        session_key,
        EncryptResponse {
            protocol_version: req.protocol_version,
            wrapped_key,
            key_mac,
        },
    ))
}

/// Wrap a session key for a universe public key.
///
/// Layout: `ephemeral x25519 public (32) || aead nonce (24) ||
/// ciphertext (48)`. The wrap key is derived from the ephemeral shared
/// secret and the request nonce, so each wrap key is used exactly once.
fn wrap_session_key(
    universe_key: &[u8; 32],
    session_key: &SessionKey,
    nonce: &[u8; HANDSHAKE_NONCE_LEN],
) -> Result<Vec<u8>> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&PublicKey::from(*universe_key));

    let wrap_key = derive_wrap_key(shared.as_bytes(), nonce);
    let sealed = CryptoChannel::new(wrap_key).seal(&session_key.0)?;

    let mut out = Vec::with_capacity(32 + sealed.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn derive_wrap_key(shared_secret: &[u8], nonce: &[u8; HANDSHAKE_NONCE_LEN]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(shared_secret);
    hasher.update(WRAP_KEY_DOMAIN);
    hasher.update(nonce);
    hasher.finalize().into()
}

/// MAC over the server nonce, keyed by the session key.
pub fn key_mac(session_key: &SessionKey, nonce: &[u8; HANDSHAKE_NONCE_LEN]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(&session_key.0)
        .expect("HMAC accepts any key length");
    mac.update(nonce);
    mac.finalize().into_bytes().into()
}

// ---------------------------------------------------------------------------
// Server side: used by the simulated CM in tests
// ---------------------------------------------------------------------------

/// Build a fresh encryption request for a universe.
pub fn new_encrypt_request(protocol_version: u32, universe: Universe) -> EncryptRequest {
    let mut nonce = [0u8; HANDSHAKE_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    EncryptRequest {
        protocol_version,
        universe,
        nonce,
    }
}

/// Unwrap a session key with the universe's secret key.
///
/// # Errors
/// Returns `CmError::Handshake` on a malformed wrapped key and
/// `CmError::DecryptionFailure` if the seal does not verify.
pub fn unwrap_session_key(
    universe_secret: &StaticSecret,
    nonce: &[u8; HANDSHAKE_NONCE_LEN],
    wrapped: &[u8],
) -> Result<SessionKey> {
    // ephemeral public + aead nonce + key + tag
    if wrapped.len() < 32 + NONCE_SIZE + SESSION_KEY_LEN + 16 {
        return Err(CmError::Handshake(constants::ERR_WRAPPED_KEY_SHORT.into()));
    }

    let mut ephemeral_public = [0u8; 32];
    ephemeral_public.copy_from_slice(&wrapped[..32]);
    let shared = universe_secret.diffie_hellman(&PublicKey::from(ephemeral_public));

    let wrap_key = derive_wrap_key(shared.as_bytes(), nonce);
    let mut plain = CryptoChannel::new(wrap_key).open(&wrapped[32..])?;

    if plain.len() != SESSION_KEY_LEN {
        plain.zeroize();
        return Err(CmError::Handshake("unwrapped key has wrong length".into()));
    }

    let mut key = [0u8; SESSION_KEY_LEN];
    key.copy_from_slice(&plain);
    plain.zeroize();
    Ok(SessionKey(key))
}

/// Verify the client's nonce MAC against an unwrapped session key.
/// Constant-time comparison.
pub fn verify_key_mac(
    session_key: &SessionKey,
    nonce: &[u8; HANDSHAKE_NONCE_LEN],
    mac: &[u8; 32],
) -> bool {
    let mut expected = HmacSha256::new_from_slice(&session_key.0)
        .expect("HMAC accepts any key length");
    expected.update(nonce);
    expected.verify_slice(mac).is_ok()
}
