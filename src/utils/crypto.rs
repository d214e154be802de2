//! Cryptographic primitives shared by the transfer pipeline and the key
//! agreement: AES-256-GCM payload encryption, SHA3-256 content hashing,
//! HMAC-SHA3-256 and constant-time comparison.
//!
//! Invariants:
//! - Every ciphertext is `iv (12 bytes) || AES-GCM(ciphertext + tag)`.
//! - A fresh random IV is drawn per call to [`encrypt`]; IVs are never reused
//!   under one key.
//! - HMAC follows RFC 2104 with SHA3-256 (rate = 136 bytes).
//! - Constant-time comparison is used for every tag check.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::fmt;

/// Length of the IV prefixed to every ciphertext.
pub const IV_LEN: usize = 12;

/// SHA3-256 block size (rate in bytes for Keccak with 256-bit capacity).
const BLOCK_SIZE: usize = 136;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("ciphertext too short ({0} bytes)")]
    CiphertextTooShort(usize),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed: authentication tag mismatch or wrong key")]
    Decrypt,
}

// ── Symmetric key ────────────────────────────────────────────────────────────

/// A 256-bit symmetric key scoped to one transfer session.
///
/// The key is derived on both peers by the key agreement and never
/// serialized onto the broker or the data channel.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// Generate a fresh random session key.
pub fn generate_key() -> SessionKey {
    SessionKey(rand::random())
}

/// Encrypt `plaintext`, prepending a fresh random 96-bit IV.
pub fn encrypt(key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(&key.0).map_err(|_| CryptoError::Encrypt)?;
    let iv: [u8; IV_LEN] = rand::random();
    #[allow(deprecated)]
    let nonce = Nonce::from_slice(&iv);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt an `iv || ciphertext` buffer produced by [`encrypt`].
pub fn decrypt(key: &SessionKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < IV_LEN {
        return Err(CryptoError::CiphertextTooShort(data.len()));
    }
    let cipher = Aes256Gcm::new_from_slice(&key.0).map_err(|_| CryptoError::Decrypt)?;
    let (iv, ciphertext) = data.split_at(IV_LEN);
    #[allow(deprecated)]
    let nonce = Nonce::from_slice(iv);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

// ── Content hashing ──────────────────────────────────────────────────────────

/// SHA3-256 digest of a whole file. Hex encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl From<ContentHash> for String {
    fn from(h: ContentHash) -> String {
        h.to_hex()
    }
}

impl TryFrom<String> for ContentHash {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let bytes = hex::decode(&s).map_err(|e| format!("invalid content hash: {e}"))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "content hash must be 32 bytes".to_string())?;
        Ok(Self(arr))
    }
}

/// Hash a complete buffer.
pub fn hash(bytes: &[u8]) -> ContentHash {
    ContentHash(Sha3_256::digest(bytes).into())
}

/// Incremental hasher for content read in pieces.
#[derive(Default)]
pub struct ContentHasher(Sha3_256);

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finalize(self) -> ContentHash {
        ContentHash(self.0.finalize().into())
    }
}

// ── HMAC ─────────────────────────────────────────────────────────────────────

/// HMAC-SHA3-256 (RFC 2104 construction with SHA3-256).
///
/// Used by the key agreement to authenticate offered public keys and to
/// derive the session key.
pub fn hmac_sha3_256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let actual_key = prepare_key(key);
    let (ipad, opad) = compute_pads(&actual_key);

    // Inner hash: H(ipad || data)
    let inner_hash = {
        let mut inner = Sha3_256::new();
        inner.update(ipad);
        inner.update(data);
        inner.finalize()
    };

    // Outer hash: H(opad || inner_hash)
    let mut outer = Sha3_256::new();
    outer.update(opad);
    outer.update(inner_hash);
    outer.finalize().into()
}

/// Hash the key if too long, zero-pad it if too short.
fn prepare_key(key: &[u8]) -> [u8; BLOCK_SIZE] {
    let mut k = [0u8; BLOCK_SIZE];
    if key.len() > BLOCK_SIZE {
        k[..32].copy_from_slice(&Sha3_256::digest(key));
    } else {
        k[..key.len()].copy_from_slice(key);
    }
    k
}

fn compute_pads(key: &[u8; BLOCK_SIZE]) -> ([u8; BLOCK_SIZE], [u8; BLOCK_SIZE]) {
    let mut ipad = [0x36u8; BLOCK_SIZE];
    let mut opad = [0x5cu8; BLOCK_SIZE];
    for i in 0..BLOCK_SIZE {
        ipad[i] ^= key[i];
        opad[i] ^= key[i];
    }
    (ipad, opad)
}

/// Constant-time comparison of two 32-byte values.
pub fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    let mut diff = 0u8;
    for i in 0..32 {
        diff |= a[i] ^ b[i];
    }
    diff == 0
}
