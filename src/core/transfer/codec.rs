//! Per-chunk encoding pipeline: optional gzip, then optional AES-256-GCM.
//!
//! Failures never silently drop data. Compression failure always falls back
//! to the raw chunk. Encryption failure follows [`EncryptionFallback`].
//! Whatever was actually applied is recorded in the chunk flag byte, so the
//! receiver never has to guess.

use super::frame::{encode_chunk, ChunkPayload, FLAG_COMPRESSED, FLAG_ENCRYPTED};
use super::TransferError;
use crate::core::config::CHUNK_SIZE_MAX;
use crate::utils::compression;
use crate::utils::crypto::{self, SessionKey};
use bytes::Bytes;
use std::borrow::Cow;
use tracing::warn;

/// What to do when a chunk cannot be encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionFallback {
    /// Send the chunk unencrypted and flag it as such.
    #[default]
    PassThrough,
    /// Abort the transfer.
    Abort,
}

#[derive(Debug, Clone)]
pub struct ChunkCodec {
    key: Option<SessionKey>,
    compress: bool,
    fallback: EncryptionFallback,
}

impl ChunkCodec {
    pub fn new(key: Option<SessionKey>, compress: bool, fallback: EncryptionFallback) -> Self {
        Self {
            key,
            compress,
            fallback,
        }
    }

    /// Encode one raw chunk into a complete chunk frame.
    pub fn encode(&self, chunk: &[u8]) -> Result<Bytes, TransferError> {
        let mut flags = 0u8;
        let mut body: Cow<[u8]> = Cow::Borrowed(chunk);

        if self.compress {
            match compression::compress_if_smaller(chunk) {
                Ok(Some(packed)) => {
                    flags |= FLAG_COMPRESSED;
                    body = Cow::Owned(packed);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(event = "compress_fallback", bytes = chunk.len(), error = %e, "Compression failed, sending chunk uncompressed");
                }
            }
        }

        if let Some(key) = &self.key {
            match crypto::encrypt(key, &body) {
                Ok(ct) => {
                    flags |= FLAG_ENCRYPTED;
                    body = Cow::Owned(ct);
                }
                Err(e) => match self.fallback {
                    EncryptionFallback::PassThrough => {
                        warn!(event = "encrypt_fallback", bytes = body.len(), error = %e, "Encryption failed, sending chunk in clear");
                    }
                    EncryptionFallback::Abort => return Err(e.into()),
                },
            }
        }

        Ok(encode_chunk(flags, &body))
    }
}

/// Reverse [`ChunkCodec::encode`] for one received chunk.
///
/// A chunk that fails to decrypt or decompress is passed through as-is; the
/// whole-file hash check then reports the file as unverified.
pub fn decode_chunk(key: Option<&SessionKey>, payload: ChunkPayload) -> Bytes {
    let mut data = payload.body.clone();

    if payload.encrypted() {
        match key.map(|k| crypto::decrypt(k, &data)) {
            Some(Ok(plain)) => data = Bytes::from(plain),
            Some(Err(e)) => {
                warn!(event = "decrypt_fallback", bytes = data.len(), error = %e, "Chunk decryption failed, keeping raw bytes");
                return data;
            }
            None => {
                warn!(event = "decrypt_fallback", bytes = data.len(), "Encrypted chunk but no session key, keeping raw bytes");
                return data;
            }
        }
    }

    if payload.compressed() {
        match compression::decompress(&data, CHUNK_SIZE_MAX) {
            Ok(plain) => data = Bytes::from(plain),
            Err(e) => {
                warn!(event = "decompress_fallback", bytes = data.len(), error = %e, "Chunk decompression failed, keeping raw bytes");
            }
        }
    }

    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transfer::frame::{decode, Frame};
    use crate::utils::crypto::generate_key;

    fn chunk_of(frame: Bytes) -> ChunkPayload {
        match decode(frame).unwrap() {
            Frame::Chunk(c) => c,
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[test]
    fn test_compress_and_encrypt_roundtrip() {
        let key = generate_key();
        let codec = ChunkCodec::new(Some(key.clone()), true, EncryptionFallback::default());
        let text = "line of log output\n".repeat(1000);

        let chunk = chunk_of(codec.encode(text.as_bytes()).unwrap());
        assert!(chunk.compressed());
        assert!(chunk.encrypted());
        assert_eq!(&decode_chunk(Some(&key), chunk)[..], text.as_bytes());
    }

    #[test]
    fn test_incompressible_chunk_passes_unchanged() {
        let codec = ChunkCodec::new(None, true, EncryptionFallback::default());
        let noise: Vec<u8> = (0..4096).map(|_| rand::random::<u8>()).collect();

        let chunk = chunk_of(codec.encode(&noise).unwrap());
        assert_eq!(chunk.flags, 0);
        assert_eq!(&chunk.body[..], &noise[..]);
    }

    #[test]
    fn test_plain_codec_sets_no_flags() {
        let codec = ChunkCodec::new(None, false, EncryptionFallback::default());
        let text = "aaaa".repeat(1000);
        let chunk = chunk_of(codec.encode(text.as_bytes()).unwrap());
        assert_eq!(chunk.flags, 0);
        assert_eq!(&decode_chunk(None, chunk)[..], text.as_bytes());
    }

    #[test]
    fn test_decrypt_failure_keeps_raw_bytes() {
        let codec = ChunkCodec::new(Some(generate_key()), false, EncryptionFallback::default());
        let chunk = chunk_of(codec.encode(b"payload").unwrap());
        let raw = chunk.body.clone();
        assert_eq!(decode_chunk(Some(&generate_key()), chunk), raw);
    }
}
