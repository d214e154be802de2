//! Session key agreement between the two peers of a room.
//!
//! Provides:
//! - Ephemeral X25519 key pairs, one per session
//! - Key offers authenticated with an HMAC keyed by the room key
//! - HKDF-SHA3-256 session key derivation

pub mod handshake;
