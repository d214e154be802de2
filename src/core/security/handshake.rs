//! In-band key agreement over the data channel.
//!
//! ```text
//! Peer A                                   Peer B
//! ──────                                   ──────
//! KeyOffer{pk_A, HMAC(room, pk_A)} ──────►
//!                                  ◄────── KeyOffer{pk_B, HMAC(room, pk_B)}
//!
//! shared_secret = X25519(sk_A, pk_B)
//!
//! session_key = HKDF-SHA3-256(
//!     ikm  = shared_secret,
//!     salt = sort(pk_A, pk_B) || room,
//!     info = b"duodrop-session-v1"
//! )
//! ```
//!
//! The exchange is symmetric: both peers send their offer immediately on
//! open and then wait for the other's. Because the channel is ordered, the
//! peer's offer always arrives before any transfer frame it sends.
//!
//! The room key is short and low-entropy. The HMAC only stops a broker that
//! does not know the key from substituting offers; it is not a password
//! protocol.

use crate::core::channel::{Channel, ChannelEvent, ChannelEvents};
use crate::core::config::HANDSHAKE_TIMEOUT;
use crate::core::transfer::frame::{decode, encode_control, ControlMessage, Frame};
use crate::utils::crypto::{constant_time_eq, hmac_sha3_256, SessionKey};
use rand::rngs::OsRng;
use std::time::Duration;
use tracing::{debug, info};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};

const SESSION_INFO: &[u8] = b"duodrop-session-v1";
const OFFER_CONTEXT: &[u8] = b"duodrop-key-offer-v1";

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("channel closed during key agreement")]
    ChannelClosed,
    #[error("channel error during key agreement: {0}")]
    Channel(String),
    #[error("no key offer from peer within {0:?}")]
    Timeout(Duration),
    #[error("malformed key offer: {0}")]
    Malformed(String),
    #[error("key offer failed authentication; room keys differ")]
    BadTag,
    #[error("peer sent a low-order public key")]
    WeakKey,
    #[error("unexpected frame before key agreement finished")]
    UnexpectedFrame,
}

// ── Local offer ──────────────────────────────────────────────────────────────

/// One side's half of the agreement: a single-use X25519 secret and the
/// public key advertised in our `KeyOffer`.
struct LocalOffer {
    secret: EphemeralSecret,
    public: [u8; 32],
}

impl LocalOffer {
    fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    fn message(&self, room_key: &str) -> ControlMessage {
        ControlMessage::KeyOffer {
            public_key: hex::encode(self.public),
            tag: hex::encode(offer_tag(room_key, &self.public)),
        }
    }

    /// Consume the secret against an authenticated peer key.
    fn complete(self, peer_public: &[u8; 32], room_key: &str) -> Result<SessionKey, HandshakeError> {
        let shared = self
            .secret
            .diffie_hellman(&X25519PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(HandshakeError::WeakKey);
        }
        Ok(derive_session_key(
            shared.as_bytes(),
            &self.public,
            peer_public,
            room_key,
        ))
    }
}

// ── Session key derivation (HKDF-SHA3-256) ───────────────────────────────────

pub fn derive_session_key(
    shared_secret: &[u8; 32],
    local_public: &[u8; 32],
    remote_public: &[u8; 32],
    room_key: &str,
) -> SessionKey {
    let mut pks = [*local_public, *remote_public];
    pks.sort();

    let mut salt = Vec::with_capacity(64 + room_key.len());
    salt.extend_from_slice(&pks[0]);
    salt.extend_from_slice(&pks[1]);
    salt.extend_from_slice(room_key.as_bytes());
    let prk = hmac_sha3_256(&salt, shared_secret);

    let mut expand_msg = Vec::with_capacity(SESSION_INFO.len() + 1);
    expand_msg.extend_from_slice(SESSION_INFO);
    expand_msg.push(0x01);
    SessionKey::from_bytes(hmac_sha3_256(&prk, &expand_msg))
}

fn offer_tag(room_key: &str, public: &[u8; 32]) -> [u8; 32] {
    let mut data = Vec::with_capacity(OFFER_CONTEXT.len() + 32);
    data.extend_from_slice(OFFER_CONTEXT);
    data.extend_from_slice(public);
    hmac_sha3_256(room_key.as_bytes(), &data)
}

fn parse_hex32(field: &str, value: &str) -> Result<[u8; 32], HandshakeError> {
    let bytes = hex::decode(value).map_err(|e| HandshakeError::Malformed(format!("{field}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| HandshakeError::Malformed(format!("{field}: expected 32 bytes")))
}

// ── Handshake ────────────────────────────────────────────────────────────────

/// Agree on a session key with the peer on the other end of `channel`.
///
/// Must run before the frame dispatcher takes over `events`.
pub async fn agree_session_key(
    channel: &dyn Channel,
    events: &mut ChannelEvents,
    room_key: &str,
) -> anyhow::Result<SessionKey> {
    let local = LocalOffer::new();
    channel.send(encode_control(&local.message(room_key))?).await?;
    debug!(channel = %channel.label(), "Key offer sent");

    let (peer_public, peer_tag) = tokio::time::timeout(HANDSHAKE_TIMEOUT, next_offer(events))
        .await
        .map_err(|_| HandshakeError::Timeout(HANDSHAKE_TIMEOUT))??;

    let peer_public = parse_hex32("publicKey", &peer_public)?;
    let peer_tag = parse_hex32("tag", &peer_tag)?;
    if !constant_time_eq(&offer_tag(room_key, &peer_public), &peer_tag) {
        return Err(HandshakeError::BadTag.into());
    }

    let key = local.complete(&peer_public, room_key)?;
    info!(event = "key_agreed", channel = %channel.label(), "Session key agreed");
    Ok(key)
}

async fn next_offer(events: &mut ChannelEvents) -> Result<(String, String), HandshakeError> {
    loop {
        match events.recv().await {
            Some(ChannelEvent::Open) => continue,
            Some(ChannelEvent::Message(data)) => {
                return match decode(data) {
                    Ok(Frame::Control(ControlMessage::KeyOffer { public_key, tag })) => {
                        Ok((public_key, tag))
                    }
                    Ok(_) => Err(HandshakeError::UnexpectedFrame),
                    Err(e) => Err(HandshakeError::Malformed(e.to_string())),
                };
            }
            Some(ChannelEvent::Error(reason)) => return Err(HandshakeError::Channel(reason)),
            Some(ChannelEvent::Close) | None => return Err(HandshakeError::ChannelClosed),
        }
    }
}
