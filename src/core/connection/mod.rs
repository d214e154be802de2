//! Peer bootstrap: broker client and WebRTC session setup.
//!
//! Signaling is non-trickle. Each side gathers all ICE candidates first and
//! then sends one session description through the broker as an opaque
//! `signal` payload shaped like `{"type": "offer"|"answer", "sdp": "..."}`.

pub mod peer;
pub mod signaling;
