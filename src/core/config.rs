//! Centralized configuration constants for Duodrop.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format constants (frame type bytes, chunk flag
//! bits, IV length) stay in their respective modules.

use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Chunk size tiers as `(exclusive file-size ceiling, chunk size)`.
/// Files at or above the last ceiling use [`CHUNK_SIZE_MAX`].
pub const CHUNK_SIZE_TIERS: [(u64, usize); 3] = [
    (1024 * 1024, 32 * 1024),
    (10 * 1024 * 1024, 64 * 1024),
    (100 * 1024 * 1024, 128 * 1024),
];

/// Chunk size for files of 100 MiB and more.
pub const CHUNK_SIZE_MAX: usize = 256 * 1024;

/// Chunks encoded concurrently before they are handed to the channel in order.
pub const CHUNK_BATCH_SIZE: usize = 3;

/// A compressed chunk is only kept when it is at most this fraction of the
/// original length.
pub const COMPRESSION_KEEP_RATIO: f64 = 0.9;

/// Minimum interval between sender throughput samples.
pub const SENDER_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Minimum interval between receiver throughput samples.
pub const RECEIVER_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

// ── Flow control ─────────────────────────────────────────────────────────────

/// High water mark for buffered bytes on the physical channel. Above this
/// the sender stops issuing sends until the channel drains.
pub const BUFFERED_AMOUNT_HIGH: usize = 2_000_000;

/// Threshold at which a channel fires its drain signal.
pub const BUFFERED_AMOUNT_LOW: usize = 64_000;

/// Lanes flush their queues while buffered bytes stay below this mark.
pub const LANE_FLUSH_THRESHOLD: usize = 1_000_000;

/// Default number of logical lanes for multi-lane fan-out.
pub const DEFAULT_LANE_COUNT: usize = 3;

/// Poll backstop while waiting for a drain signal.
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ── Acknowledgement ──────────────────────────────────────────────────────────

/// Bounded wait for a per-file ack after the completion frame. Non-fatal.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Grace period for the "already acknowledged" check before sending the
/// completion frame.
pub const ACK_PRECHECK_WINDOW: Duration = Duration::from_millis(50);

/// Attempts made by the receiver when an ack send fails transiently.
pub const ACK_SEND_ATTEMPTS: u32 = 3;

/// Delay between ack send attempts.
pub const ACK_RETRY_DELAY: Duration = Duration::from_millis(50);

// ── Receiver ─────────────────────────────────────────────────────────────────

/// Received-file count at which a bulk archive is built.
pub const ARCHIVE_THRESHOLD: usize = 10;

/// Name given to the bulk archive.
pub const ARCHIVE_NAME: &str = "duodrop-files.zip";

// ── Broker ───────────────────────────────────────────────────────────────────

/// Exact room key length after normalization.
pub const ROOM_KEY_LEN: usize = 8;

/// Maximum participants in a room.
pub const ROOM_CAPACITY: usize = 2;

/// Broker events (create, join, signal) allowed per connection per window.
pub const CONNECTION_RATE_LIMIT: u32 = 10;

/// Fixed window for the per-connection event limit.
pub const CONNECTION_RATE_WINDOW: Duration = Duration::from_secs(60);

/// HTTP requests allowed per client IP per sliding window.
pub const HTTP_RATE_LIMIT: u32 = 100;

/// Sliding window for the per-IP request limit.
pub const HTTP_RATE_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Upper bound on request bodies and WebSocket messages (10 MB).
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Upper bound on top-level fields of a relayed signal payload.
pub const MAX_SIGNAL_FIELDS: usize = 32;

/// Default broker listen port.
pub const DEFAULT_BROKER_PORT: u16 = 3001;

// ── Connection / Network ─────────────────────────────────────────────────────

/// Explicit SCTP max message size (1 MiB). Covers the largest chunk tier
/// plus AES-GCM and frame overhead.
pub const SCTP_MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

/// WebRTC peer connection timeout.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout waiting for the data channel to open.
pub const DATA_CHANNEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for ICE candidate gathering.
pub const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout for the key agreement exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a sender waits for the peer to join the room.
pub const PEER_WAIT_TIMEOUT: Duration = Duration::from_secs(600);

/// Delay between join attempts while the room does not exist yet. Keeps a
/// waiting receiver below the per-connection operation budget with room left
/// for its signal messages.
pub const JOIN_RETRY_INTERVAL: Duration = Duration::from_secs(7);

/// Label of the single transfer data channel.
pub const DATA_CHANNEL_LABEL: &str = "duodrop";
