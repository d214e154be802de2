//! Data channel frame encoding/decoding.
//!
//! Every message on the data channel uses this envelope:
//!
//!   [1 byte: frame_type] [N bytes: payload]
//!
//! Frame types:
//!   0x01 = Control (JSON-encoded [`ControlMessage`])
//!   0x02 = Chunk   ([1 byte: flags] [chunk body])
//!
//! Chunk flags:
//!   bit 0 = body is gzip-compressed
//!   bit 1 = body is AES-256-GCM encrypted (`iv || ciphertext`)
//!
//! Chunks carry no file id or sequence number; they belong to the file
//! announced by the most recent `Metadata` frame and arrive in send order.

use crate::utils::crypto::ContentHash;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Frame type marker for control messages.
pub const FRAME_CONTROL: u8 = 0x01;

/// Frame type marker for binary chunk data.
pub const FRAME_CHUNK: u8 = 0x02;

pub const FLAG_COMPRESSED: u8 = 0b0000_0001;
pub const FLAG_ENCRYPTED: u8 = 0b0000_0010;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame type 0x{0:02x}")]
    UnknownType(u8),
    #[error("chunk frame without flag byte")]
    TruncatedChunk,
    #[error("malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Per-file header sent before any chunk of that file. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMetadata {
    pub file_id: Uuid,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub compressed: bool,
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<ContentHash>,
}

/// Control messages, JSON-serialized and sent as `FRAME_CONTROL` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    Metadata(TransferMetadata),
    #[serde(rename_all = "camelCase")]
    Done { file_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Ack { file_id: Uuid },
    Text { content: String, timestamp: u64 },
    /// Ephemeral X25519 public key plus its room-key HMAC, both hex.
    #[serde(rename_all = "camelCase")]
    KeyOffer { public_key: String, tag: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPayload {
    pub flags: u8,
    pub body: Bytes,
}

impl ChunkPayload {
    pub fn compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(ControlMessage),
    Chunk(ChunkPayload),
}

/// Encode a control frame: `[0x01][json bytes]`.
pub fn encode_control(msg: &ControlMessage) -> Result<Bytes, FrameError> {
    let json = serde_json::to_vec(msg)?;
    let mut buf = BytesMut::with_capacity(1 + json.len());
    buf.put_u8(FRAME_CONTROL);
    buf.extend_from_slice(&json);
    Ok(buf.freeze())
}

/// Encode a chunk frame: `[0x02][flags][body]`.
pub fn encode_chunk(flags: u8, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + body.len());
    buf.put_u8(FRAME_CHUNK);
    buf.put_u8(flags);
    buf.extend_from_slice(body);
    buf.freeze()
}

pub fn decode(data: Bytes) -> Result<Frame, FrameError> {
    let Some(&tag) = data.first() else {
        return Err(FrameError::Empty);
    };
    match tag {
        FRAME_CONTROL => Ok(Frame::Control(serde_json::from_slice(&data[1..])?)),
        FRAME_CHUNK => {
            if data.len() < 2 {
                return Err(FrameError::TruncatedChunk);
            }
            Ok(Frame::Chunk(ChunkPayload {
                flags: data[1],
                body: data.slice(2..),
            }))
        }
        other => Err(FrameError::UnknownType(other)),
    }
}
