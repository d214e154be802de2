//! Transfer-session protocol layered on a [`Channel`](crate::core::channel::Channel).
//!
//! # Protocol Overview
//!
//! - Every frame starts with a 1-byte type tag: control (JSON) or chunk (binary)
//! - Per file: `Metadata` -> chunk* -> `Done` -> `Ack`
//! - Files go strictly one at a time; the next `Metadata` is only sent once
//!   the previous file's ack arrived or timed out
//! - Chunks may be gzip-compressed (kept only if >= 10% smaller) and then
//!   AES-256-GCM encrypted; a per-chunk flag byte records what was applied
//! - No sequence numbers: ordering relies on the channel
//! - The receiver finalizes on `Done` or as soon as the declared byte count
//!   has arrived, whichever comes first, exactly once per file

pub mod ack;
pub mod archive;
pub mod codec;
pub mod flow;
pub mod frame;
pub mod lanes;
pub mod link;
pub mod progress;
pub mod receiver;
pub mod sender;
pub mod sink;
pub mod source;

use crate::core::channel::ChannelError;
use crate::utils::crypto::CryptoError;
use frame::FrameError;
use progress::Progress;
use std::path::PathBuf;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("channel lost: {0}")]
    ChannelLost(#[from] ChannelError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("worker task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for TransferError {
    fn from(e: tokio::task::JoinError) -> Self {
        TransferError::Task(e.to_string())
    }
}

/// Coarse status updates for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferStatus {
    ChannelOpen,
    Hashing { name: String },
    Sending { index: usize, total: usize, name: String },
    AwaitingAck { file_id: Uuid },
    AllFilesSent,
    Receiving { name: String, size: u64 },
    Received { name: String, integrity_verified: bool },
    ChannelClosed,
    ChannelError(String),
}

/// Events emitted by senders and receivers.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress(Progress),
    Status(TransferStatus),
    TextReceived(String),
    ArchiveReady { files: usize, path: Option<PathBuf> },
}

pub type EventSender = mpsc::UnboundedSender<TransferEvent>;

/// Send an event to the presentation layer, if one is attached.
pub(crate) fn notify(events: &Option<EventSender>, event: TransferEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}
