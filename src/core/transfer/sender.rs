//! Sender transfer session.
//!
//! Per file:
//!   1. Hash the whole file (SHA3-256) from a first pass over the source.
//!   2. Send `Metadata`.
//!   3. Stream chunks in batches: each batch is encoded concurrently on the
//!      blocking pool, then handed to the channel in order. After every
//!      batch the session yields to backpressure.
//!   4. If the receiver already acked (it finalizes as soon as the declared
//!      byte count arrives), skip the completion frame. Otherwise send
//!      `Done` and wait a bounded time for `Ack`.
//!
//! Files are strictly sequential: the next file's `Metadata` never goes out
//! before the previous file's ack arrived or timed out.

use super::ack::{AckOutcome, AckTracker};
use super::codec::{ChunkCodec, EncryptionFallback};
use super::flow::FlowController;
use super::frame::{encode_control, ControlMessage, TransferMetadata};
use super::lanes::LaneScheduler;
use super::progress::ThroughputMeter;
use super::source::{chunk_size_for, read_chunk, should_compress, ByteStream, FileSource};
use super::{notify, EventSender, TransferError, TransferEvent, TransferStatus};
use crate::core::channel::Channel;
use crate::core::config::{
    ACK_PRECHECK_WINDOW, ACK_TIMEOUT, CHUNK_BATCH_SIZE, SENDER_SAMPLE_INTERVAL,
};
use crate::utils::crypto::{ContentHash, ContentHasher, SessionKey};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Session key from the key agreement. `None` sends in clear.
    pub encryption_key: Option<SessionKey>,
    /// Allow compression of textual files.
    pub compression: bool,
    /// Number of logical lanes; `None` uses the single-lane path.
    pub lanes: Option<usize>,
    pub encryption_fallback: EncryptionFallback,
    pub ack_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            encryption_key: None,
            compression: true,
            lanes: None,
            encryption_fallback: EncryptionFallback::default(),
            ack_timeout: ACK_TIMEOUT,
        }
    }
}

/// Record of a file that went through the full handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct SentFile {
    pub file_id: Uuid,
    pub name: String,
    pub size: u64,
    pub ack: AckOutcome,
}

pub struct TransferSession {
    flow: Arc<FlowController>,
    acks: AckTracker,
    options: SessionOptions,
    events: Option<EventSender>,
    sent: Vec<SentFile>,
}

impl TransferSession {
    pub fn new(
        channel: Arc<dyn Channel>,
        acks: AckTracker,
        options: SessionOptions,
        events: Option<EventSender>,
    ) -> Self {
        Self::with_flow(Arc::new(FlowController::new(channel)), acks, options, events)
    }

    pub fn with_flow(
        flow: Arc<FlowController>,
        acks: AckTracker,
        options: SessionOptions,
        events: Option<EventSender>,
    ) -> Self {
        Self {
            flow,
            acks,
            options,
            events,
            sent: Vec::new(),
        }
    }

    /// Files sent so far in this session.
    pub fn sent(&self) -> &[SentFile] {
        &self.sent
    }

    /// Send a text message as a single control frame.
    pub async fn send_text(&self, content: &str) -> Result<(), TransferError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let frame = encode_control(&ControlMessage::Text {
            content: content.to_string(),
            timestamp,
        })?;
        self.flow.safe_send(frame).await?;
        Ok(())
    }

    /// Send every file in order, one full handshake at a time.
    pub async fn send_all(
        &mut self,
        sources: &[Box<dyn FileSource>],
    ) -> Result<Vec<SentFile>, TransferError> {
        let total = sources.len();
        let mut results = Vec::with_capacity(total);
        for (index, source) in sources.iter().enumerate() {
            notify(
                &self.events,
                TransferEvent::Status(TransferStatus::Sending {
                    index,
                    total,
                    name: source.name().to_string(),
                }),
            );
            results.push(self.send(source.as_ref()).await?);
        }
        notify(&self.events, TransferEvent::Status(TransferStatus::AllFilesSent));
        Ok(results)
    }

    /// Run the complete metadata -> chunks -> completion -> ack handshake for
    /// one file.
    pub async fn send(&mut self, source: &dyn FileSource) -> Result<SentFile, TransferError> {
        let name = source.name().to_string();
        let size = source.size();

        notify(
            &self.events,
            TransferEvent::Status(TransferStatus::Hashing { name: name.clone() }),
        );
        let content_hash = hash_source(source).await?;

        let compressed = self.options.compression && should_compress(&name, source.mime_type());
        let file_id = Uuid::new_v4();
        let metadata = TransferMetadata {
            file_id,
            name: name.clone(),
            size,
            mime_type: source.mime_type().to_string(),
            compressed,
            encrypted: self.options.encryption_key.is_some(),
            content_hash: Some(content_hash),
        };

        self.acks.register(file_id);
        let result = self.transmit(source, metadata).await;
        self.acks.forget(file_id);
        let ack = result?;

        let record = SentFile {
            file_id,
            name,
            size,
            ack,
        };
        self.sent.push(record.clone());
        Ok(record)
    }

    async fn transmit(
        &self,
        source: &dyn FileSource,
        metadata: TransferMetadata,
    ) -> Result<AckOutcome, TransferError> {
        let file_id = metadata.file_id;
        let size = metadata.size;
        let codec = Arc::new(ChunkCodec::new(
            self.options.encryption_key.clone(),
            metadata.compressed,
            self.options.encryption_fallback,
        ));

        info!(
            event = "file_send_start",
            %file_id,
            name = %metadata.name,
            size,
            compressed = metadata.compressed,
            encrypted = metadata.encrypted,
            "Sending file"
        );
        self.flow.safe_send(encode_control(&ControlMessage::Metadata(metadata))?).await?;

        let chunk_size = chunk_size_for(size);
        let mut lanes = self
            .options
            .lanes
            .map(|k| LaneScheduler::new(self.flow.clone(), k));
        let batch_size = lanes.as_ref().map(|l| l.lane_count()).unwrap_or(CHUNK_BATCH_SIZE);
        let mut meter = ThroughputMeter::new(size, SENDER_SAMPLE_INTERVAL);
        let mut reader = source.open().await?;

        loop {
            let batch = read_batch(&mut reader, chunk_size, batch_size).await?;
            if batch.is_empty() {
                break;
            }
            let (frames, raw_bytes) = encode_batch(&codec, batch).await?;

            match lanes.as_mut() {
                Some(lanes) => lanes.dispatch(frames).await?,
                None => {
                    for frame in frames {
                        self.flow.safe_send(frame).await?;
                    }
                    self.flow.relieve_pressure().await?;
                }
            }

            if let Some(progress) = meter.record(raw_bytes) {
                notify(&self.events, TransferEvent::Progress(progress));
            }
        }

        if let Some(lanes) = lanes.as_mut() {
            lanes.drain_all().await?;
        }
        notify(&self.events, TransferEvent::Progress(meter.snapshot()));

        if self.acks.is_acknowledged(file_id)
            || self.acks.wait(file_id, ACK_PRECHECK_WINDOW).await
        {
            info!(event = "file_already_acked", %file_id, "Receiver finalized from byte count");
            return Ok(AckOutcome::AlreadyAcknowledged);
        }

        self.flow.settle().await?;
        self.flow
            .safe_send(encode_control(&ControlMessage::Done { file_id })?)
            .await?;
        notify(
            &self.events,
            TransferEvent::Status(TransferStatus::AwaitingAck { file_id }),
        );

        if self.acks.wait(file_id, self.options.ack_timeout).await {
            info!(event = "file_acked", %file_id, "File acknowledged");
            Ok(AckOutcome::Acknowledged)
        } else {
            warn!(
                event = "ack_timeout",
                %file_id,
                timeout_ms = self.options.ack_timeout.as_millis() as u64,
                "No ack within timeout, continuing"
            );
            Ok(AckOutcome::TimedOut)
        }
    }
}

/// Whole-file hash from a dedicated pass over the source.
async fn hash_source(source: &dyn FileSource) -> Result<ContentHash, TransferError> {
    let mut reader = source.open().await?;
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; 256 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

async fn read_batch(
    reader: &mut ByteStream,
    chunk_size: usize,
    batch_size: usize,
) -> Result<Vec<Vec<u8>>, TransferError> {
    let mut batch = Vec::with_capacity(batch_size);
    for _ in 0..batch_size {
        let chunk = read_chunk(reader, chunk_size).await?;
        if chunk.is_empty() {
            break;
        }
        let short = chunk.len() < chunk_size;
        batch.push(chunk);
        if short {
            break;
        }
    }
    Ok(batch)
}

/// Encode a batch concurrently; frames come back in input order.
async fn encode_batch(
    codec: &Arc<ChunkCodec>,
    batch: Vec<Vec<u8>>,
) -> Result<(Vec<Bytes>, u64), TransferError> {
    let handles: Vec<_> = batch
        .into_iter()
        .map(|chunk| {
            let codec = codec.clone();
            tokio::task::spawn_blocking(move || {
                codec.encode(&chunk).map(|frame| (frame, chunk.len() as u64))
            })
        })
        .collect();

    let mut frames = Vec::with_capacity(handles.len());
    let mut raw_bytes = 0;
    for handle in handles {
        let (frame, len) = handle.await??;
        frames.push(frame);
        raw_bytes += len;
    }
    Ok((frames, raw_bytes))
}
