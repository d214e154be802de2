//! Receiver reassembly state machine.
//!
//! ```text
//!          Metadata                Done | bytes >= size
//!   Idle ───────────► Receiving ───────────────────────► Finalizing ──► Idle
//!                         │                                              ▲
//!                         └──────────── channel lost (discard) ──────────┘
//! ```
//!
//! Both finalize triggers go through the single [`Receiver::finalize`]
//! transition, guarded by the set of finalized file ids, so a file is
//! recorded and acknowledged at most once no matter which trigger wins.

use super::archive::ArchiveBuilder;
use super::codec::decode_chunk;
use super::flow::FlowController;
use super::frame::{encode_control, ChunkPayload, ControlMessage, Frame, TransferMetadata};
use super::progress::ThroughputMeter;
use super::sink::DownloadSink;
use super::{notify, EventSender, TransferError, TransferEvent, TransferStatus};
use crate::core::config::{
    ACK_RETRY_DELAY, ACK_SEND_ATTEMPTS, ARCHIVE_THRESHOLD, RECEIVER_SAMPLE_INTERVAL,
};
use crate::utils::crypto::{self, SessionKey};
use bytes::{Bytes, BytesMut};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A completed file, handed to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFile {
    pub file_id: Uuid,
    pub name: String,
    pub actual_size: u64,
    pub mime_type: String,
    pub bytes: Bytes,
    pub integrity_verified: bool,
    pub encrypted: bool,
    pub saved_to: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedText {
    pub content: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeTrigger {
    Completion,
    ByteCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivePhase {
    Idle,
    Receiving,
    Finalizing,
}

#[derive(Clone)]
pub struct ReceiverOptions {
    pub session_key: Option<SessionKey>,
    pub archive_threshold: usize,
    pub sink: Option<Arc<dyn DownloadSink>>,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            session_key: None,
            archive_threshold: ARCHIVE_THRESHOLD,
            sink: None,
        }
    }
}

/// Everything received over one channel.
#[derive(Debug, Default)]
pub struct ReceiveSummary {
    pub files: Vec<ReceivedFile>,
    pub texts: Vec<ReceivedText>,
    pub archive: Option<Bytes>,
}

struct InFlight {
    metadata: TransferMetadata,
    chunks: Vec<Bytes>,
    received: u64,
    meter: ThroughputMeter,
}

enum ReceiveState {
    Idle,
    Receiving(InFlight),
    Finalizing(Uuid),
}

pub struct Receiver {
    flow: Arc<FlowController>,
    key: Option<SessionKey>,
    state: ReceiveState,
    finalized: HashSet<Uuid>,
    files: Vec<ReceivedFile>,
    texts: Vec<ReceivedText>,
    sink: Option<Arc<dyn DownloadSink>>,
    archive: ArchiveBuilder,
    events: Option<EventSender>,
}

impl Receiver {
    pub fn new(
        flow: Arc<FlowController>,
        options: ReceiverOptions,
        events: Option<EventSender>,
    ) -> Self {
        Self {
            flow,
            key: options.session_key,
            state: ReceiveState::Idle,
            finalized: HashSet::new(),
            files: Vec::new(),
            texts: Vec::new(),
            archive: ArchiveBuilder::new(
                options.archive_threshold,
                options.sink.clone(),
                events.clone(),
            ),
            sink: options.sink,
            events,
        }
    }

    pub fn phase(&self) -> ReceivePhase {
        match self.state {
            ReceiveState::Idle => ReceivePhase::Idle,
            ReceiveState::Receiving(_) => ReceivePhase::Receiving,
            ReceiveState::Finalizing(_) => ReceivePhase::Finalizing,
        }
    }

    pub fn files(&self) -> &[ReceivedFile] {
        &self.files
    }

    pub fn texts(&self) -> &[ReceivedText] {
        &self.texts
    }

    /// Process one inbound frame. Acks are not expected here; the link
    /// routes them to the sender's tracker.
    pub async fn handle_frame(&mut self, frame: Frame) -> Result<(), TransferError> {
        match frame {
            Frame::Control(ControlMessage::Metadata(metadata)) => self.on_metadata(metadata),
            Frame::Control(ControlMessage::Done { file_id }) => self.on_done(file_id).await?,
            Frame::Control(ControlMessage::Text { content, timestamp }) => {
                debug!(event = "text_received", len = content.len(), "Text message received");
                notify(&self.events, TransferEvent::TextReceived(content.clone()));
                self.texts.push(ReceivedText { content, timestamp });
            }
            Frame::Control(ControlMessage::Ack { file_id }) => {
                debug!(%file_id, "Ack reached receiver, ignoring");
            }
            Frame::Control(ControlMessage::KeyOffer { .. }) => {
                warn!(event = "unexpected_key_offer", "Key offer after key agreement, ignoring");
            }
            Frame::Chunk(payload) => self.on_chunk(payload).await?,
        }
        Ok(())
    }

    fn on_metadata(&mut self, metadata: TransferMetadata) {
        if let ReceiveState::Receiving(prev) = &self.state {
            warn!(
                event = "in_flight_preempted",
                file_id = %prev.metadata.file_id,
                received = prev.received,
                "New metadata before previous file completed, discarding it"
            );
        }
        if metadata.encrypted && self.key.is_none() {
            warn!(event = "missing_session_key", file_id = %metadata.file_id, "File is encrypted but no session key is set");
        }
        info!(
            event = "file_receive_start",
            file_id = %metadata.file_id,
            name = %metadata.name,
            size = metadata.size,
            "Receiving file"
        );
        notify(
            &self.events,
            TransferEvent::Status(TransferStatus::Receiving {
                name: metadata.name.clone(),
                size: metadata.size,
            }),
        );
        self.state = ReceiveState::Receiving(InFlight {
            meter: ThroughputMeter::new(metadata.size, RECEIVER_SAMPLE_INTERVAL),
            metadata,
            chunks: Vec::new(),
            received: 0,
        });
    }

    async fn on_chunk(&mut self, payload: ChunkPayload) -> Result<(), TransferError> {
        let ReceiveState::Receiving(file) = &mut self.state else {
            warn!(event = "orphan_chunk", bytes = payload.body.len(), "Chunk without metadata, dropping");
            return Ok(());
        };

        let data = decode_chunk(self.key.as_ref(), payload);
        file.received += data.len() as u64;
        if let Some(progress) = file.meter.record(data.len() as u64) {
            notify(&self.events, TransferEvent::Progress(progress));
        }
        file.chunks.push(data);

        if file.received >= file.metadata.size && !file.chunks.is_empty() {
            self.finalize(FinalizeTrigger::ByteCount).await?;
        }
        Ok(())
    }

    async fn on_done(&mut self, file_id: Uuid) -> Result<(), TransferError> {
        match &self.state {
            ReceiveState::Receiving(file) if file.metadata.file_id == file_id => {
                if file.received == 0 && file.metadata.size > 0 {
                    warn!(
                        event = "empty_completion",
                        %file_id,
                        declared = file.metadata.size,
                        "Completion with no data, discarding file"
                    );
                    self.state = ReceiveState::Idle;
                    self.finalized.insert(file_id);
                    self.send_ack(file_id).await;
                    return Ok(());
                }
                self.finalize(FinalizeTrigger::Completion).await
            }
            _ if self.finalized.contains(&file_id) => {
                debug!(%file_id, "Completion for already finalized file");
                Ok(())
            }
            _ => {
                warn!(event = "unknown_completion", %file_id, "Completion for unknown file, ignoring");
                Ok(())
            }
        }
    }

    /// The single finalize transition. Runs at most once per file id.
    async fn finalize(&mut self, trigger: FinalizeTrigger) -> Result<(), TransferError> {
        let file = match std::mem::replace(&mut self.state, ReceiveState::Idle) {
            ReceiveState::Receiving(file) => file,
            other => {
                self.state = other;
                return Ok(());
            }
        };
        let file_id = file.metadata.file_id;
        if !self.finalized.insert(file_id) {
            return Ok(());
        }
        self.state = ReceiveState::Finalizing(file_id);

        let bytes = assemble(file.chunks, file.received);
        let integrity_verified = match file.metadata.content_hash {
            Some(expected) => {
                let data = bytes.clone();
                let actual = tokio::task::spawn_blocking(move || crypto::hash(&data)).await?;
                actual == expected
            }
            None => true,
        };
        if !integrity_verified {
            warn!(
                event = "integrity_mismatch",
                %file_id,
                name = %file.metadata.name,
                "Content hash mismatch, keeping file flagged as unverified"
            );
        }

        let saved_to = self.deliver(&file.metadata.name, &bytes).await;
        info!(
            event = "file_received",
            %file_id,
            name = %file.metadata.name,
            size = bytes.len(),
            integrity_verified,
            ?trigger,
            "File received"
        );

        self.files.push(ReceivedFile {
            file_id,
            name: file.metadata.name.clone(),
            actual_size: bytes.len() as u64,
            mime_type: file.metadata.mime_type,
            bytes,
            integrity_verified,
            encrypted: file.metadata.encrypted,
            saved_to,
        });
        notify(&self.events, TransferEvent::Progress(file.meter.snapshot()));
        notify(
            &self.events,
            TransferEvent::Status(TransferStatus::Received {
                name: file.metadata.name,
                integrity_verified,
            }),
        );
        self.state = ReceiveState::Idle;

        self.send_ack(file_id).await;
        self.archive.on_files_changed(
            self.files
                .iter()
                .map(|f| (f.name.clone(), f.bytes.clone()))
                .collect(),
        );
        Ok(())
    }

    async fn deliver(&self, name: &str, bytes: &Bytes) -> Option<PathBuf> {
        let sink = self.sink.clone()?;
        let name = name.to_string();
        let data = bytes.clone();
        match tokio::task::spawn_blocking(move || sink.deliver(&name, &data)).await {
            Ok(Ok(path)) => path,
            Ok(Err(e)) => {
                warn!(event = "sink_failure", error = %e, "Failed to store received file");
                None
            }
            Err(e) => {
                warn!(event = "sink_failure", error = %e, "Store task failed");
                None
            }
        }
    }

    /// Send the ack, retrying transient failures. Never fatal.
    async fn send_ack(&self, file_id: Uuid) {
        let frame = match encode_control(&ControlMessage::Ack { file_id }) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(event = "ack_encode_failure", %file_id, error = %e, "Failed to encode ack");
                return;
            }
        };
        for attempt in 1..=ACK_SEND_ATTEMPTS {
            match self.flow.safe_send(frame.clone()).await {
                Ok(_) => return,
                Err(e) if !self.flow.is_open() => {
                    warn!(event = "ack_send_failed", %file_id, error = %e, "Channel closed before ack");
                    return;
                }
                Err(e) => {
                    warn!(event = "ack_retry", %file_id, attempt, error = %e, "Ack send failed, retrying");
                    tokio::time::sleep(ACK_RETRY_DELAY).await;
                }
            }
        }
        warn!(event = "ack_send_failed", %file_id, attempts = ACK_SEND_ATTEMPTS, "Giving up on ack");
    }

    /// Drop any partially received file after the channel closed or failed.
    pub fn on_channel_lost(&mut self) {
        if let ReceiveState::Receiving(file) = std::mem::replace(&mut self.state, ReceiveState::Idle) {
            warn!(
                event = "in_flight_discarded",
                file_id = %file.metadata.file_id,
                received = file.received,
                declared = file.metadata.size,
                "Channel lost mid-file, discarding partial data"
            );
        }
    }

    /// Wait for a pending archive build and hand back everything received.
    pub async fn into_summary(self) -> ReceiveSummary {
        let archive = self.archive.finish().await;
        ReceiveSummary {
            files: self.files,
            texts: self.texts,
            archive,
        }
    }
}

fn assemble(chunks: Vec<Bytes>, total: u64) -> Bytes {
    if chunks.len() == 1 {
        return chunks.into_iter().next().unwrap_or_default();
    }
    let mut buf = BytesMut::with_capacity(total as usize);
    for chunk in chunks {
        buf.extend_from_slice(&chunk);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel::memory::MemoryChannel;
    use crate::core::channel::{ChannelEvent, ChannelEvents};
    use crate::core::transfer::codec::{ChunkCodec, EncryptionFallback};
    use crate::core::transfer::frame::decode;

    fn metadata(name: &str, data: &[u8]) -> TransferMetadata {
        TransferMetadata {
            file_id: Uuid::new_v4(),
            name: name.into(),
            size: data.len() as u64,
            mime_type: "application/octet-stream".into(),
            compressed: false,
            encrypted: false,
            content_hash: Some(crypto::hash(data)),
        }
    }

    fn chunk(data: &[u8]) -> Frame {
        let codec = ChunkCodec::new(None, false, EncryptionFallback::default());
        decode(codec.encode(data).unwrap()).unwrap()
    }

    fn setup() -> (Receiver, ChannelEvents, Arc<MemoryChannel>) {
        let ((peer, peer_events), (local, _local_events)) = MemoryChannel::pair("recv");
        let local = Arc::new(local);
        let flow = Arc::new(FlowController::new(local.clone()));
        drop(peer);
        (Receiver::new(flow, ReceiverOptions::default(), None), peer_events, local)
    }

    async fn acks_seen(events: &mut ChannelEvents) -> Vec<Uuid> {
        let mut acks = Vec::new();
        while let Ok(Some(ev)) =
            tokio::time::timeout(std::time::Duration::from_millis(20), events.recv()).await
        {
            if let ChannelEvent::Message(data) = ev {
                if let Ok(Frame::Control(ControlMessage::Ack { file_id })) = decode(data) {
                    acks.push(file_id);
                }
            }
        }
        acks
    }

    #[tokio::test]
    async fn test_completion_finalizes_when_size_unknown_to_chunks() {
        let (mut rx, mut peer_events, _) = setup();
        let data = b"hello world".to_vec();
        let mut meta = metadata("a.txt", &data);
        // Declared larger than what arrives: only Done can finalize.
        meta.size = 100;
        meta.content_hash = Some(crypto::hash(&data));
        let id = meta.file_id;

        rx.handle_frame(Frame::Control(ControlMessage::Metadata(meta))).await.unwrap();
        assert_eq!(rx.phase(), ReceivePhase::Receiving);
        rx.handle_frame(chunk(&data)).await.unwrap();
        assert_eq!(rx.phase(), ReceivePhase::Receiving);
        rx.handle_frame(Frame::Control(ControlMessage::Done { file_id: id })).await.unwrap();

        assert_eq!(rx.phase(), ReceivePhase::Idle);
        assert_eq!(rx.files().len(), 1);
        assert_eq!(&rx.files()[0].bytes[..], &data[..]);
        assert!(rx.files()[0].integrity_verified);
        assert_eq!(acks_seen(&mut peer_events).await, vec![id]);
    }

    #[tokio::test]
    async fn test_byte_count_and_completion_finalize_once() {
        let (mut rx, mut peer_events, _) = setup();
        let data = vec![7u8; 3000];
        let meta = metadata("b.bin", &data);
        let id = meta.file_id;

        rx.handle_frame(Frame::Control(ControlMessage::Metadata(meta))).await.unwrap();
        rx.handle_frame(chunk(&data[..1000])).await.unwrap();
        rx.handle_frame(chunk(&data[1000..])).await.unwrap();
        // Byte count reached: already finalized.
        assert_eq!(rx.phase(), ReceivePhase::Idle);
        rx.handle_frame(Frame::Control(ControlMessage::Done { file_id: id })).await.unwrap();

        assert_eq!(rx.files().len(), 1);
        assert_eq!(rx.files()[0].actual_size, 3000);
        assert_eq!(acks_seen(&mut peer_events).await, vec![id]);
    }

    #[tokio::test]
    async fn test_integrity_mismatch_keeps_bytes() {
        let (mut rx, _peer_events, _) = setup();
        let data = b"original".to_vec();
        let mut meta = metadata("c.txt", &data);
        meta.content_hash = Some(crypto::hash(b"something else"));
        let id = meta.file_id;

        rx.handle_frame(Frame::Control(ControlMessage::Metadata(meta))).await.unwrap();
        rx.handle_frame(chunk(&data)).await.unwrap();
        rx.handle_frame(Frame::Control(ControlMessage::Done { file_id: id })).await.unwrap();

        let file = &rx.files()[0];
        assert!(!file.integrity_verified);
        assert_eq!(&file.bytes[..], &data[..]);
    }

    #[tokio::test]
    async fn test_zero_byte_file_finalizes_on_completion() {
        let (mut rx, mut peer_events, _) = setup();
        let meta = metadata("empty.txt", b"");
        let id = meta.file_id;

        rx.handle_frame(Frame::Control(ControlMessage::Metadata(meta))).await.unwrap();
        rx.handle_frame(Frame::Control(ControlMessage::Done { file_id: id })).await.unwrap();

        assert_eq!(rx.files().len(), 1);
        assert_eq!(rx.files()[0].actual_size, 0);
        assert!(rx.files()[0].integrity_verified);
        assert_eq!(acks_seen(&mut peer_events).await, vec![id]);
    }

    #[tokio::test]
    async fn test_completion_without_data_is_discarded_but_acked() {
        let (mut rx, mut peer_events, _) = setup();
        let meta = metadata("lost.bin", &[1, 2, 3]);
        let id = meta.file_id;

        rx.handle_frame(Frame::Control(ControlMessage::Metadata(meta))).await.unwrap();
        rx.handle_frame(Frame::Control(ControlMessage::Done { file_id: id })).await.unwrap();

        assert!(rx.files().is_empty());
        assert_eq!(acks_seen(&mut peer_events).await, vec![id]);
    }

    #[tokio::test]
    async fn test_text_does_not_touch_file_buffer() {
        let (mut rx, _peer_events, _) = setup();
        let data = vec![1u8; 64];
        let meta = metadata("d.bin", &data);

        rx.handle_frame(Frame::Control(ControlMessage::Metadata(meta))).await.unwrap();
        rx.handle_frame(chunk(&data[..32])).await.unwrap();
        rx.handle_frame(Frame::Control(ControlMessage::Text {
            content: "hi there".into(),
            timestamp: 1,
        }))
        .await
        .unwrap();
        rx.handle_frame(chunk(&data[32..])).await.unwrap();

        assert_eq!(rx.texts().len(), 1);
        assert_eq!(rx.texts()[0].content, "hi there");
        assert_eq!(&rx.files()[0].bytes[..], &data[..]);
    }

    #[tokio::test]
    async fn test_channel_lost_discards_in_flight() {
        let (mut rx, _peer_events, _) = setup();
        let data = vec![1u8; 100];
        let meta = metadata("e.bin", &data);

        rx.handle_frame(Frame::Control(ControlMessage::Metadata(meta))).await.unwrap();
        rx.handle_frame(chunk(&data[..50])).await.unwrap();
        rx.on_channel_lost();

        assert_eq!(rx.phase(), ReceivePhase::Idle);
        assert!(rx.files().is_empty());
        // A trailing chunk after the loss is an orphan.
        rx.handle_frame(chunk(&data[50..])).await.unwrap();
        assert!(rx.files().is_empty());
    }

    #[tokio::test]
    async fn test_ack_retried_on_transient_failure() {
        let (mut rx, mut peer_events, local) = setup();
        let data = vec![9u8; 10];
        let meta = metadata("f.bin", &data);
        let id = meta.file_id;

        local.fail_next_sends(2);
        rx.handle_frame(Frame::Control(ControlMessage::Metadata(meta))).await.unwrap();
        rx.handle_frame(chunk(&data)).await.unwrap();

        assert_eq!(acks_seen(&mut peer_events).await, vec![id]);
    }

    #[tokio::test]
    async fn test_encrypted_compressed_chunks_are_decoded() {
        let key = crypto::generate_key();
        let ((_peer, _peer_events), (local, _)) = MemoryChannel::pair("recv");
        let flow = Arc::new(FlowController::new(Arc::new(local)));
        let options = ReceiverOptions {
            session_key: Some(key.clone()),
            ..Default::default()
        };
        let mut rx = Receiver::new(flow, options, None);

        let text = "compress me please ".repeat(200);
        let mut meta = metadata("g.txt", text.as_bytes());
        meta.compressed = true;
        meta.encrypted = true;
        let codec = ChunkCodec::new(Some(key), true, EncryptionFallback::default());

        rx.handle_frame(Frame::Control(ControlMessage::Metadata(meta))).await.unwrap();
        rx.handle_frame(decode(codec.encode(text.as_bytes()).unwrap()).unwrap())
            .await
            .unwrap();

        assert_eq!(&rx.files()[0].bytes[..], text.as_bytes());
        assert!(rx.files()[0].integrity_verified);
        assert!(rx.files()[0].encrypted);
    }

    #[tokio::test]
    async fn test_archive_after_ten_files() {
        let (mut rx, _peer_events, _) = setup();
        for i in 0..10 {
            let data = format!("file number {i}").into_bytes();
            let meta = metadata(&format!("f{i}.txt"), &data);
            rx.handle_frame(Frame::Control(ControlMessage::Metadata(meta))).await.unwrap();
            rx.handle_frame(chunk(&data)).await.unwrap();
        }
        let summary = rx.into_summary().await;
        assert_eq!(summary.files.len(), 10);
        let zip = summary.archive.expect("archive built at ten files");
        let archive = zip::ZipArchive::new(std::io::Cursor::new(zip.to_vec())).unwrap();
        assert_eq!(archive.len(), 10);
    }
}
