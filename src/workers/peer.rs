//! `duodrop send` and `duodrop receive`.
//!
//! Both commands follow the same path: broker rendezvous, WebRTC
//! offer/answer through the broker, key agreement on the fresh data channel,
//! then the transfer protocol. The broker is only used until the data
//! channel opens.

use super::args::{PeerArgs, ReceiveArgs, SendArgs};
use super::report::{format_file_size, spawn_reporter};
use crate::core::broker::room::RoomKey;
use crate::core::channel::webrtc::WebRtcChannel;
use crate::core::channel::{Channel, ChannelEvents};
use crate::core::config::PEER_WAIT_TIMEOUT;
use crate::core::connection::peer::{PeerConnection, SignalPayload};
use crate::core::connection::signaling::SignalingClient;
use crate::core::security::handshake::agree_session_key;
use crate::core::transfer::ack::{AckOutcome, AckTracker};
use crate::core::transfer::flow::FlowController;
use crate::core::transfer::link::PeerLink;
use crate::core::transfer::receiver::{Receiver, ReceiverOptions};
use crate::core::transfer::sender::{SessionOptions, TransferSession};
use crate::core::transfer::sink::DirectorySink;
use crate::core::transfer::source::{DiskSource, FileSource};
use crate::utils::sos::SignalOfStop;
use anyhow::{anyhow, bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use webrtc::ice_transport::ice_server::RTCIceServer;

fn ice_servers(peer: &PeerArgs) -> Vec<RTCIceServer> {
    if peer.ice_servers.is_empty() {
        return PeerConnection::default_ice_servers();
    }
    vec![RTCIceServer {
        urls: peer.ice_servers.clone(),
        ..Default::default()
    }]
}

pub async fn run_send(args: SendArgs, sos: SignalOfStop) -> Result<()> {
    if args.files.is_empty() && args.text.is_empty() {
        bail!("nothing to send: pass files and/or --text");
    }
    let mut sources: Vec<Box<dyn FileSource>> = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let source = DiskSource::from_path(path)
            .await
            .with_context(|| format!("cannot send {}", path.display()))?;
        sources.push(Box::new(source));
    }

    let key = match &args.key {
        Some(raw) => RoomKey::parse(raw)?,
        None => RoomKey::generate(),
    };

    let mut signaling = SignalingClient::connect(args.peer.broker_url()).await?;
    let key = signaling.create_room(&key).await?;
    println!("Room key: {key}");
    info!(event = "waiting_for_peer", %key, "Waiting for the receiver to join");

    let peer_id = sos
        .select(tokio::time::timeout(PEER_WAIT_TIMEOUT, signaling.wait_for_peer()))
        .await
        .ok_or_else(|| anyhow!("cancelled"))?
        .map_err(|_| anyhow!("no peer joined within {PEER_WAIT_TIMEOUT:?}"))??;
    info!(event = "peer_joined", peer = %peer_id, "Receiver joined");

    let (pc, offer) = PeerConnection::offer(ice_servers(&args.peer)).await?;
    signaling.signal(&key, Some(&peer_id), offer.to_value()?).await?;
    let (_, answer) = signaling.wait_signal().await?;
    pc.apply_answer(SignalPayload::from_value(answer)?).await?;

    let (channel, events) = pc.open_channel().await?;
    let result = sos
        .select(transfer_as_sender(&args, sources, channel, events, &key))
        .await
        .unwrap_or_else(|| Err(anyhow!("cancelled")));

    pc.close().await;
    if let Err(e) = signaling.close().await {
        warn!(error = %e, "Failed to close broker connection");
    }
    result
}

async fn transfer_as_sender(
    args: &SendArgs,
    sources: Vec<Box<dyn FileSource>>,
    channel: WebRtcChannel,
    mut events: ChannelEvents,
    key: &RoomKey,
) -> Result<()> {
    let session_key = agree_session_key(&channel, &mut events, key.as_str()).await?;
    let channel: Arc<dyn Channel> = Arc::new(channel);
    let flow = Arc::new(FlowController::new(channel.clone()));

    let (tx, rx) = mpsc::unbounded_channel();
    let reporter = spawn_reporter(rx);
    let acks = AckTracker::new();
    let receiver = Receiver::new(
        flow.clone(),
        ReceiverOptions {
            session_key: Some(session_key.clone()),
            ..Default::default()
        },
        Some(tx.clone()),
    );
    let link = PeerLink::spawn(events, receiver, acks.clone(), Some(tx.clone()));

    let options = SessionOptions {
        encryption_key: (!args.no_encrypt).then_some(session_key),
        compression: !args.no_compress,
        lanes: args.lanes,
        ..Default::default()
    };
    let mut session = TransferSession::with_flow(flow, acks, options, Some(tx));

    for text in &args.text {
        session.send_text(text).await?;
    }
    let sent = session.send_all(&sources).await;

    if let Err(e) = channel.close().await {
        warn!(error = %e, "Failed to close data channel");
    }
    let _ = link.await;
    drop(session);
    let _ = reporter.await;

    let sent = sent?;
    for file in &sent {
        let outcome = match file.ack {
            AckOutcome::Acknowledged => "acknowledged",
            AckOutcome::AlreadyAcknowledged => "acknowledged early",
            AckOutcome::TimedOut => "no acknowledgement",
        };
        println!("{}  {}  {outcome}", file.name, format_file_size(file.size));
    }
    Ok(())
}

pub async fn run_receive(args: ReceiveArgs, sos: SignalOfStop) -> Result<()> {
    let key = RoomKey::parse(&args.key)?;
    let out = args.out.clone().unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&out)
        .with_context(|| format!("cannot create output directory {}", out.display()))?;

    let mut signaling = SignalingClient::connect(args.peer.broker_url()).await?;
    let key = sos
        .select(signaling.join_room_waiting(&key, PEER_WAIT_TIMEOUT))
        .await
        .ok_or_else(|| anyhow!("cancelled"))??;
    info!(event = "room_joined", %key, "Joined room, waiting for offer");

    let (from, offer) = signaling.wait_signal().await?;
    let (pc, answer) =
        PeerConnection::answer(ice_servers(&args.peer), SignalPayload::from_value(offer)?).await?;
    signaling.signal(&key, Some(&from), answer.to_value()?).await?;

    let (channel, events) = pc.open_channel().await?;
    let result = sos
        .select(transfer_as_receiver(channel, events, &key, out))
        .await
        .unwrap_or_else(|| Err(anyhow!("cancelled")));

    pc.close().await;
    if let Err(e) = signaling.close().await {
        warn!(error = %e, "Failed to close broker connection");
    }
    result
}

async fn transfer_as_receiver(
    channel: WebRtcChannel,
    mut events: ChannelEvents,
    key: &RoomKey,
    out: PathBuf,
) -> Result<()> {
    let session_key = agree_session_key(&channel, &mut events, key.as_str()).await?;
    let channel: Arc<dyn Channel> = Arc::new(channel);

    let (tx, rx) = mpsc::unbounded_channel();
    let reporter = spawn_reporter(rx);
    let receiver = Receiver::new(
        Arc::new(FlowController::new(channel)),
        ReceiverOptions {
            session_key: Some(session_key),
            sink: Some(Arc::new(DirectorySink::new(out))),
            ..Default::default()
        },
        Some(tx.clone()),
    );
    let summary = PeerLink::spawn(events, receiver, AckTracker::new(), Some(tx)).await?;
    let _ = reporter.await;

    for text in &summary.texts {
        println!("message: {}", text.content);
    }
    for file in &summary.files {
        let location = file
            .saved_to
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(not saved)".into());
        let integrity = if file.integrity_verified { "ok" } else { "HASH MISMATCH" };
        println!(
            "{}  {}  {integrity}  {location}",
            file.name,
            format_file_size(file.actual_size)
        );
    }
    Ok(())
}
