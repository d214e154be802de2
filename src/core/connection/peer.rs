//! WebRTC peer connection carrying one ordered data channel.

use crate::core::channel::webrtc::WebRtcChannel;
use crate::core::channel::ChannelEvents;
use crate::core::config::{
    CONNECTION_TIMEOUT, DATA_CHANNEL_LABEL, ICE_GATHER_TIMEOUT, SCTP_MAX_MESSAGE_SIZE,
};
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::{SctpMaxMessageSize, SettingEngine};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Session description as relayed through the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalPayload {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SignalPayload {
    fn from_description(desc: &RTCSessionDescription) -> Result<Self> {
        let kind = match desc.sdp_type {
            RTCSdpType::Offer => SdpKind::Offer,
            RTCSdpType::Answer => SdpKind::Answer,
            other => bail!("unsupported session description type {other}"),
        };
        Ok(Self {
            kind,
            sdp: desc.sdp.clone(),
        })
    }

    fn into_description(self) -> Result<RTCSessionDescription> {
        Ok(match self.kind {
            SdpKind::Offer => RTCSessionDescription::offer(self.sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(self.sdp)?,
        })
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).context("malformed session description signal")
    }
}

type ChannelSlot = Arc<Mutex<Option<oneshot::Sender<Arc<webrtc::data_channel::RTCDataChannel>>>>>;

pub struct PeerConnection {
    pc: Arc<RTCPeerConnection>,
    channel: Mutex<Option<oneshot::Receiver<Arc<webrtc::data_channel::RTCDataChannel>>>>,
}

impl PeerConnection {
    pub fn default_ice_servers() -> Vec<RTCIceServer> {
        vec![RTCIceServer {
            urls: vec!["stun:stun.l.google.com:19302".into()],
            ..Default::default()
        }]
    }

    async fn new_peer_connection(ice_servers: Vec<RTCIceServer>) -> Result<Arc<RTCPeerConnection>> {
        let mut me = MediaEngine::default();
        let reg = register_default_interceptors(Registry::new(), &mut me)?;

        // Largest chunk tier plus encryption overhead exceeds the 64 KB default.
        let mut se = SettingEngine::default();
        se.set_sctp_max_message_size_can_send(SctpMaxMessageSize::Bounded(SCTP_MAX_MESSAGE_SIZE));

        let api = APIBuilder::new()
            .with_setting_engine(se)
            .with_media_engine(me)
            .with_interceptor_registry(reg)
            .build();
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await?,
        );

        pc.on_peer_connection_state_change(Box::new(|s| {
            Box::pin(async move {
                match s {
                    RTCPeerConnectionState::Connected => {
                        info!(event = "webrtc_connected", "WebRTC connection established");
                    }
                    RTCPeerConnectionState::Failed => {
                        error!(event = "webrtc_failed", "WebRTC connection failed");
                    }
                    RTCPeerConnectionState::Disconnected => {
                        warn!(event = "webrtc_disconnected", "WebRTC transient disconnect (ICE may recover)");
                    }
                    _ => {}
                }
            })
        }));
        Ok(pc)
    }

    /// Offering side: create the data channel and a complete offer.
    pub async fn offer(ice_servers: Vec<RTCIceServer>) -> Result<(Self, SignalPayload)> {
        let pc = Self::new_peer_connection(ice_servers).await?;
        let dc = pc
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(dc);

        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer).await?;
        let payload = gather_local_description(&pc).await?;
        Ok((
            Self {
                pc,
                channel: Mutex::new(Some(rx)),
            },
            payload,
        ))
    }

    /// Answering side: adopt the offerer's data channel and answer.
    pub async fn answer(
        ice_servers: Vec<RTCIceServer>,
        offer: SignalPayload,
    ) -> Result<(Self, SignalPayload)> {
        if offer.kind != SdpKind::Offer {
            bail!("expected an offer, got {:?}", offer.kind);
        }
        let pc = Self::new_peer_connection(ice_servers).await?;

        let (tx, rx) = oneshot::channel();
        let slot: ChannelSlot = Arc::new(Mutex::new(Some(tx)));
        pc.on_data_channel(Box::new(move |dc| {
            let slot = slot.clone();
            Box::pin(async move {
                if dc.label() != DATA_CHANNEL_LABEL {
                    warn!(label = %dc.label(), "Ignoring unexpected data channel");
                    return;
                }
                let tx = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(tx) = tx {
                    let _ = tx.send(dc);
                }
            })
        }));

        pc.set_remote_description(offer.into_description()?).await?;
        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer).await?;
        let payload = gather_local_description(&pc).await?;
        Ok((
            Self {
                pc,
                channel: Mutex::new(Some(rx)),
            },
            payload,
        ))
    }

    pub async fn apply_answer(&self, answer: SignalPayload) -> Result<()> {
        if answer.kind != SdpKind::Answer {
            bail!("expected an answer, got {:?}", answer.kind);
        }
        self.pc
            .set_remote_description(answer.into_description()?)
            .await?;
        Ok(())
    }

    /// Wait for the data channel and for it to open.
    pub async fn open_channel(&self) -> Result<(WebRtcChannel, ChannelEvents)> {
        let rx = self
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| anyhow!("data channel already taken"))?;
        let dc = timeout(CONNECTION_TIMEOUT, rx)
            .await
            .context("peer did not open a data channel in time")?
            .context("peer connection dropped before the data channel arrived")?;

        let (channel, events) = WebRtcChannel::attach(dc).await;
        channel.wait_open().await?;
        Ok((channel, events))
    }

    pub async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(error = %e, "Failed to close peer connection");
        }
    }
}

/// Inject `a=max-message-size` so the remote side accepts our chunk sizes.
fn inject_max_message_size(mut desc: RTCSessionDescription) -> RTCSessionDescription {
    if !desc.sdp.contains("a=max-message-size:") {
        desc.sdp
            .push_str(&format!("a=max-message-size:{SCTP_MAX_MESSAGE_SIZE}\r\n"));
    }
    desc
}

async fn local_payload(pc: &RTCPeerConnection) -> Result<SignalPayload> {
    let desc = pc
        .local_description()
        .await
        .ok_or_else(|| anyhow!("No local description after ICE gathering"))?;
    SignalPayload::from_description(&inject_max_message_size(desc))
}

/// Wait for ICE gathering to complete and return the full description.
async fn gather_local_description(pc: &Arc<RTCPeerConnection>) -> Result<SignalPayload> {
    if pc.ice_gathering_state() == RTCIceGatheringState::Complete {
        return local_payload(pc).await;
    }

    let (tx, rx) = oneshot::channel::<()>();
    let tx = Arc::new(Mutex::new(Some(tx)));
    pc.on_ice_gathering_state_change(Box::new(move |state| {
        let tx = tx.clone();
        Box::pin(async move {
            if state == RTCIceGathererState::Complete {
                let tx = tx.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(tx) = tx {
                    let _ = tx.send(());
                }
            }
        })
    }));

    if pc.ice_gathering_state() != RTCIceGatheringState::Complete {
        timeout(ICE_GATHER_TIMEOUT, rx)
            .await
            .context("ICE gathering timeout")?
            .context("ICE gathering channel closed")?;
    }
    local_payload(pc).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signal_payload_shape() {
        let payload = SignalPayload {
            kind: SdpKind::Offer,
            sdp: "v=0\r\n".into(),
        };
        assert_eq!(payload.to_value().unwrap(), json!({"type": "offer", "sdp": "v=0\r\n"}));
        assert_eq!(
            SignalPayload::from_value(json!({"type": "answer", "sdp": "x"})).unwrap().kind,
            SdpKind::Answer
        );
        assert!(SignalPayload::from_value(json!({"type": "candidate"})).is_err());
    }
}
