//! [`Channel`] adapter over an ordered WebRTC data channel.

use super::{Channel, ChannelError, ChannelEvent, ChannelEvents, ChannelState};
use crate::core::config::{BUFFERED_AMOUNT_LOW, DATA_CHANNEL_TIMEOUT};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
    drain: Arc<Notify>,
}

impl WebRtcChannel {
    /// Install the data channel callbacks and return the channel together
    /// with its event stream.
    pub async fn attach(dc: Arc<RTCDataChannel>) -> (Self, ChannelEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let label = dc.label().to_string();
        let drain = Arc::new(Notify::new());

        dc.set_buffered_amount_low_threshold(BUFFERED_AMOUNT_LOW)
            .await;
        {
            let drain = drain.clone();
            dc.on_buffered_amount_low(Box::new(move || {
                let drain = drain.clone();
                Box::pin(async move {
                    drain.notify_waiters();
                })
            }))
            .await;
        }

        {
            let tx = tx.clone();
            dc.on_open(Box::new(move || {
                Box::pin(async move {
                    let _ = tx.send(ChannelEvent::Open);
                })
            }));
        }
        {
            let tx = tx.clone();
            let label = label.clone();
            dc.on_close(Box::new(move || {
                let tx = tx.clone();
                let label = label.clone();
                Box::pin(async move {
                    debug!(event = "dc_closed", channel = %label, "DataChannel closed");
                    let _ = tx.send(ChannelEvent::Close);
                })
            }));
        }
        {
            let tx = tx.clone();
            let label = label.clone();
            dc.on_error(Box::new(move |err| {
                let tx = tx.clone();
                let label = label.clone();
                Box::pin(async move {
                    warn!(event = "dc_error", channel = %label, error = %err, "DataChannel error");
                    let _ = tx.send(ChannelEvent::Error(err.to_string()));
                })
            }));
        }
        {
            let tx = tx.clone();
            dc.on_message(Box::new(move |msg: DataChannelMessage| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(ChannelEvent::Message(msg.data));
                })
            }));
        }

        // on_open does not fire for a channel that is already open.
        if dc.ready_state() == RTCDataChannelState::Open {
            let _ = tx.send(ChannelEvent::Open);
        }

        (Self { dc, label, drain }, ChannelEvents::new(rx))
    }

    /// Wait until the channel reaches the open state.
    pub async fn wait_open(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + DATA_CHANNEL_TIMEOUT;
        loop {
            match self.dc.ready_state() {
                RTCDataChannelState::Open => return Ok(()),
                RTCDataChannelState::Closed | RTCDataChannelState::Closing => {
                    return Err(anyhow!("DataChannel '{}' is permanently closed", self.label));
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!(
                    "DataChannel '{}' open timeout (state: {:?})",
                    self.label,
                    self.dc.ready_state()
                ));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[async_trait]
impl Channel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> ChannelState {
        match self.dc.ready_state() {
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
            _ => ChannelState::Connecting,
        }
    }

    async fn send(&self, data: Bytes) -> Result<usize, ChannelError> {
        if self.dc.ready_state() != RTCDataChannelState::Open {
            return Err(ChannelError::Closed(self.label.clone()));
        }
        self.dc
            .send(&data)
            .await
            .map_err(|e| ChannelError::Send {
                label: self.label.clone(),
                reason: e.to_string(),
            })
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    fn drain_signal(&self) -> Arc<Notify> {
        self.drain.clone()
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.dc.close().await.map_err(|e| ChannelError::Send {
            label: self.label.clone(),
            reason: e.to_string(),
        })
    }
}
