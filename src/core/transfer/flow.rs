//! Flow-control controller around a [`Channel`].
//!
//! Enforces the buffered-bytes high-water mark and turns every send failure
//! into [`TransferError::ChannelLost`] so callers can abort cleanly.

use super::TransferError;
use crate::core::channel::{Channel, ChannelError, ChannelState};
use crate::core::config::{BUFFERED_AMOUNT_HIGH, BUFFERED_AMOUNT_LOW, DRAIN_POLL_INTERVAL};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info};

pub struct FlowController {
    channel: Arc<dyn Channel>,
    high_water: usize,
    low_water: usize,
}

impl FlowController {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self::with_marks(channel, BUFFERED_AMOUNT_HIGH, BUFFERED_AMOUNT_LOW)
    }

    pub fn with_marks(channel: Arc<dyn Channel>, high_water: usize, low_water: usize) -> Self {
        Self {
            channel,
            high_water,
            low_water,
        }
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn is_open(&self) -> bool {
        self.channel.state() == ChannelState::Open
    }

    pub async fn buffered(&self) -> usize {
        self.channel.buffered_amount().await
    }

    pub async fn is_congested(&self) -> bool {
        self.buffered().await > self.high_water
    }

    /// Send one frame, reporting channel loss instead of swallowing it.
    pub async fn safe_send(&self, frame: Bytes) -> Result<usize, TransferError> {
        if !self.is_open() {
            return Err(ChannelError::Closed(self.channel.label().to_string()).into());
        }
        Ok(self.channel.send(frame).await?)
    }

    /// If buffered bytes exceed the high-water mark, wait for the channel's
    /// drain signal before returning.
    pub async fn relieve_pressure(&self) -> Result<(), TransferError> {
        let buffered = self.buffered().await;
        if buffered <= self.high_water {
            return Ok(());
        }
        info!(
            event = "backpressure",
            channel = %self.channel.label(),
            buffered,
            high_watermark = self.high_water,
            "Applying backpressure - waiting for buffer to drain"
        );
        self.wait_below(self.low_water).await
    }

    /// Wait until nothing is left above the drain threshold. Used before a
    /// completion frame.
    pub async fn settle(&self) -> Result<(), TransferError> {
        if self.buffered().await == 0 {
            return Ok(());
        }
        self.wait_below(self.low_water).await
    }

    /// Wait until buffered bytes are at or below `mark`.
    ///
    /// Woken by the drain signal, with a poll backstop. Fails if the channel
    /// closes while waiting.
    pub async fn wait_below(&self, mark: usize) -> Result<(), TransferError> {
        let drain = self.channel.drain_signal();
        loop {
            let notified = drain.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_open() {
                return Err(ChannelError::Closed(self.channel.label().to_string()).into());
            }
            let buffered = self.buffered().await;
            if buffered <= mark {
                debug!(channel = %self.channel.label(), buffered, "Buffer drained");
                return Ok(());
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel::memory::MemoryChannel;
    use std::time::Duration;

    #[tokio::test]
    async fn test_safe_send_reports_channel_loss() {
        let ((a, _ae), (_b, _be)) = MemoryChannel::pair("flow");
        let a = Arc::new(a);
        let flow = FlowController::new(a.clone());
        assert!(flow.safe_send(Bytes::from_static(b"x")).await.is_ok());

        a.close().await.unwrap();
        let err = flow.safe_send(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, TransferError::ChannelLost(_)));
    }

    #[tokio::test]
    async fn test_relieve_pressure_is_noop_below_high_water() {
        let ((a, _ae), (_b, _be)) = MemoryChannel::pair("flow");
        let flow = FlowController::with_marks(Arc::new(a), 1000, 100);
        flow.safe_send(Bytes::from(vec![0u8; 900])).await.unwrap();
        tokio::time::timeout(Duration::from_millis(10), flow.relieve_pressure())
            .await
            .expect("should not block")
            .unwrap();
    }

    #[tokio::test]
    async fn test_relieve_pressure_waits_for_drain() {
        let ((a, _ae), (_b, mut b_events)) = MemoryChannel::pair_with_low_water("flow", 100);
        let flow = Arc::new(FlowController::with_marks(Arc::new(a), 1000, 100));
        for _ in 0..3 {
            flow.safe_send(Bytes::from(vec![0u8; 500])).await.unwrap();
        }
        assert!(flow.is_congested().await);

        let waiter = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.relieve_pressure().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        // Open + three messages.
        for _ in 0..4 {
            b_events.recv().await;
        }
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("drain should release the waiter")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_fails_when_channel_closes() {
        let ((a, _ae), (_b, _be)) = MemoryChannel::pair("flow");
        let a = Arc::new(a);
        let flow = Arc::new(FlowController::with_marks(a.clone(), 10, 0));
        flow.safe_send(Bytes::from(vec![0u8; 50])).await.unwrap();

        let waiter = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.relieve_pressure().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.close().await.unwrap();
        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(TransferError::ChannelLost(_))));
    }
}
