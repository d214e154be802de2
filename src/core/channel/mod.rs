//! Bidirectional message channel abstraction.
//!
//! The transfer protocol only needs a handful of operations from the
//! underlying transport: send a message, read the outstanding buffered
//! byte count, observe open/close/error events and be told when the send
//! buffer has drained. [`Channel`] captures the send side; inbound traffic
//! and lifecycle events arrive on a [`ChannelEvents`] stream handed out
//! alongside each channel.
//!
//! Implementations:
//! - [`memory::MemoryChannel`]: lossless, in-order in-process pair with
//!   real buffered-byte accounting. Used for loopback and tests.
//! - [`webrtc::WebRtcChannel`]: adapter over an ordered `RTCDataChannel`.

pub mod memory;
pub mod webrtc;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Inbound traffic and lifecycle notifications for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(Bytes),
    Close,
    Error(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel '{0}' is closed")]
    Closed(String),
    #[error("send on channel '{label}' failed: {reason}")]
    Send { label: String, reason: String },
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn label(&self) -> &str;

    fn state(&self) -> ChannelState;

    /// Queue one message. Returns the number of bytes accepted.
    async fn send(&self, data: Bytes) -> Result<usize, ChannelError>;

    /// Bytes accepted by `send` but not yet handed to the peer.
    async fn buffered_amount(&self) -> usize;

    /// Fired when the buffered amount drops to the low-water threshold.
    fn drain_signal(&self) -> Arc<Notify>;

    async fn close(&self) -> Result<(), ChannelError>;
}

/// Shared buffered-byte counter with a drain notification.
#[derive(Debug)]
pub struct BufferGauge {
    buffered: AtomicUsize,
    low_water: usize,
    drain: Arc<Notify>,
}

impl BufferGauge {
    pub fn new(low_water: usize) -> Self {
        Self {
            buffered: AtomicUsize::new(0),
            low_water,
            drain: Arc::new(Notify::new()),
        }
    }

    pub fn load(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    pub fn add(&self, n: usize) {
        self.buffered.fetch_add(n, Ordering::AcqRel);
    }

    /// Subtract `n` bytes and fire the drain signal when crossing the
    /// low-water threshold.
    pub fn release(&self, n: usize) {
        let prev = self
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(n))
            })
            .unwrap_or_else(|v| v);
        let now = prev.saturating_sub(n);
        if prev > self.low_water && now <= self.low_water {
            self.drain.notify_waiters();
        }
    }

    pub fn drain_signal(&self) -> Arc<Notify> {
        self.drain.clone()
    }
}

/// Receiving half of a channel.
///
/// For in-process channels the stream also releases the peer's buffered
/// bytes as messages are consumed, which is what drives backpressure in
/// tests.
pub struct ChannelEvents {
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
    remote_gauge: Option<Arc<BufferGauge>>,
}

impl ChannelEvents {
    pub fn new(rx: mpsc::UnboundedReceiver<ChannelEvent>) -> Self {
        Self {
            rx,
            remote_gauge: None,
        }
    }

    pub(crate) fn with_gauge(
        rx: mpsc::UnboundedReceiver<ChannelEvent>,
        gauge: Arc<BufferGauge>,
    ) -> Self {
        Self {
            rx,
            remote_gauge: Some(gauge),
        }
    }

    /// Next event, or `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        let event = self.rx.recv().await?;
        if let (ChannelEvent::Message(data), Some(gauge)) = (&event, &self.remote_gauge) {
            gauge.release(data.len());
        }
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gauge_fires_drain_when_crossing_low_water() {
        let gauge = BufferGauge::new(100);
        let drain = gauge.drain_signal();
        gauge.add(500);

        let notified = drain.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        gauge.release(300);
        assert_eq!(gauge.load(), 200);
        gauge.release(150);
        assert_eq!(gauge.load(), 50);

        tokio::time::timeout(std::time::Duration::from_millis(100), notified)
            .await
            .expect("drain signal should fire");
    }

    #[test]
    fn test_gauge_release_saturates() {
        let gauge = BufferGauge::new(0);
        gauge.add(10);
        gauge.release(25);
        assert_eq!(gauge.load(), 0);
    }
}
