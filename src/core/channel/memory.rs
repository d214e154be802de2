//! In-process channel pair.
//!
//! Delivery is lossless and in order. Bytes handed to `send` stay counted in
//! the sender's buffered amount until the peer pulls them off its
//! [`ChannelEvents`] stream, so a peer that stops reading produces real
//! backpressure.

use super::{BufferGauge, Channel, ChannelError, ChannelEvent, ChannelEvents, ChannelState};
use crate::core::config::BUFFERED_AMOUNT_LOW;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

const STATE_OPEN: u8 = 1;
const STATE_CLOSED: u8 = 3;

pub struct MemoryChannel {
    label: String,
    to_peer: mpsc::UnboundedSender<ChannelEvent>,
    to_self: mpsc::UnboundedSender<ChannelEvent>,
    gauge: Arc<BufferGauge>,
    state: Arc<AtomicU8>,
    injected_failures: AtomicU32,
}

pub type MemoryEnd = (MemoryChannel, ChannelEvents);

impl MemoryChannel {
    /// Create two connected ends. Both start open and both event streams
    /// begin with [`ChannelEvent::Open`].
    pub fn pair(label: &str) -> (MemoryEnd, MemoryEnd) {
        Self::pair_with_low_water(label, BUFFERED_AMOUNT_LOW)
    }

    pub fn pair_with_low_water(label: &str, low_water: usize) -> (MemoryEnd, MemoryEnd) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a_gauge = Arc::new(BufferGauge::new(low_water));
        let b_gauge = Arc::new(BufferGauge::new(low_water));
        let state = Arc::new(AtomicU8::new(STATE_OPEN));

        let _ = a_tx.send(ChannelEvent::Open);
        let _ = b_tx.send(ChannelEvent::Open);

        let a = MemoryChannel {
            label: label.to_string(),
            to_peer: b_tx.clone(),
            to_self: a_tx.clone(),
            gauge: a_gauge.clone(),
            state: state.clone(),
            injected_failures: AtomicU32::new(0),
        };
        let b = MemoryChannel {
            label: label.to_string(),
            to_peer: a_tx,
            to_self: b_tx,
            gauge: b_gauge.clone(),
            state,
            injected_failures: AtomicU32::new(0),
        };

        (
            (a, ChannelEvents::with_gauge(a_rx, b_gauge)),
            (b, ChannelEvents::with_gauge(b_rx, a_gauge)),
        )
    }

    /// Make the next `n` sends fail with a transient send error.
    pub fn fail_next_sends(&self, n: u32) {
        self.injected_failures.store(n, Ordering::Release);
    }

    /// Simulate a transport error: both ends see `Error` then `Close`.
    pub fn inject_error(&self, reason: &str) {
        if self.mark_closed() {
            for tx in [&self.to_self, &self.to_peer] {
                let _ = tx.send(ChannelEvent::Error(reason.to_string()));
                let _ = tx.send(ChannelEvent::Close);
            }
        }
    }

    fn mark_closed(&self) -> bool {
        self.state.swap(STATE_CLOSED, Ordering::AcqRel) != STATE_CLOSED
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> ChannelState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => ChannelState::Open,
            _ => ChannelState::Closed,
        }
    }

    async fn send(&self, data: Bytes) -> Result<usize, ChannelError> {
        if self.state() != ChannelState::Open {
            return Err(ChannelError::Closed(self.label.clone()));
        }
        let pending = self.injected_failures.load(Ordering::Acquire);
        if pending > 0 {
            self.injected_failures.store(pending - 1, Ordering::Release);
            return Err(ChannelError::Send {
                label: self.label.clone(),
                reason: "injected failure".into(),
            });
        }

        let len = data.len();
        self.gauge.add(len);
        if self.to_peer.send(ChannelEvent::Message(data)).is_err() {
            self.gauge.release(len);
            self.mark_closed();
            return Err(ChannelError::Closed(self.label.clone()));
        }
        Ok(len)
    }

    async fn buffered_amount(&self) -> usize {
        self.gauge.load()
    }

    fn drain_signal(&self) -> Arc<Notify> {
        self.gauge.drain_signal()
    }

    async fn close(&self) -> Result<(), ChannelError> {
        if self.mark_closed() {
            let _ = self.to_peer.send(ChannelEvent::Close);
            let _ = self.to_self.send(ChannelEvent::Close);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let ((a, _a_events), (_b, mut b_events)) = MemoryChannel::pair("test");
        assert_eq!(b_events.recv().await, Some(ChannelEvent::Open));
        for i in 0..5u8 {
            a.send(Bytes::from(vec![i; 4])).await.unwrap();
        }
        for i in 0..5u8 {
            assert_eq!(
                b_events.recv().await,
                Some(ChannelEvent::Message(Bytes::from(vec![i; 4])))
            );
        }
    }

    #[tokio::test]
    async fn test_buffered_amount_tracks_unread_bytes() {
        let ((a, _a_events), (_b, mut b_events)) = MemoryChannel::pair("test");
        a.send(Bytes::from(vec![0u8; 1000])).await.unwrap();
        a.send(Bytes::from(vec![0u8; 500])).await.unwrap();
        assert_eq!(a.buffered_amount().await, 1500);

        b_events.recv().await; // Open
        b_events.recv().await;
        assert_eq!(a.buffered_amount().await, 500);
    }

    #[tokio::test]
    async fn test_close_reaches_both_ends() {
        let ((a, mut a_events), (b, mut b_events)) = MemoryChannel::pair("test");
        a.close().await.unwrap();
        assert_eq!(b.state(), ChannelState::Closed);
        assert!(a.send(Bytes::from_static(b"x")).await.is_err());

        assert_eq!(a_events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(a_events.recv().await, Some(ChannelEvent::Close));
        assert_eq!(b_events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(b_events.recv().await, Some(ChannelEvent::Close));
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let ((a, _a_events), _b) = MemoryChannel::pair("test");
        a.fail_next_sends(2);
        assert!(a.send(Bytes::from_static(b"1")).await.is_err());
        assert!(a.send(Bytes::from_static(b"2")).await.is_err());
        assert!(a.send(Bytes::from_static(b"3")).await.is_ok());
    }
}
