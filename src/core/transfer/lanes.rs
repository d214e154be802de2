//! Multi-lane fan-out over a single physical channel.
//!
//! K logical lanes share one [`FlowController`]. Lanes are queuing and
//! backpressure bookkeeping only, not independent transports: every frame
//! still goes out through the same ordered channel.
//!
//! Frames are assigned to lanes round-robin and lanes are flushed
//! round-robin from the same starting point, so the flush order always
//! equals the dispatch order. The per-file `Metadata -> chunks -> Done`
//! contract is preserved as long as the session calls [`LaneScheduler::drain_all`]
//! before the completion frame.

use super::flow::FlowController;
use super::TransferError;
use crate::core::config::LANE_FLUSH_THRESHOLD;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default, Clone)]
pub struct LaneStats {
    pub frames: u64,
    pub bytes: u64,
}

#[derive(Debug, Default)]
struct Lane {
    queue: VecDeque<Bytes>,
    stats: LaneStats,
}

pub struct LaneScheduler {
    flow: Arc<FlowController>,
    lanes: Vec<Lane>,
    next_dispatch: usize,
    next_flush: usize,
    flush_threshold: usize,
}

impl LaneScheduler {
    pub fn new(flow: Arc<FlowController>, lane_count: usize) -> Self {
        Self::with_threshold(flow, lane_count, LANE_FLUSH_THRESHOLD)
    }

    pub fn with_threshold(flow: Arc<FlowController>, lane_count: usize, flush_threshold: usize) -> Self {
        let lane_count = lane_count.max(1);
        Self {
            flow,
            lanes: (0..lane_count).map(|_| Lane::default()).collect(),
            next_dispatch: 0,
            next_flush: 0,
            flush_threshold,
        }
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn queued(&self) -> usize {
        self.lanes.iter().map(|l| l.queue.len()).sum()
    }

    pub fn stats(&self) -> Vec<LaneStats> {
        self.lanes.iter().map(|l| l.stats.clone()).collect()
    }

    /// Hand a batch of encoded frames to the lanes, one per lane.
    ///
    /// Frames go straight to the channel while it is below the high-water
    /// mark and nothing is queued ahead of them; otherwise they wait in
    /// their lane.
    pub async fn dispatch(&mut self, frames: Vec<Bytes>) -> Result<(), TransferError> {
        for frame in frames {
            let lane = self.next_dispatch;
            self.next_dispatch = (self.next_dispatch + 1) % self.lanes.len();

            if self.queued() == 0 && !self.flow.is_congested().await {
                self.send_on(lane, frame).await?;
                self.next_flush = self.next_dispatch;
            } else {
                self.lanes[lane].queue.push_back(frame);
            }
        }

        self.flush_ready().await?;

        // Keep at most one batch waiting.
        while self.queued() >= self.lanes.len() {
            self.flow
                .wait_below(self.flush_threshold.saturating_sub(1))
                .await?;
            self.flush_ready().await?;
        }
        Ok(())
    }

    /// Flush queued frames FIFO while the channel is below the flush
    /// threshold. Returns how many frames went out.
    pub async fn flush_ready(&mut self) -> Result<usize, TransferError> {
        let mut sent = 0;
        while self.queued() > 0 && self.flow.buffered().await < self.flush_threshold {
            let lane = self.next_flush;
            let Some(frame) = self.lanes[lane].queue.pop_front() else {
                break;
            };
            self.send_on(lane, frame).await?;
            self.next_flush = (self.next_flush + 1) % self.lanes.len();
            sent += 1;
        }
        if sent > 0 {
            debug!(flushed = sent, remaining = self.queued(), "Lane queues flushed");
        }
        Ok(sent)
    }

    /// Flush every lane completely, waiting for drain as needed.
    pub async fn drain_all(&mut self) -> Result<(), TransferError> {
        while self.queued() > 0 {
            if self.flush_ready().await? == 0 {
                self.flow.wait_below(self.flush_threshold.saturating_sub(1)).await?;
            }
        }
        Ok(())
    }

    async fn send_on(&mut self, lane: usize, frame: Bytes) -> Result<(), TransferError> {
        let len = frame.len() as u64;
        self.flow.safe_send(frame).await?;
        let stats = &mut self.lanes[lane].stats;
        stats.frames += 1;
        stats.bytes += len;
        Ok(())
    }
}
