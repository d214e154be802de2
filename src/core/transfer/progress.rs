//! Throughput sampling and ETA.

use std::time::Duration;
use tokio::time::Instant;

/// Snapshot handed to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub percent: f64,
    pub speed_bps: f64,
    /// `None` until a non-zero speed has been measured.
    pub eta_seconds: Option<f64>,
}

/// Tracks cumulative bytes for one file and samples throughput at most once
/// per `interval`.
#[derive(Debug)]
pub struct ThroughputMeter {
    total: u64,
    transferred: u64,
    interval: Duration,
    last_sample_at: Instant,
    last_sample_bytes: u64,
    speed_bps: f64,
}

impl ThroughputMeter {
    pub fn new(total: u64, interval: Duration) -> Self {
        Self {
            total,
            transferred: 0,
            interval,
            last_sample_at: Instant::now(),
            last_sample_bytes: 0,
            speed_bps: 0.0,
        }
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Account for `bytes` more and return a fresh snapshot if a sampling
    /// interval has elapsed.
    pub fn record(&mut self, bytes: u64) -> Option<Progress> {
        self.transferred += bytes;
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_sample_at);
        if elapsed < self.interval {
            return None;
        }
        let delta = self.transferred - self.last_sample_bytes;
        self.speed_bps = delta as f64 / elapsed.as_secs_f64();
        self.last_sample_at = now;
        self.last_sample_bytes = self.transferred;
        Some(self.snapshot())
    }

    pub fn snapshot(&self) -> Progress {
        let percent = if self.total == 0 {
            100.0
        } else {
            (self.transferred as f64 / self.total as f64 * 100.0).min(100.0)
        };
        let remaining = self.total.saturating_sub(self.transferred);
        let eta_seconds = if self.speed_bps > 0.0 {
            Some(remaining as f64 / self.speed_bps)
        } else {
            None
        };
        Progress {
            percent,
            speed_bps: self.speed_bps,
            eta_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_samples_respect_interval() {
        let mut meter = ThroughputMeter::new(10_000, Duration::from_millis(500));
        assert!(meter.record(1000).is_none());

        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(meter.record(1000).is_none());

        tokio::time::advance(Duration::from_millis(501)).await;
        let p = meter.record(2000).expect("sample due");
        assert_eq!(p.percent, 40.0);
        assert!((p.speed_bps - 4000.0).abs() < 1.0);
        let eta = p.eta_seconds.unwrap();
        assert!((eta - 1.5).abs() < 0.01);
    }

    #[test]
    fn test_snapshot_without_speed_has_no_eta() {
        let meter = ThroughputMeter::new(100, Duration::from_secs(1));
        let p = meter.snapshot();
        assert_eq!(p.percent, 0.0);
        assert_eq!(p.eta_seconds, None);
    }

    #[test]
    fn test_empty_file_is_complete() {
        let meter = ThroughputMeter::new(0, Duration::from_secs(1));
        assert_eq!(meter.snapshot().percent, 100.0);
    }
}
