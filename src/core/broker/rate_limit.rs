//! Request budgets.
//!
//! [`FixedWindowLimiter`] is the per-connection budget for broker
//! operations. [`SlidingWindowLimiter`] is the per-address budget applied to
//! HTTP requests before they reach any room logic.
//!
//! Both take `now` explicitly so they can be driven by paused tokio time.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    resets_at: Instant,
}

/// `limit` events per `window`, counted from the first event of the window.
#[derive(Debug)]
pub struct FixedWindowLimiter<K> {
    limit: u32,
    window: Duration,
    entries: HashMap<K, Window>,
}

impl<K: Hash + Eq + Clone> FixedWindowLimiter<K> {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            entries: HashMap::new(),
        }
    }

    /// Charge one event. Over budget returns how long until the window
    /// resets and leaves the count untouched.
    pub fn check(&mut self, key: &K, now: Instant) -> Result<(), Duration> {
        let window = self.window;
        let entry = self.entries.entry(key.clone()).or_insert(Window {
            count: 0,
            resets_at: now + window,
        });
        if now > entry.resets_at {
            *entry = Window {
                count: 0,
                resets_at: now + window,
            };
        }
        if entry.count >= self.limit {
            return Err(entry.resets_at.saturating_duration_since(now));
        }
        entry.count += 1;
        Ok(())
    }

    pub fn remove(&mut self, key: &K) {
        self.entries.remove(key);
    }

    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}

/// `limit` events within any trailing `window`.
#[derive(Debug)]
pub struct SlidingWindowLimiter<K> {
    limit: usize,
    window: Duration,
    hits: HashMap<K, VecDeque<Instant>>,
}

impl<K: Hash + Eq + Clone> SlidingWindowLimiter<K> {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: HashMap::new(),
        }
    }

    pub fn check(&mut self, key: &K, now: Instant) -> Result<(), Duration> {
        let window = self.window;
        let hits = self.hits.entry(key.clone()).or_default();
        while hits
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= window)
        {
            hits.pop_front();
        }
        if hits.len() >= self.limit {
            let retry = hits
                .front()
                .map(|oldest| (*oldest + window).saturating_duration_since(now))
                .unwrap_or(window);
            return Err(retry);
        }
        hits.push_back(now);
        Ok(())
    }

    /// Forget keys with no hits left in the window.
    pub fn sweep(&mut self, now: Instant) {
        let window = self.window;
        self.hits.retain(|_, hits| {
            hits.back()
                .is_some_and(|t| now.saturating_duration_since(*t) < window)
        });
    }

    pub fn tracked(&self) -> usize {
        self.hits.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_blocks_then_resets() {
        let mut limiter = FixedWindowLimiter::new(10, Duration::from_secs(60));
        for _ in 0..10 {
            limiter.check(&"c1", Instant::now()).unwrap();
        }
        let retry = limiter.check(&"c1", Instant::now()).unwrap_err();
        assert_eq!(retry, Duration::from_secs(60));
        // Another key has its own budget.
        limiter.check(&"c2", Instant::now()).unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        limiter.check(&"c1", Instant::now()).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_events_are_not_counted() {
        let mut limiter = FixedWindowLimiter::new(1, Duration::from_secs(10));
        limiter.check(&1, Instant::now()).unwrap();
        for _ in 0..5 {
            assert!(limiter.check(&1, Instant::now()).is_err());
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        limiter.check(&1, Instant::now()).unwrap();
        assert!(limiter.check(&1, Instant::now()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_frees_oldest_hit() {
        let mut limiter = SlidingWindowLimiter::new(3, Duration::from_secs(100));
        limiter.check(&"ip", Instant::now()).unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;
        limiter.check(&"ip", Instant::now()).unwrap();
        limiter.check(&"ip", Instant::now()).unwrap();

        let retry = limiter.check(&"ip", Instant::now()).unwrap_err();
        assert_eq!(retry, Duration::from_secs(50));

        tokio::time::advance(Duration::from_secs(50)).await;
        limiter.check(&"ip", Instant::now()).unwrap();
        assert!(limiter.check(&"ip", Instant::now()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_idle_keys() {
        let mut limiter = SlidingWindowLimiter::new(3, Duration::from_secs(10));
        limiter.check(&"a", Instant::now()).unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        limiter.check(&"b", Instant::now()).unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        limiter.sweep(Instant::now());
        assert_eq!(limiter.tracked(), 1);
    }
}
