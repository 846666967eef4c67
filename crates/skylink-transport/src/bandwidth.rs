//! Sliding-window throughput estimator
//!
//! Byte counts accumulate until at least `min_window` has passed, then the
//! window's rate joins a bounded history and the estimate becomes the mean
//! of that history. An estimator that has not closed a window recently
//! reports zero rather than a stale rate.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::debug;

/// Windows kept for the mean
pub const BANDWIDTH_HISTORY: usize = 30;

/// Shortest window that produces a sample
pub const MIN_WINDOW: Duration = Duration::from_millis(100);

/// Age after which the estimate reads as zero
pub const STALE_AFTER: Duration = Duration::from_secs(3);

/// Estimate before the first window closes
pub const INITIAL_BANDWIDTH_BPS: f64 = 3000.0;

/// Throughput of one outgoing stream, in bits per second
#[derive(Debug, Clone)]
pub struct BandwidthMonitor {
    history: VecDeque<f64>,
    capacity: usize,
    window_start: Instant,
    window_bytes: usize,
    current: f64,
    last_sample: Option<Instant>,
}

impl BandwidthMonitor {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Monitor whose first window opens at `now`
    pub fn starting_at(now: Instant) -> Self {
        Self {
            history: VecDeque::with_capacity(BANDWIDTH_HISTORY),
            capacity: BANDWIDTH_HISTORY,
            window_start: now,
            window_bytes: 0,
            current: INITIAL_BANDWIDTH_BPS,
            last_sample: None,
        }
    }

    pub fn update(&mut self, bytes_sent: usize) {
        self.update_at(bytes_sent, Instant::now());
    }

    /// Account for bytes sent at `now`.
    ///
    /// The bytes of the update that closes a window open the next one.
    pub fn update_at(&mut self, bytes_sent: usize, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < MIN_WINDOW {
            self.window_bytes += bytes_sent;
            return;
        }

        let rate = (self.window_bytes * 8) as f64 / elapsed.as_secs_f64();
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(rate);
        self.current = self.history.iter().sum::<f64>() / self.history.len() as f64;

        debug!(
            bandwidth_kbps = self.current / 1000.0,
            bytes_sent, "bandwidth window closed"
        );

        self.window_bytes = bytes_sent;
        self.window_start = now;
        self.last_sample = Some(now);
    }

    pub fn bandwidth(&self) -> f64 {
        self.bandwidth_at(Instant::now())
    }

    /// Mean throughput in bps, zero when no window closed within `STALE_AFTER`
    pub fn bandwidth_at(&self, now: Instant) -> f64 {
        match self.last_sample {
            Some(at) if now.saturating_duration_since(at) <= STALE_AFTER => self.current,
            _ => 0.0,
        }
    }

    /// Number of closed windows held
    pub fn samples(&self) -> usize {
        self.history.len()
    }

    pub fn reset_at(&mut self, now: Instant) {
        *self = Self::starting_at(now);
    }
}

impl Default for BandwidthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_until_first_window() {
        let start = Instant::now();
        let mut monitor = BandwidthMonitor::starting_at(start);
        monitor.update_at(100, start + Duration::from_millis(50));
        assert_eq!(monitor.bandwidth_at(start + Duration::from_millis(50)), 0.0);
        assert_eq!(monitor.samples(), 0);
    }

    #[test]
    fn test_window_rate() {
        let start = Instant::now();
        let mut monitor = BandwidthMonitor::starting_at(start);
        monitor.update_at(25, start + Duration::from_millis(20));
        monitor.update_at(25, start + Duration::from_millis(60));
        // 50 bytes over 200 ms = 2000 bps
        let close = start + Duration::from_millis(200);
        monitor.update_at(40, close);

        assert!((monitor.bandwidth_at(close) - 2000.0).abs() < 1e-6);
        assert_eq!(monitor.samples(), 1);
    }

    #[test]
    fn test_mean_over_windows() {
        let start = Instant::now();
        let mut monitor = BandwidthMonitor::starting_at(start);
        // 100 bytes in the first 100 ms window: 8000 bps
        monitor.update_at(100, start + Duration::from_millis(10));
        monitor.update_at(0, start + Duration::from_millis(100));
        // nothing in the second: 0 bps
        let second = start + Duration::from_millis(200);
        monitor.update_at(0, second);

        assert!((monitor.bandwidth_at(second) - 4000.0).abs() < 1e-6);
    }

    #[test]
    fn test_history_bounded() {
        let start = Instant::now();
        let mut monitor = BandwidthMonitor::starting_at(start);
        for i in 1..=50u64 {
            monitor.update_at(10, start + Duration::from_millis(100 * i));
        }
        assert_eq!(monitor.samples(), BANDWIDTH_HISTORY);
    }

    #[test]
    fn test_stale_reads_zero() {
        let start = Instant::now();
        let mut monitor = BandwidthMonitor::starting_at(start);
        monitor.update_at(30, start + Duration::from_millis(50));
        let close = start + Duration::from_millis(150);
        monitor.update_at(0, close);
        assert!(monitor.bandwidth_at(close + Duration::from_secs(2)) > 0.0);
        assert_eq!(monitor.bandwidth_at(close + Duration::from_secs(4)), 0.0);
    }
}
