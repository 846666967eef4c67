//! Link status snapshots

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Quality floor and ceiling
pub const MIN_LINK_QUALITY: f64 = 0.1;
pub const MAX_LINK_QUALITY: f64 = 1.0;

/// Link quality for a mean one-way latency in seconds.
///
/// Half a second of latency is the reference point: `0.5 / latency`,
/// clamped to `[0.1, 1.0]`. No samples (zero latency) reads as a perfect link.
pub fn link_quality(average_latency: f64) -> f64 {
    if !(average_latency > 0.0) {
        return MAX_LINK_QUALITY;
    }
    (0.5 / average_latency).clamp(MIN_LINK_QUALITY, MAX_LINK_QUALITY)
}

/// Best-known state of the link, recomputed by the monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkStatus {
    /// `[0.1, 1.0]`
    pub quality: f64,
    /// Bits per second, within the configured floor and ceiling
    pub bandwidth_estimate: f64,
    /// Mean one-way latency in seconds
    pub average_latency: f64,
    /// Fraction of pending sends older than the ack timeout
    pub packet_loss_rate: f64,
    pub signal_strength: f64,
    /// Estimate pinned at the floor for too many consecutive ticks
    pub saturated: bool,
    /// No monitor update within the staleness horizon
    pub stale: bool,
    pub packets_sent: u64,
    pub packets_acked: u64,
    pub packets_lost: u64,
    pub queue_depth: usize,
    /// Payload bytes waiting for transmission credit
    pub queued_bytes: usize,
    pub pending: usize,
}

impl Default for LinkStatus {
    fn default() -> Self {
        LinkStatus {
            quality: MAX_LINK_QUALITY,
            bandwidth_estimate: 4000.0,
            average_latency: 0.0,
            packet_loss_rate: 0.0,
            signal_strength: 1.0,
            saturated: false,
            stale: false,
            packets_sent: 0,
            packets_acked: 0,
            packets_lost: 0,
            queue_depth: 0,
            queued_bytes: 0,
            pending: 0,
        }
    }
}

/// What the monitor publishes: a status and when it was computed
#[derive(Debug, Clone)]
pub struct LinkSnapshot {
    pub status: LinkStatus,
    pub updated_at: Instant,
}

impl LinkSnapshot {
    pub fn new(status: LinkStatus, updated_at: Instant) -> Self {
        Self { status, updated_at }
    }

    /// The status as seen at `now`, flagged stale past `stale_after`
    pub fn status_at(&self, now: Instant, stale_after: Duration) -> LinkStatus {
        let mut status = self.status.clone();
        status.stale = now.saturating_duration_since(self.updated_at) > stale_after;
        status
    }
}
