//! Simulated satellite channel
//!
//! Models the physical hop only: fixed propagation delay, uniform jitter,
//! independent random loss, and a capacity the sender must respect.
//! Delivery is in order; jitter never lets a later packet overtake an
//! earlier one.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use skylink_core::{SkylinkError, SkylinkResult};

/// Longest one-way delay (base plus jitter) a channel may model
pub const MAX_CHANNEL_DELAY_MS: u64 = 60_000;

/// Channel model parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// One-way propagation delay
    pub base_latency_ms: u64,
    /// Uniform extra delay, `0..=jitter_ms`
    pub jitter_ms: u64,
    /// Independent drop probability per transmission
    pub loss_rate: f64,
    /// Link capacity in bits per second
    pub capacity_bps: u32,
    /// RNG seed, so runs are reproducible
    pub seed: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::satellite()
    }
}

impl ChannelConfig {
    /// Geostationary-class uplink: 300-500 ms, 10% loss, 4 kbps
    pub fn satellite() -> Self {
        ChannelConfig {
            base_latency_ms: 300,
            jitter_ms: 200,
            loss_rate: 0.1,
            capacity_bps: 4000,
            seed: 0x5EED,
        }
    }

    /// No loss, no jitter
    pub fn lossless(latency_ms: u64) -> Self {
        ChannelConfig {
            base_latency_ms: latency_ms,
            jitter_ms: 0,
            loss_rate: 0.0,
            ..Self::satellite()
        }
    }

    /// Link in trouble: seconds of delay and heavy loss
    pub fn degraded() -> Self {
        ChannelConfig {
            base_latency_ms: 1800,
            jitter_ms: 400,
            loss_rate: 0.3,
            capacity_bps: 2000,
            seed: 0x5EED,
        }
    }

    /// Bytes the channel carries per second
    #[inline]
    pub fn bytes_per_second(&self) -> f64 {
        self.capacity_bps as f64 / 8.0
    }

    pub fn validate(&self) -> SkylinkResult<()> {
        if !(0.0..=1.0).contains(&self.loss_rate) {
            return Err(SkylinkError::InvalidConfig(format!(
                "channel loss rate {} outside [0, 1]",
                self.loss_rate
            )));
        }
        if self.capacity_bps == 0 {
            return Err(SkylinkError::InvalidConfig(
                "channel capacity is zero".into(),
            ));
        }
        let delay = self.base_latency_ms.saturating_add(self.jitter_ms);
        if delay > MAX_CHANNEL_DELAY_MS {
            return Err(SkylinkError::InvalidConfig(format!(
                "channel delay of {} ms exceeds {} ms",
                delay, MAX_CHANNEL_DELAY_MS
            )));
        }
        Ok(())
    }
}

/// A transmission that reached the far end
#[derive(Clone, Debug)]
pub struct Delivery {
    pub sequence: u64,
    pub payload: Bytes,
    pub delivered_at: Instant,
}

#[derive(Clone, Debug)]
struct InFlight {
    sequence: u64,
    payload: Bytes,
    deliver_at: Instant,
}

/// Channel counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub transmitted: u64,
    pub dropped: u64,
    pub delivered: u64,
}

impl ChannelStats {
    pub fn loss_rate(&self) -> f64 {
        if self.transmitted == 0 {
            0.0
        } else {
            self.dropped as f64 / self.transmitted as f64
        }
    }
}

/// Seeded lossy, latent channel
#[derive(Debug)]
pub struct SimulatedChannel {
    config: ChannelConfig,
    rng: StdRng,
    in_flight: VecDeque<InFlight>,
    stats: ChannelStats,
}

impl SimulatedChannel {
    pub fn new(config: ChannelConfig) -> Self {
        SimulatedChannel {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            in_flight: VecDeque::new(),
            stats: ChannelStats::default(),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Put a payload on the air. Returns `false` when the channel drops it.
    pub fn transmit(&mut self, sequence: u64, payload: Bytes, now: Instant) -> bool {
        self.stats.transmitted += 1;

        if self.config.loss_rate > 0.0 && self.rng.gen::<f64>() < self.config.loss_rate {
            self.stats.dropped += 1;
            return false;
        }

        let jitter = if self.config.jitter_ms > 0 {
            self.rng.gen_range(0..=self.config.jitter_ms)
        } else {
            0
        };
        let delay = self
            .config
            .base_latency_ms
            .saturating_add(jitter)
            .min(MAX_CHANNEL_DELAY_MS);
        let mut deliver_at = now + Duration::from_millis(delay);
        if let Some(last) = self.in_flight.back() {
            deliver_at = deliver_at.max(last.deliver_at);
        }

        self.in_flight.push_back(InFlight {
            sequence,
            payload,
            deliver_at,
        });
        true
    }

    /// Everything due by `now`, oldest first
    pub fn deliver(&mut self, now: Instant) -> Vec<Delivery> {
        let mut delivered = Vec::new();
        while self
            .in_flight
            .front()
            .is_some_and(|packet| packet.deliver_at <= now)
        {
            let Some(packet) = self.in_flight.pop_front() else {
                break;
            };
            self.stats.delivered += 1;
            delivered.push(Delivery {
                sequence: packet.sequence,
                payload: packet.payload,
                delivered_at: packet.deliver_at,
            });
        }
        delivered
    }

    /// Transmissions still in the air
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Drop everything in the air
    pub fn clear(&mut self) {
        self.in_flight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lossless_delivery_after_latency() {
        let mut channel = SimulatedChannel::new(ChannelConfig::lossless(300));
        let start = Instant::now();
        assert!(channel.transmit(0, Bytes::from_static(b"kf"), start));

        assert!(channel.deliver(start + Duration::from_millis(299)).is_empty());
        let delivered = channel.deliver(start + Duration::from_millis(300));
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].sequence, 0);
        assert_eq!(delivered[0].delivered_at, start + Duration::from_millis(300));
    }

    #[test]
    fn test_delivery_in_order() {
        let mut channel = SimulatedChannel::new(ChannelConfig {
            loss_rate: 0.0,
            ..ChannelConfig::satellite()
        });
        let start = Instant::now();
        for seq in 0..50u64 {
            channel.transmit(seq, Bytes::new(), start + Duration::from_millis(seq * 10));
        }

        let delivered = channel.deliver(start + Duration::from_secs(5));
        let order: Vec<u64> = delivered.iter().map(|d| d.sequence).collect();
        assert_eq!(order, (0..50).collect::<Vec<_>>());
        assert!(delivered.windows(2).all(|w| w[0].delivered_at <= w[1].delivered_at));
    }

    #[test]
    fn test_satellite_loss_rate() {
        let mut channel = SimulatedChannel::new(ChannelConfig::satellite());
        let start = Instant::now();
        for seq in 0..2000u64 {
            channel.transmit(seq, Bytes::new(), start);
        }
        let loss = channel.stats().loss_rate();
        assert!(loss > 0.05 && loss < 0.15, "loss rate {}", loss);
    }

    #[test]
    fn test_seeded_runs_repeat() {
        let run = || {
            let mut channel = SimulatedChannel::new(ChannelConfig::satellite());
            let start = Instant::now();
            (0..100u64)
                .map(|seq| channel.transmit(seq, Bytes::new(), start))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_validate() {
        assert!(ChannelConfig::default().validate().is_ok());
        let bad = ChannelConfig {
            loss_rate: 1.5,
            ..ChannelConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_validate_caps_delay() {
        let slow = ChannelConfig {
            base_latency_ms: MAX_CHANNEL_DELAY_MS - 200,
            jitter_ms: 200,
            ..ChannelConfig::default()
        };
        assert!(slow.validate().is_ok());

        let too_slow = [(u64::MAX, 0), (0, u64::MAX), (MAX_CHANNEL_DELAY_MS, 1)];
        for (base_latency_ms, jitter_ms) in too_slow {
            let bad = ChannelConfig {
                base_latency_ms,
                jitter_ms,
                ..ChannelConfig::default()
            };
            assert!(matches!(bad.validate(), Err(SkylinkError::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_unvalidated_delay_is_capped() {
        let mut channel = SimulatedChannel::new(ChannelConfig {
            base_latency_ms: u64::MAX,
            ..ChannelConfig::lossless(0)
        });
        let start = Instant::now();
        assert!(channel.transmit(0, Bytes::from_static(b"kf"), start));
        let at = start + Duration::from_millis(MAX_CHANNEL_DELAY_MS);
        assert_eq!(channel.deliver(at).len(), 1);
    }
}
