//! Scenario harness
//!
//! Drives a telemetry session and a ground station over the simulated link
//! on synthetic time, so a minute of satellite link runs in milliseconds
//! and every run with the same seeds is identical.
//!
//! Every frame the ground station decodes is checked against what the
//! sender reconstructed for that frame number. Any difference means the
//! two codec states drifted apart.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use skylink_codec::{decode_packet, encode_packet, CodecState, EncodeRequest, KeypointCodec};
use skylink_core::{PoseFrame, QualityTable, SkylinkResult};
use skylink_runtime::{
    FrameOutcome, GroundStation, GroundStats, Mode, SessionStatus, SkylinkConfig,
    TelemetrySession,
};
use skylink_transport::ChannelConfig;

use crate::source::{PosePattern, SyntheticPose};

/// Scenario configuration
#[derive(Clone, Debug)]
pub struct ScenarioConfig {
    pub duration: Duration,
    /// Interval between captured frames offered to the session
    pub capture_interval: Duration,
    /// Link monitor tick
    pub tick_interval: Duration,
    pub pattern: PosePattern,
    /// Truncate frames to this many points
    pub points: Option<usize>,
    pub source_seed: u64,
    pub session: SkylinkConfig,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig {
            duration: Duration::from_secs(30),
            capture_interval: Duration::from_millis(33),
            tick_interval: Duration::from_millis(100),
            pattern: PosePattern::gentle_sway(),
            points: None,
            source_seed: 0,
            session: SkylinkConfig::default(),
        }
    }
}

impl ScenarioConfig {
    /// Short, lossless link with nominal satellite latency
    pub fn clear_sky() -> Self {
        let mut config = Self::default();
        config.session.channel = ChannelConfig::lossless(300);
        config
    }

    /// Default satellite channel: jitter and 10% loss
    pub fn satellite() -> Self {
        Self::default()
    }

    /// Seconds of delay and heavy loss
    pub fn degraded() -> Self {
        let mut config = Self::default();
        config.session.channel = ChannelConfig::degraded();
        config
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_pattern(mut self, pattern: PosePattern) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn with_points(mut self, points: usize) -> Self {
        self.points = Some(points);
        self
    }

    pub fn with_channel_seed(mut self, seed: u64) -> Self {
        self.session.channel.seed = seed;
        self
    }
}

/// What a scenario run produced
#[derive(Clone, Debug)]
pub struct ScenarioResult {
    pub frames_captured: u64,
    pub keyframes_sent: u64,
    pub deltas_sent: u64,
    pub skipped: u64,
    /// Frames held back while the send queue drained
    pub congested: u64,
    pub send_failures: u64,
    /// Mean rate the session queued, in bps over the whole run
    pub offered_bps: f64,
    pub capacity_bps: u32,
    /// Sends the link gave up on
    pub packets_lost: u64,
    pub decoded: u64,
    /// Decoded frames that differ from the sender's reconstruction
    pub mismatches: u64,
    /// Decode refusals by cause
    pub gaps: u64,
    pub missing_reference: u64,
    pub decode_errors: u64,
    pub emergency_entries: u64,
    pub modes_seen: Vec<Mode>,
    pub final_status: SessionStatus,
    pub ground: GroundStats,
}

impl ScenarioResult {
    /// The ground station decoded something and never disagreed with the
    /// sender, and the link never refused a send
    pub fn passed(&self) -> bool {
        self.decoded > 0
            && self.mismatches == 0
            && self.decode_errors == 0
            && self.send_failures == 0
    }

    /// Offered load as a share of channel capacity
    pub fn utilization(&self) -> f64 {
        self.offered_bps / f64::from(self.capacity_bps.max(1))
    }

    pub fn sent(&self) -> u64 {
        self.keyframes_sent + self.deltas_sent
    }

    /// Fraction of sent frames the ground station decoded
    pub fn delivery_ratio(&self) -> f64 {
        if self.sent() == 0 {
            return 0.0;
        }
        self.decoded as f64 / self.sent() as f64
    }
}

/// Runs one scenario
pub struct ScenarioHarness {
    config: ScenarioConfig,
}

impl ScenarioHarness {
    pub fn new(config: ScenarioConfig) -> Self {
        Self { config }
    }

    /// Run to completion; fails only if the session config is invalid
    pub fn run(&self) -> SkylinkResult<ScenarioResult> {
        let config = &self.config;
        let mut source = SyntheticPose::new(config.pattern.clone(), config.source_seed);
        if let Some(points) = config.points {
            source = source.truncated(points);
        }

        let start = Instant::now();
        let mut session = TelemetrySession::manual_at(config.session.clone(), start)?;
        let mut ground = GroundStation::new(session.link().clone());

        let mut next_capture = Duration::ZERO;
        let mut next_tick = Duration::ZERO;
        let mut sent_frames: BTreeMap<u32, PoseFrame> = BTreeMap::new();
        let mut modes_seen = vec![Mode::Normal];
        let mut frames_captured = 0u64;
        let mut decoded = 0u64;
        let mut mismatches = 0u64;

        while next_capture < config.duration || next_tick < config.duration {
            if next_capture <= next_tick {
                let now = start + next_capture;
                let frame = source.next_frame();
                frames_captured += 1;

                if let FrameOutcome::Sent { .. } = session.process_frame_at(&frame, now) {
                    if let Some(reconstructed) = session.codec().reference() {
                        sent_frames.insert(session.codec().frame_number(), reconstructed.clone());
                    }
                }

                let mode = session.controller().mode();
                if modes_seen.last() != Some(&mode) {
                    modes_seen.push(mode);
                }
                next_capture += config.capture_interval;
            } else {
                session.tick_at(start + next_tick);
                while let Some(result) = ground.try_receive() {
                    let Ok(frame) = result else {
                        continue;
                    };
                    decoded += 1;
                    match sent_frames.get(&frame.frame_number) {
                        Some(expected) if *expected == frame.frame => {}
                        _ => mismatches += 1,
                    }
                    sent_frames = sent_frames.split_off(&frame.frame_number);
                }
                next_tick += config.tick_interval;
            }
        }

        let stats = session.stats().clone();
        let ground_stats = ground.stats().clone();
        let final_status = session.status_at(start + config.duration);
        let offered_bps = (stats.bytes_sent * 8) as f64 / config.duration.as_secs_f64().max(1e-3);
        Ok(ScenarioResult {
            frames_captured,
            keyframes_sent: stats.keyframes_sent,
            deltas_sent: stats.deltas_sent,
            skipped: stats.frames_skipped,
            congested: stats.frames_congested,
            send_failures: stats.send_failures,
            offered_bps,
            capacity_bps: config.session.channel.capacity_bps,
            packets_lost: final_status.link.packets_lost,
            decoded,
            mismatches,
            gaps: ground_stats.gaps,
            missing_reference: ground_stats.missing_reference,
            decode_errors: ground_stats.decode_errors,
            emergency_entries: stats.emergency_entries,
            modes_seen,
            final_status,
            ground: ground_stats,
        })
    }
}

/// Encode and decode a keyframe-only stream at every quality level and
/// report the worst coordinate error seen
pub fn worst_keyframe_error(frames: &[PoseFrame]) -> SkylinkResult<f32> {
    let table = QualityTable::default();
    let mut worst = 0.0f32;
    for level in &table.levels {
        let mut sender = CodecState::new();
        let mut receiver = CodecState::new();
        for frame in frames {
            let Some(packet) =
                KeypointCodec::compress(frame, level, EncodeRequest::keyframe(), &mut sender)
            else {
                continue;
            };
            let packet = decode_packet(&encode_packet(&packet))?;
            let decoded = KeypointCodec::decompress(&packet, &mut receiver)?;
            for (original, got) in frame.iter().zip(decoded.iter()) {
                worst = worst
                    .max((original.x - got.x).abs())
                    .max((original.y - got.y).abs());
            }
        }
    }
    Ok(worst)
}
