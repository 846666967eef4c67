//! Adaptive controller - frame rate, quality level and emergency mode
//!
//! The controller is the feedback half of the loop. Each cycle it reads the
//! link status and the codec's motion intensity, then decides:
//! - whether the offered frame is processed at all (fps gate)
//! - which quality level and point set the codec uses
//! - whether this frame is a keyframe
//!
//! Entry and exit thresholds for emergency mode differ so the mode does not
//! flap near the boundary.
//!
//! A growing send queue means the stream offers more than the link
//! carries. Each congested step caps quality one level lower and drops fps
//! to the floor; past the lowest level only reference points go out. Steps
//! are undone one at a time after a congestion-free stretch.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use skylink_core::{FrameKind, PointSet, QualityLevel, QualityTable};
use skylink_transport::LinkStatus;
use tracing::{info, warn};

use crate::ControllerConfig;

/// Operating mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Normal,
    Emergency,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Normal => f.write_str("normal"),
            Mode::Emergency => f.write_str("emergency"),
        }
    }
}

/// Why the link counts as degraded
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradeReason {
    LowQuality(f64),
    LowBandwidth(f64),
}

/// Outcome of feeding a link status to the mode state machine
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModeTransition {
    Unchanged,
    EnteredEmergency(DegradeReason),
    ExitedEmergency,
}

/// Seconds as a duration; values no duration can hold read as forever
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

/// Closed-loop rate and quality controller
#[derive(Debug, Clone)]
pub struct AdaptiveController {
    config: ControllerConfig,
    table: QualityTable,
    mode: Mode,
    fps: f64,
    last_accepted: Option<Instant>,
    last_keyframe: Option<Instant>,
    keyframe_forced: bool,
    /// Quality levels shed for congestion
    backoff: usize,
    backoff_changed: Option<Instant>,
    last_congested: Option<Instant>,
}

impl AdaptiveController {
    pub fn new(config: ControllerConfig, table: QualityTable) -> Self {
        let fps = config.initial_fps;
        Self {
            config,
            table,
            mode: Mode::Normal,
            fps,
            last_accepted: None,
            last_keyframe: None,
            keyframe_forced: true,
            backoff: 0,
            backoff_changed: None,
            last_congested: None,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn table(&self) -> &QualityTable {
        &self.table
    }

    #[inline]
    pub fn fps(&self) -> f64 {
        self.fps
    }

    #[inline]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    #[inline]
    pub fn is_emergency(&self) -> bool {
        self.mode == Mode::Emergency
    }

    /// Unsmoothed fps for a link bandwidth (bps) and motion intensity
    pub fn target_fps(&self, bandwidth_bps: f64, motion: f64) -> f64 {
        let c = &self.config;
        let bandwidth_ratio = ((bandwidth_bps - c.min_bandwidth_bps)
            / (c.max_bandwidth_bps - c.min_bandwidth_bps))
            .clamp(0.0, 1.0);
        let motion_weight = (motion / c.motion_threshold).clamp(0.0, 1.0);
        c.min_fps + (c.max_fps - c.min_fps) * (0.7 * bandwidth_ratio + 0.3 * motion_weight)
    }

    /// Move fps toward the target with exponential smoothing
    pub fn update_frame_rate(&mut self, bandwidth_bps: f64, motion: f64) -> f64 {
        let target = self.target_fps(bandwidth_bps, motion);
        let alpha = self.config.fps_smoothing;
        self.fps = alpha * self.fps + (1.0 - alpha) * target;
        self.fps
    }

    /// Scale fps down when measured throughput exceeds what the link carries
    pub fn enforce_budget(&mut self, measured_bps: f64, estimate_bps: f64) {
        if measured_bps > estimate_bps && measured_bps > 0.0 {
            self.fps = (self.fps * estimate_bps / measured_bps).max(self.config.min_fps);
        }
    }

    pub fn should_process_frame(&mut self) -> bool {
        self.should_process_frame_at(Instant::now())
    }

    /// Frame-rate gate: accept only if `1/fps` has passed since the last
    /// accepted frame. Rejected frames are dropped, never queued.
    pub fn should_process_frame_at(&mut self, now: Instant) -> bool {
        let interval = Duration::from_secs_f64(1.0 / self.fps.max(f64::EPSILON));
        match self.last_accepted {
            Some(last) if now.saturating_duration_since(last) < interval => false,
            _ => {
                self.last_accepted = Some(now);
                true
            }
        }
    }

    /// Codec budget in kbps for a link bandwidth in bps
    pub fn budget_for(&self, bandwidth_bps: f64) -> f64 {
        self.config
            .budget_override
            .unwrap_or(bandwidth_bps * self.config.telemetry_share / 1000.0)
    }

    pub fn select_quality(&self, bandwidth_bps: f64) -> &QualityLevel {
        self.table.select(self.budget_for(bandwidth_bps))
    }

    /// Level for a link bandwidth, capped by the congestion backoff
    pub fn quality_for(&self, bandwidth_bps: f64) -> &QualityLevel {
        let selected = self.select_quality(bandwidth_bps);
        let cap = self.table.levels.len().saturating_sub(1 + self.backoff);
        match self.table.index_of(selected.name) {
            Some(index) if index > cap => &self.table.levels[cap],
            _ => selected,
        }
    }

    #[inline]
    pub fn backoff(&self) -> usize {
        self.backoff
    }

    /// Feed the send-queue backlog, in seconds at the estimated rate.
    ///
    /// Returns whether the link counts as congested. Backoff moves at most
    /// one step per backlog limit while congested, and one step back per
    /// recovery period once the queue stays short.
    pub fn observe_backlog(&mut self, backlog_secs: f64, now: Instant) -> bool {
        let c = &self.config;
        let since_change = self
            .backoff_changed
            .map(|at| now.saturating_duration_since(at));

        if backlog_secs > c.max_backlog_secs {
            let step_due = since_change.map_or(true, |t| t >= secs(c.max_backlog_secs));
            if step_due && self.backoff < self.table.levels.len() {
                self.backoff += 1;
                self.backoff_changed = Some(now);
                warn!(backoff = self.backoff, backlog_secs, "link congested, backing off");
            }
            self.fps = c.min_fps;
            self.last_congested = Some(now);
            return true;
        }

        let recovery = secs(c.backoff_recovery_secs);
        let calm = self
            .last_congested
            .map_or(true, |at| now.saturating_duration_since(at) >= recovery);
        if self.backoff > 0 && calm && since_change.map_or(true, |t| t >= recovery) {
            self.backoff -= 1;
            self.backoff_changed = Some(now);
            info!(backoff = self.backoff, "congestion cleared, stepping up");
        }
        false
    }

    /// Points sent in the current mode
    pub fn point_set(&self) -> PointSet {
        if self.mode == Mode::Emergency || self.backoff >= self.table.levels.len() {
            PointSet::Reference
        } else {
            PointSet::Full
        }
    }

    /// Time-based keyframe refresh for the current mode
    pub fn keyframe_refresh(&self) -> Duration {
        let refresh = match self.mode {
            Mode::Normal => self.config.keyframe_refresh_secs,
            Mode::Emergency => self.config.emergency_keyframe_refresh_secs,
        };
        secs(refresh)
    }

    /// Base interval shortened by motion, never below the configured floor
    pub fn adjusted_keyframe_interval(&self, base: u32, motion: f64) -> u32 {
        let motion = if motion.is_finite() {
            motion.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let adjusted = (base as f64 * (1.0 - motion)).round() as u32;
        adjusted.max(self.config.min_keyframe_interval)
    }

    /// Next frame must be a keyframe regardless of cadence
    pub fn force_keyframe(&mut self) {
        self.keyframe_forced = true;
    }

    /// Keyframe or delta for frame `frame_number`
    pub fn frame_kind_at(
        &self,
        frame_number: u32,
        level: &QualityLevel,
        motion: f64,
        now: Instant,
    ) -> FrameKind {
        let refresh_due = self
            .last_keyframe
            .map_or(true, |at| now.saturating_duration_since(at) >= self.keyframe_refresh());
        if self.keyframe_forced || refresh_due {
            return FrameKind::Keyframe;
        }

        match self.mode {
            Mode::Normal => {
                let interval = self.adjusted_keyframe_interval(level.keyframe_interval, motion);
                if frame_number % interval == 0 {
                    FrameKind::Keyframe
                } else {
                    FrameKind::Delta
                }
            }
            Mode::Emergency => FrameKind::Delta,
        }
    }

    /// Note what was actually sent
    pub fn record_frame(&mut self, kind: FrameKind, now: Instant) {
        if kind.is_keyframe() {
            self.last_keyframe = Some(now);
            self.keyframe_forced = false;
        }
    }

    /// Run the emergency state machine on a link status
    pub fn observe_link(&mut self, status: &LinkStatus) -> ModeTransition {
        let c = &self.config;
        match self.mode {
            Mode::Normal => {
                let reason = if status.quality < c.emergency_quality {
                    Some(DegradeReason::LowQuality(status.quality))
                } else if status.bandwidth_estimate < c.emergency_bandwidth_bps {
                    Some(DegradeReason::LowBandwidth(status.bandwidth_estimate))
                } else {
                    None
                };
                match reason {
                    Some(reason) => {
                        warn!(?reason, "entering emergency mode");
                        self.mode = Mode::Emergency;
                        self.keyframe_forced = true;
                        ModeTransition::EnteredEmergency(reason)
                    }
                    None => ModeTransition::Unchanged,
                }
            }
            Mode::Emergency => {
                if status.quality > c.recovery_quality {
                    info!(quality = status.quality, "leaving emergency mode");
                    self.mode = Mode::Normal;
                    self.keyframe_forced = true;
                    ModeTransition::ExitedEmergency
                } else {
                    ModeTransition::Unchanged
                }
            }
        }
    }

    /// Back to the initial state
    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone(), self.table.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use skylink_core::QualityName;

    fn controller() -> AdaptiveController {
        AdaptiveController::new(ControllerConfig::default(), QualityTable::default())
    }

    fn link(quality: f64, bandwidth: f64) -> LinkStatus {
        LinkStatus {
            quality,
            bandwidth_estimate: bandwidth,
            ..LinkStatus::default()
        }
    }

    #[test]
    fn test_emergency_round_trip() {
        let mut c = controller();
        assert_eq!(
            c.observe_link(&link(0.2, 1000.0)),
            ModeTransition::EnteredEmergency(DegradeReason::LowQuality(0.2))
        );
        assert!(c.is_emergency());
        assert_eq!(c.point_set(), PointSet::Reference);

        assert_eq!(c.observe_link(&link(0.6, 1000.0)), ModeTransition::ExitedEmergency);
        assert_eq!(c.mode(), Mode::Normal);
        assert_eq!(c.point_set(), PointSet::Full);
    }

    #[test]
    fn test_low_bandwidth_alone_degrades() {
        let mut c = controller();
        assert_eq!(
            c.observe_link(&link(0.9, 1200.0)),
            ModeTransition::EnteredEmergency(DegradeReason::LowBandwidth(1200.0))
        );
    }

    #[test]
    fn test_hysteresis() {
        let mut c = controller();
        c.observe_link(&link(0.25, 3000.0));
        // Between the thresholds: stays put in either mode.
        assert_eq!(c.observe_link(&link(0.4, 3000.0)), ModeTransition::Unchanged);
        assert!(c.is_emergency());
        assert_eq!(c.observe_link(&link(0.5, 3000.0)), ModeTransition::Unchanged);

        c.observe_link(&link(0.8, 3000.0));
        assert_eq!(c.observe_link(&link(0.4, 3000.0)), ModeTransition::Unchanged);
        assert_eq!(c.mode(), Mode::Normal);
    }

    #[test]
    fn test_static_motion_keeps_base_interval() {
        let c = controller();
        for level in &QualityTable::default().levels {
            assert_eq!(
                c.adjusted_keyframe_interval(level.keyframe_interval, 0.0),
                level.keyframe_interval
            );
        }
    }

    #[test]
    fn test_motion_shortens_interval_to_floor() {
        let c = controller();
        assert_eq!(c.adjusted_keyframe_interval(60, 0.5), 30);
        assert_eq!(c.adjusted_keyframe_interval(60, 0.95), 10);
        // Motion is unbounded upstream; clamp before weighting.
        assert_eq!(c.adjusted_keyframe_interval(60, 3.0), 10);
    }

    #[test]
    fn test_target_fps() {
        let c = controller();
        assert_eq!(c.target_fps(2000.0, 0.0), 5.0);
        assert!((c.target_fps(4000.0, 0.1) - 15.0).abs() < 1e-9);
        assert!((c.target_fps(3000.0, 0.05) - 10.0).abs() < 1e-9);
        assert!((c.target_fps(10_000.0, 5.0) - 15.0).abs() < 1e-9);
        assert!((c.target_fps(4000.0, 0.0) - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_fps_smoothing() {
        let mut c = controller();
        let fps = c.update_frame_rate(4000.0, 0.1);
        assert!((fps - (0.7 * 10.0 + 0.3 * 15.0)).abs() < 1e-9);
        for _ in 0..100 {
            c.update_frame_rate(2000.0, 0.0);
        }
        assert!((c.fps() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_budget_enforcement() {
        let mut c = controller();
        c.enforce_budget(4000.0, 2000.0);
        assert!((c.fps() - 5.0).abs() < 1e-9);
        c.enforce_budget(8000.0, 2000.0);
        assert_eq!(c.fps(), 5.0);

        let mut c = controller();
        c.enforce_budget(1000.0, 2000.0);
        assert_eq!(c.fps(), 10.0);
    }

    #[test]
    fn test_frame_gate() {
        let mut c = controller(); // 10 fps
        let start = Instant::now();
        assert!(c.should_process_frame_at(start));
        assert!(!c.should_process_frame_at(start + Duration::from_millis(50)));
        assert!(c.should_process_frame_at(start + Duration::from_millis(100)));
        assert!(!c.should_process_frame_at(start + Duration::from_millis(199)));
    }

    #[test]
    fn test_quality_from_link_bandwidth() {
        let c = controller();
        assert_eq!(c.select_quality(2000.0).name, QualityName::Low);
        assert_eq!(c.select_quality(3000.0).name, QualityName::Medium);
        assert_eq!(c.select_quality(4000.0).name, QualityName::High);

        let config = ControllerConfig {
            budget_override: Some(0.1),
            ..ControllerConfig::default()
        };
        let c = AdaptiveController::new(config, QualityTable::default());
        assert_eq!(c.select_quality(4000.0).name, QualityName::UltraLow);
    }

    #[test]
    fn test_keyframe_scheduling() {
        let mut c = controller();
        let table = QualityTable::default();
        let level = table.get(QualityName::Medium).unwrap();
        let start = Instant::now();

        assert_eq!(c.frame_kind_at(1, level, 0.0, start), FrameKind::Keyframe);
        c.record_frame(FrameKind::Keyframe, start);
        assert_eq!(c.frame_kind_at(2, level, 0.0, start), FrameKind::Delta);
        assert_eq!(c.frame_kind_at(30, level, 0.0, start), FrameKind::Keyframe);

        let later = start + Duration::from_secs(2);
        assert_eq!(c.frame_kind_at(3, level, 0.0, later), FrameKind::Keyframe);

        c.force_keyframe();
        assert_eq!(c.frame_kind_at(4, level, 0.0, start), FrameKind::Keyframe);
    }

    #[test]
    fn test_emergency_keyframes_by_time_only() {
        let mut c = controller();
        let table = QualityTable::default();
        let level = table.get(QualityName::Low).unwrap();
        let start = Instant::now();

        c.observe_link(&link(0.1, 2000.0));
        assert_eq!(c.frame_kind_at(5, level, 0.0, start), FrameKind::Keyframe);
        c.record_frame(FrameKind::Keyframe, start);

        // Frame 45 would be a cadence keyframe in normal mode.
        let soon = start + Duration::from_millis(2500);
        assert_eq!(c.frame_kind_at(45, level, 0.0, soon), FrameKind::Delta);
        let due = start + Duration::from_secs(3);
        assert_eq!(c.frame_kind_at(46, level, 0.0, due), FrameKind::Keyframe);
    }

    #[test]
    fn test_backlog_steps_quality_down() {
        let mut c = controller();
        let start = Instant::now();
        assert_eq!(c.quality_for(4000.0).name, QualityName::High);

        assert!(!c.observe_backlog(0.2, start));
        assert_eq!(c.backoff(), 0);

        assert!(c.observe_backlog(0.8, start));
        assert_eq!(c.backoff(), 1);
        assert_eq!(c.fps(), 5.0);
        assert_eq!(c.quality_for(4000.0).name, QualityName::Medium);
        // Below the cap the link estimate still decides.
        assert_eq!(c.quality_for(2000.0).name, QualityName::Low);

        // One step per backlog limit.
        assert!(c.observe_backlog(0.8, start + Duration::from_millis(100)));
        assert_eq!(c.backoff(), 1);
        c.observe_backlog(0.8, start + Duration::from_millis(500));
        c.observe_backlog(0.8, start + Duration::from_millis(1000));
        assert_eq!(c.quality_for(4000.0).name, QualityName::UltraLow);
        assert_eq!(c.point_set(), PointSet::Full);

        c.observe_backlog(0.8, start + Duration::from_millis(1500));
        assert_eq!(c.backoff(), 4);
        assert_eq!(c.point_set(), PointSet::Reference);
        assert_eq!(c.quality_for(4000.0).name, QualityName::UltraLow);
        c.observe_backlog(0.8, start + Duration::from_millis(2000));
        assert_eq!(c.backoff(), 4);
    }

    #[test]
    fn test_backoff_recovers_one_step_at_a_time() {
        let mut c = controller();
        let start = Instant::now();
        c.observe_backlog(1.0, start);
        c.observe_backlog(1.0, start + Duration::from_millis(500));
        assert_eq!(c.backoff(), 2);

        let calm = start + Duration::from_millis(500);
        assert!(!c.observe_backlog(0.0, calm + Duration::from_secs(4)));
        assert_eq!(c.backoff(), 2);
        c.observe_backlog(0.0, calm + Duration::from_secs(5));
        assert_eq!(c.backoff(), 1);
        c.observe_backlog(0.0, calm + Duration::from_secs(6));
        assert_eq!(c.backoff(), 1);
        c.observe_backlog(0.0, calm + Duration::from_secs(10));
        assert_eq!(c.backoff(), 0);
        assert_eq!(c.quality_for(4000.0).name, QualityName::High);

        c.observe_backlog(1.0, calm + Duration::from_secs(11));
        c.reset();
        assert_eq!(c.backoff(), 0);
    }

    #[test]
    fn test_unvalidated_refresh_does_not_panic() {
        let config = ControllerConfig {
            keyframe_refresh_secs: 1e300,
            ..ControllerConfig::default()
        };
        let c = AdaptiveController::new(config, QualityTable::default());
        assert_eq!(c.keyframe_refresh(), Duration::MAX);
    }

    proptest! {
        #[test]
        fn prop_quality_monotonic_in_bandwidth(a in 0.0f64..10_000.0, b in 0.0f64..10_000.0) {
            let c = controller();
            let table = c.table();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let lo_index = table.index_of(c.select_quality(lo).name).unwrap();
            let hi_index = table.index_of(c.select_quality(hi).name).unwrap();
            prop_assert!(lo_index <= hi_index);
        }

        #[test]
        fn prop_interval_between_floor_and_base(base in 10u32..200, motion in -1.0f64..2.0) {
            let interval = controller().adjusted_keyframe_interval(base, motion);
            prop_assert!(interval >= 10);
            prop_assert!(interval <= base);
        }

        #[test]
        fn prop_fps_stays_in_range(steps in proptest::collection::vec((0.0f64..8000.0, 0.0f64..1.0), 1..50)) {
            let mut c = controller();
            for (bandwidth, motion) in steps {
                let fps = c.update_frame_rate(bandwidth, motion);
                prop_assert!((5.0 - 1e-9..=15.0 + 1e-9).contains(&fps));
            }
        }
    }
}
