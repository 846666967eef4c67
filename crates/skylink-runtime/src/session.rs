//! Telemetry session - one pose stream over one link
//!
//! A session exclusively owns its codec state, controller, throughput
//! monitor and link adapter. Nothing is shared between sessions.
//!
//! Per offered frame:
//! 1. Read the link snapshot and run the emergency state machine
//! 2. Update the target fps and enforce the throughput budget
//! 3. Hold the frame back if the send queue is congested
//! 4. Gate the frame against the fps
//! 5. Pick quality, point set and frame kind
//! 6. Compress, serialize and queue on the link

use std::time::Instant;

use serde::{Deserialize, Serialize};
use skylink_codec::{encode_packet, CodecState, EncodeRequest, KeypointCodec};
use skylink_core::{FrameKind, PoseFrame, QualityName, SkylinkError, SkylinkResult};
use skylink_transport::{BandwidthMonitor, LinkAdapter, LinkStatus, MonitorHandle};
use tracing::{debug, info, warn};

use crate::{AdaptiveController, Mode, ModeTransition, SkylinkConfig};

/// What happened to an offered frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Arrived faster than the current fps allows
    Skipped,
    /// Dropped while the send queue drains
    Congested,
    /// No points to encode
    Empty,
    /// Queued on the link
    Sent {
        sequence: u64,
        kind: FrameKind,
        bytes: usize,
    },
    /// Encoded but refused by the link
    SendFailed,
}

/// Session counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub frames_offered: u64,
    pub frames_skipped: u64,
    pub frames_congested: u64,
    pub frames_empty: u64,
    pub keyframes_sent: u64,
    pub deltas_sent: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
    pub emergency_entries: u64,
}

/// Controller and link state for whoever presents it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub fps: f64,
    /// Level of the last frame sent, none before the first
    pub quality: Option<QualityName>,
    /// Quality levels shed for congestion
    pub backoff: usize,
    pub mode: Mode,
    pub emergency: bool,
    pub link: LinkStatus,
    /// Measured outgoing throughput (bps)
    pub measured_bandwidth: f64,
    /// Codec budget in kbps
    pub budget_kbps: f64,
    pub stats: SessionStats,
}

pub struct TelemetrySession {
    config: SkylinkConfig,
    codec: CodecState,
    controller: AdaptiveController,
    throughput: BandwidthMonitor,
    link: LinkAdapter,
    monitor: Option<MonitorHandle>,
    last_quality: Option<QualityName>,
    stats: SessionStats,
}

impl TelemetrySession {
    /// Session with its link monitor running on the current tokio runtime
    pub fn start(config: SkylinkConfig) -> SkylinkResult<Self> {
        tokio::runtime::Handle::try_current().map_err(|e| {
            SkylinkError::TransportError(format!("link monitor needs a tokio runtime: {}", e))
        })?;

        let mut session = Self::manual(config)?;
        session.monitor = Some(session.link.spawn_monitor());
        info!("telemetry session started");
        Ok(session)
    }

    /// Session without a monitor task; the caller drives [`Self::tick_at`]
    pub fn manual(config: SkylinkConfig) -> SkylinkResult<Self> {
        Self::manual_at(config, Instant::now())
    }

    /// Manual session whose clocks start at `now`, for synthetic time
    pub fn manual_at(config: SkylinkConfig, now: Instant) -> SkylinkResult<Self> {
        config.validate()?;

        let controller = AdaptiveController::new(config.controller.clone(), config.quality.clone());
        let link = LinkAdapter::new(config.link.clone(), config.channel.clone());

        Ok(Self {
            config,
            codec: CodecState::new(),
            controller,
            throughput: BandwidthMonitor::starting_at(now),
            link,
            monitor: None,
            last_quality: None,
            stats: SessionStats::default(),
        })
    }

    pub fn config(&self) -> &SkylinkConfig {
        &self.config
    }

    pub fn link(&self) -> &LinkAdapter {
        &self.link
    }

    pub fn controller(&self) -> &AdaptiveController {
        &self.controller
    }

    pub fn codec(&self) -> &CodecState {
        &self.codec
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn process_frame(&mut self, frame: &PoseFrame) -> FrameOutcome {
        self.process_frame_at(frame, Instant::now())
    }

    /// Offer one captured frame at `now`
    pub fn process_frame_at(&mut self, frame: &PoseFrame, now: Instant) -> FrameOutcome {
        self.stats.frames_offered += 1;

        let link = self.link.link_status_at(now);
        if let ModeTransition::EnteredEmergency(_) = self.controller.observe_link(&link) {
            self.link.emergency_mode_at(now);
            // The flushed bytes never reached the link.
            self.throughput.reset_at(now);
            self.stats.emergency_entries += 1;
        }

        let motion = f64::from(self.codec.motion_intensity());
        self.controller.update_frame_rate(link.bandwidth_estimate, motion);
        self.controller
            .enforce_budget(self.throughput.bandwidth_at(now), link.bandwidth_estimate);

        let backlog_secs =
            self.link.queued_bytes() as f64 * 8.0 / link.bandwidth_estimate.max(1.0);
        if self.controller.observe_backlog(backlog_secs, now) {
            self.stats.frames_congested += 1;
            debug!(backlog_secs, "frame held back, send queue congested");
            return FrameOutcome::Congested;
        }

        if !self.controller.should_process_frame_at(now) {
            self.stats.frames_skipped += 1;
            return FrameOutcome::Skipped;
        }

        let level = *self.controller.quality_for(link.bandwidth_estimate);
        let frame_number = self.codec.frame_number().wrapping_add(1);
        let kind = self.controller.frame_kind_at(frame_number, &level, motion, now);
        let request = EncodeRequest {
            kind,
            point_set: self.controller.point_set(),
        };

        let Some(packet) = KeypointCodec::compress(frame, &level, request, &mut self.codec) else {
            self.stats.frames_empty += 1;
            return FrameOutcome::Empty;
        };

        let kind = packet.kind();
        let bytes = encode_packet(&packet);
        let size = bytes.len();

        match self.link.send_at(bytes, packet.priority(), now) {
            Some(sequence) => {
                self.throughput.update_at(size, now);
                self.controller.record_frame(kind, now);
                self.last_quality = Some(packet.quality);
                match kind {
                    FrameKind::Keyframe => self.stats.keyframes_sent += 1,
                    FrameKind::Delta => self.stats.deltas_sent += 1,
                }
                self.stats.bytes_sent += size as u64;
                debug!(
                    sequence,
                    frame_number = packet.frame_number,
                    ?kind,
                    size,
                    "frame queued"
                );
                FrameOutcome::Sent {
                    sequence,
                    kind,
                    bytes: size,
                }
            }
            None => {
                // The receiver will miss this frame; resync on the next one.
                self.controller.force_keyframe();
                self.stats.send_failures += 1;
                FrameOutcome::SendFailed
            }
        }
    }

    /// One link monitor step, for sessions without a monitor task
    pub fn tick_at(&self, now: Instant) -> LinkStatus {
        self.link.tick(now)
    }

    pub fn status(&self) -> SessionStatus {
        self.status_at(Instant::now())
    }

    pub fn status_at(&self, now: Instant) -> SessionStatus {
        let link = self.link.link_status_at(now);
        SessionStatus {
            fps: self.controller.fps(),
            quality: self.last_quality,
            backoff: self.controller.backoff(),
            mode: self.controller.mode(),
            emergency: self.controller.is_emergency(),
            measured_bandwidth: self.throughput.bandwidth_at(now),
            budget_kbps: self.controller.budget_for(link.bandwidth_estimate),
            link,
            stats: self.stats.clone(),
        }
    }

    /// Signal the monitor, clear codec and controller state, close the link.
    ///
    /// Safe with sends in flight on other clones of the link.
    pub fn stop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.signal();
        }
        self.codec.reset();
        self.controller.reset();
        self.last_quality = None;
        self.link.close();
        info!(
            frames = self.stats.frames_offered,
            bytes = self.stats.bytes_sent,
            "telemetry session stopped"
        );
    }

    /// Stop and wait for the monitor task to exit
    pub async fn shutdown(mut self) {
        let monitor = self.monitor.take();
        self.stop();
        if let Some(monitor) = monitor {
            monitor.shutdown().await;
        }
    }
}

impl Drop for TelemetrySession {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            warn!("telemetry session dropped without stop");
            monitor.signal();
        }
    }
}
