//! Ground station - the receiving end of a link
//!
//! Decodes wire bytes with its own codec state. Deltas only decode against
//! the exact predecessor frame; anything else resets the decoder so it
//! waits for the next keyframe instead of drifting.
//!
//! Refused deltas are held for a while. A keyframe that arrives late (a
//! retransmission overtaken by its own successors) replays the held deltas
//! that follow it, and those frames come out of the next receive calls.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use skylink_codec::{decode_packet, CodecState, CompressedPacket, KeypointCodec};
use skylink_core::{FrameKind, PointSet, PoseFrame, QualityName, SkylinkError, SkylinkResult};
use skylink_transport::LinkAdapter;
use tracing::{debug, info, warn};

/// Refused deltas kept for a late keyframe
pub const HELD_DELTAS: usize = 64;

/// One frame recovered from the link
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub frame_number: u32,
    pub kind: FrameKind,
    pub quality: QualityName,
    pub point_set: PointSet,
    pub frame: PoseFrame,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundStats {
    pub received: u64,
    pub keyframes: u64,
    pub deltas: u64,
    pub stale: u64,
    pub gaps: u64,
    pub missing_reference: u64,
    pub decode_errors: u64,
    /// Held deltas decoded after their keyframe arrived
    pub recovered: u64,
}

pub struct GroundStation {
    link: LinkAdapter,
    codec: CodecState,
    last_frame: Option<u32>,
    held: BTreeMap<u32, CompressedPacket>,
    recovered: VecDeque<DecodedFrame>,
    stats: GroundStats,
}

impl GroundStation {
    pub fn new(link: LinkAdapter) -> Self {
        Self {
            link,
            codec: CodecState::new(),
            last_frame: None,
            held: BTreeMap::new(),
            recovered: VecDeque::new(),
            stats: GroundStats::default(),
        }
    }

    pub fn stats(&self) -> &GroundStats {
        &self.stats
    }

    /// Last frame decoded, if the decoder is in sync
    pub fn latest(&self) -> Option<&PoseFrame> {
        self.codec.reference()
    }

    /// Decode one payload
    pub fn accept(&mut self, data: &[u8]) -> SkylinkResult<DecodedFrame> {
        self.stats.received += 1;

        let packet = decode_packet(data).map_err(|e| {
            self.stats.decode_errors += 1;
            warn!(error = %e, len = data.len(), "undecodable payload");
            e
        })?;
        let number = packet.frame_number;

        if let Some(last) = self.last_frame {
            if number <= last {
                self.stats.stale += 1;
                debug!(number, last, "stale frame dropped");
                return Err(SkylinkError::ReferenceGap {
                    expected: last.wrapping_add(1),
                    actual: number,
                });
            }
        }

        if !packet.is_keyframe() {
            if !self.codec.has_reference() {
                self.stats.missing_reference += 1;
                self.hold(packet);
                return Err(SkylinkError::MissingReferenceFrame);
            }
            let expected = self.last_frame.map_or(0, |last| last.wrapping_add(1));
            if number != expected {
                self.stats.gaps += 1;
                self.codec.reset();
                warn!(expected, actual = number, "frame gap, waiting for keyframe");
                self.hold(packet);
                return Err(SkylinkError::ReferenceGap {
                    expected,
                    actual: number,
                });
            }
        }

        let decoded = self.decode(&packet)?;
        if decoded.kind.is_keyframe() {
            self.replay_held();
        }
        Ok(decoded)
    }

    /// Decoded frames recovered by a late keyframe and not yet handed out
    pub fn pending_recovered(&self) -> usize {
        self.recovered.len()
    }

    /// Next recovered frame, else decode the oldest buffered payload
    pub fn try_receive(&mut self) -> Option<SkylinkResult<DecodedFrame>> {
        if let Some(frame) = self.recovered.pop_front() {
            return Some(Ok(frame));
        }
        let data = self.link.try_receive()?;
        Some(self.accept(&data))
    }

    /// Next recovered frame, else wait up to `timeout` for a payload
    pub async fn receive(&mut self, timeout: Duration) -> Option<SkylinkResult<DecodedFrame>> {
        if let Some(frame) = self.recovered.pop_front() {
            return Some(Ok(frame));
        }
        let data = self.link.receive(timeout).await?;
        Some(self.accept(&data))
    }

    fn decode(&mut self, packet: &CompressedPacket) -> SkylinkResult<DecodedFrame> {
        let frame = KeypointCodec::decompress(packet, &mut self.codec)?;
        self.last_frame = Some(packet.frame_number);
        match packet.kind() {
            FrameKind::Keyframe => self.stats.keyframes += 1,
            FrameKind::Delta => self.stats.deltas += 1,
        }

        Ok(DecodedFrame {
            frame_number: packet.frame_number,
            kind: packet.kind(),
            quality: packet.quality,
            point_set: packet.point_set,
            frame,
        })
    }

    fn hold(&mut self, packet: CompressedPacket) {
        self.held.insert(packet.frame_number, packet);
        while self.held.len() > HELD_DELTAS {
            self.held.pop_first();
        }
    }

    /// Decode held deltas that directly follow the frame just decoded
    fn replay_held(&mut self) {
        let Some(mut last) = self.last_frame else {
            return;
        };
        self.held = self.held.split_off(&last.wrapping_add(1));

        let mut replayed = 0u64;
        while let Some(packet) = self.held.remove(&last.wrapping_add(1)) {
            match self.decode(&packet) {
                Ok(frame) => {
                    last = frame.frame_number;
                    self.recovered.push_back(frame);
                    replayed += 1;
                }
                Err(e) => {
                    self.stats.decode_errors += 1;
                    warn!(error = %e, frame_number = packet.frame_number, "held delta unusable");
                    self.codec.reset();
                    self.held.clear();
                    break;
                }
            }
        }
        if replayed > 0 {
            self.stats.recovered += replayed;
            info!(replayed, through = last, "late keyframe, held deltas recovered");
        }
    }
}
