//! Keypoint codec - keyframe/delta quantization over a shared history
//!
//! Both directions run the same reconstruction. After every packet the
//! encoder rebuilds the frame exactly as a decoder would and feeds *that*
//! into its predictor, so the two sides never diverge on prediction input.
//! Keyframes restart the prediction history on both sides.
//!
//! Reconstruction rules for a delta:
//! - landmarks outside the packet's point set hold their last value
//! - landmarks inside it take the prediction plus the residual (zero when omitted)
//! - positions are clamped to `[0, 1]`

use std::collections::BTreeMap;

use skylink_core::{
    FrameKind, Keypoint, PointSet, PoseFrame, PriorityGroup, QualityLevel, ReferencePoint,
    SkylinkError, SkylinkResult, POSE_LANDMARK_COUNT,
};
use tracing::debug;

use crate::{
    CompressedPacket, DeltaPayload, KeyframePayload, MotionPredictor, Payload, QuantizedPoint,
    Quantizer, Residual,
};

/// Per-session codec state, one per direction
#[derive(Debug, Clone, Default)]
pub struct CodecState {
    predictor: MotionPredictor,
    /// Last reconstructed frame
    reference: Option<PoseFrame>,
    last_keyframe: Option<u32>,
    frame_number: u32,
}

impl CodecState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Is there a keyframe-anchored reference to predict from?
    #[inline]
    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    /// The frame both sides currently agree on
    pub fn reference(&self) -> Option<&PoseFrame> {
        self.reference.as_ref()
    }

    /// Frame number of the last packet produced or consumed
    #[inline]
    pub fn frame_number(&self) -> u32 {
        self.frame_number
    }

    pub fn last_keyframe(&self) -> Option<u32> {
        self.last_keyframe
    }

    pub fn predictor(&self) -> &MotionPredictor {
        &self.predictor
    }

    /// Motion intensity of the reconstructed history
    pub fn motion_intensity(&self) -> f32 {
        self.predictor.motion_intensity()
    }

    /// Drop history and reference, keep the frame counter
    pub fn reset(&mut self) {
        self.predictor.clear();
        self.reference = None;
        self.last_keyframe = None;
    }

    /// A keyframe restarts the history, so a receiver that joins or resyncs
    /// on it predicts exactly what the sender predicts.
    fn commit(&mut self, frame: PoseFrame, frame_number: u32, keyframe: bool) {
        if keyframe {
            self.predictor.clear();
            self.last_keyframe = Some(frame_number);
        }
        self.predictor.update(&frame);
        self.reference = Some(frame);
        self.frame_number = frame_number;
    }

    /// Prediction for one landmark, falling back to its last reconstructed value
    fn base_position(&self, index: usize) -> Option<[f32; 2]> {
        self.predictor
            .predict_index(index)
            .or_else(|| self.reference.as_ref()?.get(index).map(Keypoint::position))
            .map(clamp_position)
    }
}

/// What the caller wants encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeRequest {
    pub kind: FrameKind,
    pub point_set: PointSet,
}

impl EncodeRequest {
    pub fn keyframe() -> Self {
        Self {
            kind: FrameKind::Keyframe,
            point_set: PointSet::Full,
        }
    }

    pub fn delta() -> Self {
        Self {
            kind: FrameKind::Delta,
            point_set: PointSet::Full,
        }
    }

    pub fn with_point_set(mut self, point_set: PointSet) -> Self {
        self.point_set = point_set;
        self
    }
}

/// Keyframe/delta keypoint codec
pub struct KeypointCodec;

impl KeypointCodec {
    /// Encode a frame.
    ///
    /// Returns `None` for an empty frame. A delta request without a usable
    /// reference is encoded as a keyframe instead.
    pub fn compress(
        frame: &PoseFrame,
        level: &QualityLevel,
        request: EncodeRequest,
        state: &mut CodecState,
    ) -> Option<CompressedPacket> {
        if frame.is_empty() {
            debug!("empty frame, nothing to encode");
            return None;
        }

        let quantizer = Quantizer::from(level);
        let point_count = frame.len().min(POSE_LANDMARK_COUNT);
        let frame_number = state.frame_number.wrapping_add(1);

        let reference_len = state.reference.as_ref().map(PoseFrame::len);
        let kind = match (request.kind, reference_len) {
            (FrameKind::Delta, Some(len)) if point_count <= len => FrameKind::Delta,
            (FrameKind::Delta, _) => {
                debug!(frame_number, "no usable reference, falling back to keyframe");
                FrameKind::Keyframe
            }
            (FrameKind::Keyframe, _) => FrameKind::Keyframe,
        };

        let payload = match kind {
            FrameKind::Keyframe => {
                Payload::Keyframe(encode_keyframe(frame, request.point_set, &quantizer))
            }
            FrameKind::Delta => Payload::Delta(encode_delta(
                frame,
                point_count,
                request.point_set,
                &quantizer,
                state,
            )),
        };

        let packet = CompressedPacket {
            frame_number,
            quality: level.name,
            precision_bits: quantizer.precision_bits(),
            point_set: request.point_set,
            point_count: point_count as u8,
            payload,
        };

        let reconstructed = reconstruct(&packet, &quantizer, state);
        state.commit(reconstructed, frame_number, kind.is_keyframe());

        debug!(
            frame_number,
            kind = ?kind,
            quality = %level.name,
            "encoded frame"
        );
        Some(packet)
    }

    /// Decode a packet against the receiver's state.
    ///
    /// A delta without a stored keyframe fails with `MissingReferenceFrame`
    /// and leaves the state untouched.
    pub fn decompress(
        packet: &CompressedPacket,
        state: &mut CodecState,
    ) -> SkylinkResult<PoseFrame> {
        let quantizer = Quantizer::new(packet.precision_bits);

        if let Payload::Delta(_) = packet.payload {
            match state.reference.as_ref() {
                Some(reference) if packet.point_count as usize <= reference.len() => {}
                _ => return Err(SkylinkError::MissingReferenceFrame),
            }
        }

        let frame = reconstruct(packet, &quantizer, state);
        state.commit(frame.clone(), packet.frame_number, packet.is_keyframe());
        Ok(frame)
    }
}

fn quantize_point(point: &Keypoint, quantizer: &Quantizer) -> QuantizedPoint {
    QuantizedPoint {
        x: quantizer.quantize_coord(point.x),
        y: quantizer.quantize_coord(point.y),
        confidence: Quantizer::quantize_confidence(point.confidence),
    }
}

fn encode_keyframe(frame: &PoseFrame, point_set: PointSet, quantizer: &Quantizer) -> KeyframePayload {
    match point_set {
        PointSet::Full => {
            let mut groups = BTreeMap::new();
            for group in PriorityGroup::ALL {
                let points: Vec<QuantizedPoint> = group
                    .indices()
                    .iter()
                    .map_while(|&idx| frame.get(idx))
                    .map(|point| quantize_point(point, quantizer))
                    .collect();
                if !points.is_empty() {
                    groups.insert(group, points);
                }
            }
            KeyframePayload::Groups(groups)
        }
        PointSet::Reference => KeyframePayload::Reference(
            ReferencePoint::ALL
                .into_iter()
                .filter_map(|point| {
                    frame
                        .get(point.index())
                        .map(|kp| (point, quantize_point(kp, quantizer)))
                })
                .collect(),
        ),
    }
}

fn encode_delta(
    frame: &PoseFrame,
    point_count: usize,
    point_set: PointSet,
    quantizer: &Quantizer,
    state: &CodecState,
) -> DeltaPayload {
    let mut delta = DeltaPayload::new();
    for group in PriorityGroup::ALL {
        for &idx in group.indices() {
            if idx >= point_count || !point_set.includes(idx) {
                continue;
            }
            let (Some(actual), Some(base)) = (frame.get(idx), state.base_position(idx)) else {
                continue;
            };
            let dx = quantizer.quantize_residual(actual.x - base[0]);
            let dy = quantizer.quantize_residual(actual.y - base[1]);
            if dx != 0 || dy != 0 {
                delta.push(
                    group,
                    Residual {
                        index: idx as u8,
                        dx,
                        dy,
                    },
                );
            }
        }
    }
    delta
}

/// Rebuild the frame a packet describes. Callers check delta preconditions.
///
/// Keyframes start from a blank frame, so points a reference keyframe leaves
/// out read as zero-confidence on both sides. Deltas start from the reference.
fn reconstruct(packet: &CompressedPacket, quantizer: &Quantizer, state: &CodecState) -> PoseFrame {
    let point_count = packet.point_count as usize;
    let mut frame = match (&packet.payload, &state.reference) {
        (Payload::Delta(_), Some(reference)) => reference.clone(),
        _ => PoseFrame::blank(point_count),
    };
    frame
        .points
        .resize(point_count, Keypoint::new(0.0, 0.0).with_confidence(0.0));

    match &packet.payload {
        Payload::Keyframe(KeyframePayload::Groups(groups)) => {
            for (group, points) in groups {
                for (&idx, q) in group.indices().iter().zip(points) {
                    if idx < point_count {
                        frame.points[idx] = dequantize_point(q, quantizer);
                    }
                }
            }
        }
        Payload::Keyframe(KeyframePayload::Reference(points)) => {
            for (reference, q) in points {
                let idx = reference.index();
                if idx < point_count {
                    frame.points[idx] = dequantize_point(q, quantizer);
                }
            }
        }
        Payload::Delta(delta) => {
            let residuals: BTreeMap<usize, (i16, i16)> = delta
                .residuals()
                .map(|(_, r)| (r.index as usize, (r.dx, r.dy)))
                .collect();

            for idx in 0..point_count {
                if !packet.point_set.includes(idx) {
                    continue;
                }
                let Some(base) = state.base_position(idx) else {
                    continue;
                };
                let (dx, dy) = residuals.get(&idx).copied().unwrap_or((0, 0));
                let [x, y] = clamp_position([
                    base[0] + quantizer.dequantize_residual(dx),
                    base[1] + quantizer.dequantize_residual(dy),
                ]);
                let point = &mut frame.points[idx];
                point.x = x;
                point.y = y;
                point.z = None;
            }
        }
    }

    frame
}

fn dequantize_point(q: &QuantizedPoint, quantizer: &Quantizer) -> Keypoint {
    Keypoint::new(quantizer.dequantize_coord(q.x), quantizer.dequantize_coord(q.y))
        .with_confidence(Quantizer::dequantize_confidence(q.confidence))
}

#[inline]
fn clamp_position(p: [f32; 2]) -> [f32; 2] {
    [p[0].clamp(0.0, 1.0), p[1].clamp(0.0, 1.0)]
}
