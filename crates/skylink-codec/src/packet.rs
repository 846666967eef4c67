//! Compressed packets - what the codec hands to the transport
//!
//! A keyframe carries every transmitted landmark, keyed by priority group
//! (or by reference point name when only head and shoulders are sent). A
//! delta carries, per group, only the landmarks whose residual survived
//! quantization.

use std::collections::BTreeMap;

use skylink_core::{FrameKind, PointSet, PriorityGroup, QualityName, ReferencePoint};

/// A quantized keyframe landmark
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantizedPoint {
    pub x: u16,
    pub y: u16,
    /// Whole percent, `0..=100`
    pub confidence: u8,
}

/// A quantized prediction residual for one landmark
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Residual {
    pub index: u8,
    pub dx: i16,
    pub dy: i16,
}

/// Keyframe body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyframePayload {
    /// Per group, the group's landmarks in ascending index order.
    /// Entry `i` belongs to `group.indices()[i]`.
    Groups(BTreeMap<PriorityGroup, Vec<QuantizedPoint>>),
    /// Head and shoulders by name
    Reference(BTreeMap<ReferencePoint, QuantizedPoint>),
}

impl KeyframePayload {
    /// Number of landmarks carried
    pub fn point_count(&self) -> usize {
        match self {
            KeyframePayload::Groups(groups) => groups.values().map(Vec::len).sum(),
            KeyframePayload::Reference(points) => points.len(),
        }
    }
}

/// Delta body: non-zero residuals per group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaPayload {
    pub groups: BTreeMap<PriorityGroup, Vec<Residual>>,
}

impl DeltaPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, group: PriorityGroup, residual: Residual) {
        self.groups.entry(group).or_default().push(residual);
    }

    /// Number of residuals carried
    pub fn residual_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn residuals(&self) -> impl Iterator<Item = (PriorityGroup, &Residual)> {
        self.groups
            .iter()
            .flat_map(|(group, residuals)| residuals.iter().map(move |r| (*group, r)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Keyframe(KeyframePayload),
    Delta(DeltaPayload),
}

/// One encoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedPacket {
    /// Encoder frame counter, starts at 1
    pub frame_number: u32,
    pub quality: QualityName,
    /// Precision the payload was quantized with
    pub precision_bits: u8,
    pub point_set: PointSet,
    /// Length of the frame the encoder saw
    pub point_count: u8,
    pub payload: Payload,
}

impl CompressedPacket {
    pub fn kind(&self) -> FrameKind {
        match self.payload {
            Payload::Keyframe(_) => FrameKind::Keyframe,
            Payload::Delta(_) => FrameKind::Delta,
        }
    }

    #[inline]
    pub fn is_keyframe(&self) -> bool {
        self.kind().is_keyframe()
    }

    /// Transport priority for this packet
    #[inline]
    pub fn priority(&self) -> u8 {
        self.kind().priority()
    }
}
