//! Keypoints and pose frames
//!
//! A pose frame is what the external pose source hands us once per capture
//! tick: an ordered list of normalized landmarks. The index of a keypoint is
//! its semantic identity (index 0 is the head), so frames are never
//! reordered or compacted.

use serde::{Deserialize, Serialize};

/// Number of landmarks produced by the pose model
pub const POSE_LANDMARK_COUNT: usize = 33;

/// A single landmark, coordinates normalized to `[0, 1]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl Keypoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            z: None,
            confidence: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Confidence, treating a missing value as fully confident
    #[inline]
    pub fn confidence_or_full(&self) -> f32 {
        self.confidence.unwrap_or(1.0)
    }

    /// Planar position
    #[inline]
    pub fn position(&self) -> [f32; 2] {
        [self.x, self.y]
    }
}

/// One frame of landmarks, indexed by landmark identity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoseFrame {
    pub points: Vec<Keypoint>,
}

impl PoseFrame {
    pub fn new(points: Vec<Keypoint>) -> Self {
        Self { points }
    }

    /// A frame of `len` zeroed, zero-confidence points
    pub fn blank(len: usize) -> Self {
        Self {
            points: vec![Keypoint::new(0.0, 0.0).with_confidence(0.0); len],
        }
    }

    /// Build a frame from `(x, y)` pairs
    pub fn from_xy(coords: &[(f32, f32)]) -> Self {
        Self {
            points: coords.iter().map(|&(x, y)| Keypoint::new(x, y)).collect(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&Keypoint> {
        self.points.get(index)
    }

    /// Is the landmark with this identity present?
    #[inline]
    pub fn contains(&self, index: usize) -> bool {
        index < self.points.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Keypoint> {
        self.points.iter()
    }

    /// Overwrite a landmark, growing the frame with blank points if needed
    pub fn set(&mut self, index: usize, point: Keypoint) {
        if index >= self.points.len() {
            self.points
                .resize(index + 1, Keypoint::new(0.0, 0.0).with_confidence(0.0));
        }
        self.points[index] = point;
    }
}

impl From<Vec<Keypoint>> for PoseFrame {
    fn from(points: Vec<Keypoint>) -> Self {
        Self::new(points)
    }
}
