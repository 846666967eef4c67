//! Synthetic pose sources
//!
//! Stand-ins for a camera and pose model:
//! - Static (no motion at all)
//! - Sway (smooth sinusoidal drift, like a person shifting weight)
//! - Jitter (seeded noise around a rest pose)
//! - Walk (sway plus a per-limb swing on the lower body)
//!
//! Any pattern can be truncated to model a model that dropped the tail of
//! the landmark list.

use std::f32::consts::TAU;

use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;
use skylink_core::{Keypoint, PoseFrame, PriorityGroup, POSE_LANDMARK_COUNT};

/// Motion pattern of a synthetic source
#[derive(Clone, Debug, PartialEq)]
pub enum PosePattern {
    Static,
    Sway { amplitude: f32, period_frames: u32 },
    Jitter { amplitude: f32 },
    Walk { stride: f32, period_frames: u32 },
}

impl PosePattern {
    pub fn gentle_sway() -> Self {
        PosePattern::Sway {
            amplitude: 0.05,
            period_frames: 60,
        }
    }

    pub fn walking() -> Self {
        PosePattern::Walk {
            stride: 0.08,
            period_frames: 30,
        }
    }
}

/// Rest position of a landmark: a standing figure centered in frame
pub fn rest_position(index: usize) -> (f32, f32) {
    let row = index as f32 / POSE_LANDMARK_COUNT as f32;
    let side = match index % 3 {
        0 => 0.0,
        1 => -1.0,
        _ => 1.0,
    };
    (0.5 + 0.12 * side * (0.5 + row), 0.1 + 0.8 * row)
}

/// Deterministic pose generator
#[derive(Clone, Debug)]
pub struct SyntheticPose {
    pattern: PosePattern,
    points: usize,
    step: u32,
    rng: StdRng,
}

impl SyntheticPose {
    pub fn new(pattern: PosePattern, seed: u64) -> Self {
        Self {
            pattern,
            points: POSE_LANDMARK_COUNT,
            step: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn still() -> Self {
        Self::new(PosePattern::Static, 0)
    }

    /// Emit only the first `points` landmarks
    pub fn truncated(mut self, points: usize) -> Self {
        self.points = points.min(POSE_LANDMARK_COUNT);
        self
    }

    pub fn pattern(&self) -> &PosePattern {
        &self.pattern
    }

    pub fn step(&self) -> u32 {
        self.step
    }

    /// Produce the next frame
    pub fn next_frame(&mut self) -> PoseFrame {
        let step = self.step;
        self.step = self.step.wrapping_add(1);

        let noise = Uniform::new_inclusive(-1.0f32, 1.0);
        let mut points = Vec::with_capacity(self.points);
        for index in 0..self.points {
            let (rest_x, rest_y) = rest_position(index);
            let (dx, dy) = match self.pattern {
                PosePattern::Static => (0.0, 0.0),
                PosePattern::Sway {
                    amplitude,
                    period_frames,
                } => {
                    let phase = TAU * step as f32 / period_frames.max(1) as f32;
                    (amplitude * phase.sin(), 0.2 * amplitude * (2.0 * phase).sin())
                }
                PosePattern::Jitter { amplitude } => (
                    amplitude * noise.sample(&mut self.rng),
                    amplitude * noise.sample(&mut self.rng),
                ),
                PosePattern::Walk {
                    stride,
                    period_frames,
                } => {
                    let phase = TAU * step as f32 / period_frames.max(1) as f32;
                    let sway = 0.25 * stride * phase.sin();
                    let swing = match PriorityGroup::of(index) {
                        Some(PriorityGroup::LowerBody) | Some(PriorityGroup::Hands) => {
                            let leg = if index % 2 == 0 { 1.0 } else { -1.0 };
                            stride * leg * phase.sin()
                        }
                        _ => 0.0,
                    };
                    (sway + swing, 0.1 * stride * (2.0 * phase).cos().abs())
                }
            };
            points.push(
                Keypoint::new(
                    (rest_x + dx).clamp(0.0, 1.0),
                    (rest_y + dy).clamp(0.0, 1.0),
                )
                .with_confidence(0.95),
            );
        }
        PoseFrame::new(points)
    }
}

impl Iterator for SyntheticPose {
    type Item = PoseFrame;

    fn next(&mut self) -> Option<PoseFrame> {
        Some(self.next_frame())
    }
}
