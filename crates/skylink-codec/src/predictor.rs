//! Motion predictor - where each landmark should be next frame
//!
//! Keeps a short history per priority group and extrapolates each landmark
//! from its last few positions. The codec only ever feeds it reconstructed
//! frames, so the encoder and decoder hold identical histories.

use std::collections::{BTreeMap, VecDeque};

use skylink_core::{Keypoint, PoseFrame, PriorityGroup};

/// Samples kept per group
pub const HISTORY_CAPACITY: usize = 10;

/// One group's landmark positions from a single frame, in group index order
type GroupSample = Vec<[f32; 2]>;

/// Per-group motion history and extrapolation
#[derive(Debug, Clone)]
pub struct MotionPredictor {
    history: BTreeMap<PriorityGroup, VecDeque<GroupSample>>,
    capacity: usize,
}

impl MotionPredictor {
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: PriorityGroup::ALL
                .into_iter()
                .map(|group| (group, VecDeque::with_capacity(capacity)))
                .collect(),
            capacity,
        }
    }

    /// Append a frame to every group it has landmarks for.
    ///
    /// Groups missing from the frame keep their previous history untouched.
    pub fn update(&mut self, frame: &PoseFrame) {
        for (group, samples) in self.history.iter_mut() {
            let sample: GroupSample = group
                .indices()
                .iter()
                .map_while(|&idx| frame.get(idx).map(Keypoint::position))
                .collect();
            if sample.is_empty() {
                continue;
            }
            if samples.len() == self.capacity {
                samples.pop_front();
            }
            samples.push_back(sample);
        }
    }

    /// Number of samples held for a group
    pub fn depth(&self, group: PriorityGroup) -> usize {
        self.history.get(&group).map_or(0, VecDeque::len)
    }

    /// Predicted next position for one landmark.
    ///
    /// Second order with three or more samples, first order with two, the
    /// last known position with one, `None` with none.
    pub fn predict_index(&self, index: usize) -> Option<[f32; 2]> {
        let group = PriorityGroup::of(index)?;
        let slot = group.indices().iter().position(|&i| i == index)?;
        let samples = self.history.get(&group)?;

        // Only trailing samples that actually carry this landmark count.
        let recent: Vec<[f32; 2]> = samples
            .iter()
            .rev()
            .map_while(|sample| sample.get(slot).copied())
            .take(3)
            .collect();

        match recent.as_slice() {
            [p2, p1, p0] => {
                let v1 = sub(*p2, *p1);
                let v0 = sub(*p1, *p0);
                let accel = sub(v1, v0);
                Some([
                    p2[0] + v1[0] + 0.5 * accel[0],
                    p2[1] + v1[1] + 0.5 * accel[1],
                ])
            }
            [p1, p0] => {
                let v = sub(*p1, *p0);
                Some([p1[0] + v[0], p1[1] + v[1]])
            }
            [p] => Some(*p),
            _ => None,
        }
    }

    /// Predicted next frame, `None` until some group has two samples
    pub fn predict(&self) -> Option<PoseFrame> {
        if self.history.values().all(|samples| samples.len() < 2) {
            return None;
        }

        let len = self
            .history
            .iter()
            .filter_map(|(group, samples)| {
                let present = samples.back()?.len();
                group.indices().get(present.checked_sub(1)?).map(|&i| i + 1)
            })
            .max()
            .unwrap_or(0);

        let mut frame = PoseFrame::blank(len);
        for index in 0..len {
            if let Some([x, y]) = self.predict_index(index) {
                frame.set(index, Keypoint::new(x, y));
            }
        }
        Some(frame)
    }

    /// Mean absolute positional change over the last two samples.
    ///
    /// Averaged per group, then across groups with at least two samples.
    /// A control signal, not a probability: it is not bounded to 1.
    pub fn motion_intensity(&self) -> f32 {
        let mut total = 0.0f32;
        let mut groups = 0u32;

        for samples in self.history.values() {
            let n = samples.len();
            if n < 2 {
                continue;
            }
            let (prev, last) = (&samples[n - 2], &samples[n - 1]);
            let mut sum = 0.0f32;
            let mut count = 0u32;
            for (a, b) in prev.iter().zip(last.iter()) {
                sum += (b[0] - a[0]).abs() + (b[1] - a[1]).abs();
                count += 2;
            }
            if count > 0 {
                total += sum / count as f32;
                groups += 1;
            }
        }

        if groups == 0 {
            0.0
        } else {
            total / groups as f32
        }
    }

    /// Drop all history
    pub fn clear(&mut self) {
        for samples in self.history.values_mut() {
            samples.clear();
        }
    }
}

impl Default for MotionPredictor {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn sub(a: [f32; 2], b: [f32; 2]) -> [f32; 2] {
    [a[0] - b[0], a[1] - b[1]]
}
