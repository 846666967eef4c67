//! Priority groups, reference points and point sets
//!
//! Landmarks are partitioned into four fixed priority groups. The partition
//! drives both how the codec layers its payload and which points survive
//! when the link degrades.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Fixed partition of landmark indices, ordered by importance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PriorityGroup {
    Face = 0,
    UpperBody = 1,
    Hands = 2,
    LowerBody = 3,
}

const FACE: &[usize] = &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
const UPPER_BODY: &[usize] = &[11, 12, 13, 14, 23, 24];
const HANDS: &[usize] = &[15, 16, 17, 18, 19, 20, 21, 22];
const LOWER_BODY: &[usize] = &[25, 26, 27, 28, 29, 30, 31, 32];

impl PriorityGroup {
    /// All groups, highest priority first
    pub const ALL: [PriorityGroup; 4] = [
        PriorityGroup::Face,
        PriorityGroup::UpperBody,
        PriorityGroup::Hands,
        PriorityGroup::LowerBody,
    ];

    /// Landmark indices in this group, ascending
    pub fn indices(self) -> &'static [usize] {
        match self {
            PriorityGroup::Face => FACE,
            PriorityGroup::UpperBody => UPPER_BODY,
            PriorityGroup::Hands => HANDS,
            PriorityGroup::LowerBody => LOWER_BODY,
        }
    }

    /// Group that owns a landmark index
    pub fn of(index: usize) -> Option<PriorityGroup> {
        Self::ALL
            .into_iter()
            .find(|group| group.indices().contains(&index))
    }

    pub fn name(self) -> &'static str {
        match self {
            PriorityGroup::Face => "face",
            PriorityGroup::UpperBody => "upper_body",
            PriorityGroup::Hands => "hands",
            PriorityGroup::LowerBody => "lower_body",
        }
    }

}

impl fmt::Display for PriorityGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The three landmarks kept when the link is in survival mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReferencePoint {
    #[serde(rename = "head")]
    Head = 0,
    #[serde(rename = "shoulder_l")]
    ShoulderLeft = 1,
    #[serde(rename = "shoulder_r")]
    ShoulderRight = 2,
}

impl ReferencePoint {
    pub const ALL: [ReferencePoint; 3] = [
        ReferencePoint::Head,
        ReferencePoint::ShoulderLeft,
        ReferencePoint::ShoulderRight,
    ];

    /// Landmark index of this reference point
    pub fn index(self) -> usize {
        match self {
            ReferencePoint::Head => 0,
            ReferencePoint::ShoulderLeft => 11,
            ReferencePoint::ShoulderRight => 12,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ReferencePoint::Head => "head",
            ReferencePoint::ShoulderLeft => "shoulder_l",
            ReferencePoint::ShoulderRight => "shoulder_r",
        }
    }
}

impl fmt::Display for ReferencePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which landmarks a packet carries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointSet {
    /// Every landmark, layered by priority group
    #[default]
    Full,
    /// Head and shoulders only
    Reference,
}

impl PointSet {
    /// Does this set include a landmark index?
    pub fn includes(self, index: usize) -> bool {
        match self {
            PointSet::Full => true,
            PointSet::Reference => ReferencePoint::ALL.iter().any(|p| p.index() == index),
        }
    }
}

/// Keyframe or delta
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Keyframe,
    Delta,
}

impl FrameKind {
    /// Transport priority, lower values are sent first
    #[inline]
    pub fn priority(self) -> u8 {
        match self {
            FrameKind::Keyframe => 0,
            FrameKind::Delta => 1,
        }
    }

    pub fn is_keyframe(self) -> bool {
        self == FrameKind::Keyframe
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::POSE_LANDMARK_COUNT;

    #[test]
    fn test_groups_partition_all_landmarks() {
        let mut seen = vec![0u8; POSE_LANDMARK_COUNT];
        for group in PriorityGroup::ALL {
            for &idx in group.indices() {
                seen[idx] += 1;
            }
        }
        assert!(seen.iter().all(|&count| count == 1));
    }

    #[test]
    fn test_group_indices_ascending() {
        for group in PriorityGroup::ALL {
            assert!(group.indices().windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_group_of() {
        assert_eq!(PriorityGroup::of(0), Some(PriorityGroup::Face));
        assert_eq!(PriorityGroup::of(23), Some(PriorityGroup::UpperBody));
        assert_eq!(PriorityGroup::of(16), Some(PriorityGroup::Hands));
        assert_eq!(PriorityGroup::of(32), Some(PriorityGroup::LowerBody));
        assert_eq!(PriorityGroup::of(33), None);
    }

    #[test]
    fn test_reference_set() {
        assert!(PointSet::Reference.includes(0));
        assert!(PointSet::Reference.includes(11));
        assert!(PointSet::Reference.includes(12));
        assert!(!PointSet::Reference.includes(13));
        assert!(PointSet::Full.includes(32));
    }

    #[test]
    fn test_keyframes_sent_first() {
        assert!(FrameKind::Keyframe.priority() < FrameKind::Delta.priority());
    }
}
