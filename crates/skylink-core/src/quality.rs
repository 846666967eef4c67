//! Quality levels - precision and keyframe cadence chosen by bandwidth
//!
//! Four ordered levels. Higher levels quantize with more bits and send
//! keyframes more often. Selection walks the bands from the lowest level up
//! and takes the first whose inclusive upper bound admits the budget.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{SkylinkError, SkylinkResult};

/// Smallest precision the delta path can work with (`precision - 2` signed bits)
pub const MIN_PRECISION_BITS: u8 = 4;

/// Largest precision that fits the 16-bit wire coordinates
pub const MAX_PRECISION_BITS: u8 = 16;

/// Quality level identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum QualityName {
    UltraLow = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl QualityName {
    pub const ALL: [QualityName; 4] = [
        QualityName::UltraLow,
        QualityName::Low,
        QualityName::Medium,
        QualityName::High,
    ];

    pub fn name(self) -> &'static str {
        match self {
            QualityName::UltraLow => "ultra_low",
            QualityName::Low => "low",
            QualityName::Medium => "medium",
            QualityName::High => "high",
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(b: u8) -> SkylinkResult<Self> {
        match b {
            0 => Ok(QualityName::UltraLow),
            1 => Ok(QualityName::Low),
            2 => Ok(QualityName::Medium),
            3 => Ok(QualityName::High),
            _ => Err(SkylinkError::UnknownQualityLevel(b)),
        }
    }
}

impl fmt::Display for QualityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One row of the quality table
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityLevel {
    pub name: QualityName,
    /// Bits per keyframe coordinate
    pub precision_bits: u8,
    /// Base keyframe cadence in frames
    pub keyframe_interval: u32,
    /// Inclusive upper budget bound (kbps); `None` for the top level
    #[serde(default)]
    pub max_budget: Option<f64>,
}

impl QualityLevel {
    /// Does a budget fall within this level's band?
    pub fn admits(&self, budget: f64) -> bool {
        match self.max_budget {
            Some(max) => budget <= max,
            None => true,
        }
    }
}

/// The four-level quality table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityTable {
    pub levels: Vec<QualityLevel>,
}

impl Default for QualityTable {
    fn default() -> Self {
        Self {
            levels: vec![
                QualityLevel {
                    name: QualityName::UltraLow,
                    precision_bits: 4,
                    keyframe_interval: 60,
                    max_budget: Some(0.15),
                },
                QualityLevel {
                    name: QualityName::Low,
                    precision_bits: 6,
                    keyframe_interval: 45,
                    max_budget: Some(0.25),
                },
                QualityLevel {
                    name: QualityName::Medium,
                    precision_bits: 8,
                    keyframe_interval: 30,
                    max_budget: Some(0.35),
                },
                QualityLevel {
                    name: QualityName::High,
                    precision_bits: 10,
                    keyframe_interval: 20,
                    max_budget: None,
                },
            ],
        }
    }
}

impl QualityTable {
    /// Pick the level for a budget, lowest band first.
    ///
    /// Non-finite or negative budgets select the lowest level.
    pub fn select(&self, budget: f64) -> &QualityLevel {
        let budget = if budget.is_nan() { 0.0 } else { budget.max(0.0) };
        self.levels
            .iter()
            .find(|level| level.admits(budget))
            .or_else(|| self.levels.last())
            .unwrap_or(&FALLBACK_LEVEL)
    }

    /// Look a level up by name
    pub fn get(&self, name: QualityName) -> Option<&QualityLevel> {
        self.levels.iter().find(|level| level.name == name)
    }

    /// Position of a level in the table
    pub fn index_of(&self, name: QualityName) -> Option<usize> {
        self.levels.iter().position(|level| level.name == name)
    }

    /// Reject tables that would break selection or quantization
    pub fn validate(&self) -> SkylinkResult<()> {
        if self.levels.len() != QualityName::ALL.len() {
            return Err(invalid(format!(
                "quality table needs {} levels, got {}",
                QualityName::ALL.len(),
                self.levels.len()
            )));
        }

        for (level, expected) in self.levels.iter().zip(QualityName::ALL) {
            if level.name != expected {
                return Err(invalid(format!(
                    "quality table out of order: expected {}, got {}",
                    expected, level.name
                )));
            }
            if !(MIN_PRECISION_BITS..=MAX_PRECISION_BITS).contains(&level.precision_bits) {
                return Err(invalid(format!(
                    "{}: precision {} outside [{}, {}]",
                    level.name, level.precision_bits, MIN_PRECISION_BITS, MAX_PRECISION_BITS
                )));
            }
            if level.keyframe_interval == 0 {
                return Err(invalid(format!("{}: keyframe interval is zero", level.name)));
            }
        }

        for pair in self.levels.windows(2) {
            let (lower, higher) = (&pair[0], &pair[1]);
            if higher.precision_bits <= lower.precision_bits {
                return Err(invalid(format!(
                    "precision must increase from {} to {}",
                    lower.name, higher.name
                )));
            }
            if higher.keyframe_interval > lower.keyframe_interval {
                return Err(invalid(format!(
                    "keyframe interval must not grow from {} to {}",
                    lower.name, higher.name
                )));
            }
            match (lower.max_budget, higher.max_budget) {
                (Some(lo), Some(hi)) if hi > lo && lo.is_finite() && hi.is_finite() => {}
                (Some(lo), None) if lo.is_finite() => {}
                _ => {
                    return Err(invalid(format!(
                        "budget thresholds must increase from {} to {}",
                        lower.name, higher.name
                    )))
                }
            }
        }

        if let Some(top) = self.levels.last() {
            if top.max_budget.is_some() {
                return Err(invalid(format!("{} must be unbounded", top.name)));
            }
        }

        Ok(())
    }
}

const FALLBACK_LEVEL: QualityLevel = QualityLevel {
    name: QualityName::UltraLow,
    precision_bits: MIN_PRECISION_BITS,
    keyframe_interval: 60,
    max_budget: None,
};

fn invalid(msg: String) -> SkylinkError {
    SkylinkError::InvalidConfig(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_table_is_valid() {
        assert!(QualityTable::default().validate().is_ok());
    }

    #[test]
    fn test_band_selection() {
        let table = QualityTable::default();
        assert_eq!(table.select(0.1).name, QualityName::UltraLow);
        assert_eq!(table.select(0.15).name, QualityName::UltraLow);
        assert_eq!(table.select(0.2).name, QualityName::Low);
        assert_eq!(table.select(0.25).name, QualityName::Low);
        assert_eq!(table.select(0.3).name, QualityName::Medium);
        assert_eq!(table.select(0.35).name, QualityName::Medium);
        assert_eq!(table.select(0.36).name, QualityName::High);
        assert_eq!(table.select(f64::NAN).name, QualityName::UltraLow);
    }

    #[test]
    fn test_rejects_non_monotonic_precision() {
        let mut table = QualityTable::default();
        table.levels[2].precision_bits = 6;
        assert!(matches!(table.validate(), Err(SkylinkError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_non_monotonic_thresholds() {
        let mut table = QualityTable::default();
        table.levels[1].max_budget = Some(0.1);
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_rejects_wrong_length() {
        let mut table = QualityTable::default();
        table.levels.pop();
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_rejects_bounded_top_level() {
        let mut table = QualityTable::default();
        table.levels[3].max_budget = Some(0.5);
        assert!(table.validate().is_err());
    }

    proptest! {
        #[test]
        fn prop_selection_is_monotonic(a in 0.0f64..1.0, b in 0.0f64..1.0) {
            let table = QualityTable::default();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let lo_idx = table.index_of(table.select(lo).name).unwrap();
            let hi_idx = table.index_of(table.select(hi).name).unwrap();
            prop_assert!(lo_idx <= hi_idx);
        }
    }
}
