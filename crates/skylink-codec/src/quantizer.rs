//! Fixed-precision quantization of coordinates and residuals
//!
//! Keyframe coordinates round to the nearest of `2^bits` steps, which keeps
//! the reconstruction error under `1 / 2^bits`. Residuals truncate toward
//! zero at `bits - 2` signed bits and clamp to the representable range, so
//! small prediction errors collapse to zero and drop out of the payload.
//! No stochastic rounding anywhere: the same input always quantizes the same.

use skylink_core::QualityLevel;

/// Quantizer for one precision setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quantizer {
    precision_bits: u8,
}

impl Quantizer {
    pub fn new(precision_bits: u8) -> Self {
        Self { precision_bits }
    }

    #[inline]
    pub fn precision_bits(&self) -> u8 {
        self.precision_bits
    }

    /// Largest quantized coordinate
    #[inline]
    pub fn max_value(&self) -> u16 {
        ((1u32 << self.precision_bits.min(16)) - 1) as u16
    }

    /// Signed bits available to a residual
    #[inline]
    pub fn delta_bits(&self) -> u8 {
        self.precision_bits.saturating_sub(2)
    }

    /// Residual steps per normalized unit
    #[inline]
    pub fn delta_scale(&self) -> f32 {
        (1u32 << self.delta_bits()) as f32
    }

    /// Largest representable residual magnitude
    #[inline]
    pub fn max_delta(&self) -> i16 {
        ((1i32 << self.delta_bits().saturating_sub(1)) - 1) as i16
    }

    /// Normalized coordinate to `[0, max_value]`
    #[inline]
    pub fn quantize_coord(&self, value: f32) -> u16 {
        let max = self.max_value() as f32;
        (value.clamp(0.0, 1.0) * max).round() as u16
    }

    #[inline]
    pub fn dequantize_coord(&self, q: u16) -> f32 {
        q.min(self.max_value()) as f32 / self.max_value() as f32
    }

    /// Residual to a clamped signed step count
    #[inline]
    pub fn quantize_residual(&self, residual: f32) -> i16 {
        let max = self.max_delta() as f32;
        (residual * self.delta_scale()).trunc().clamp(-max, max) as i16
    }

    #[inline]
    pub fn dequantize_residual(&self, q: i16) -> f32 {
        q as f32 / self.delta_scale()
    }

    /// Confidence to whole percent; missing confidence counts as full
    #[inline]
    pub fn quantize_confidence(confidence: Option<f32>) -> u8 {
        (confidence.unwrap_or(1.0).clamp(0.0, 1.0) * 100.0).round() as u8
    }

    #[inline]
    pub fn dequantize_confidence(q: u8) -> f32 {
        q.min(100) as f32 / 100.0
    }
}

impl From<&QualityLevel> for Quantizer {
    fn from(level: &QualityLevel) -> Self {
        Self::new(level.precision_bits)
    }
}
