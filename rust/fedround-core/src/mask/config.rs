//! Masking configuration.
//!
//! See the [mask module] documentation since this is a private module anyways.
//!
//! [mask module]: crate::mask

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
/// Errors related to invalid masking configurations.
pub enum MaskConfigError {
    #[error("the clipping range must be positive and finite, got {0}")]
    ClippingRange(f64),

    #[error("the number of fixed point bits must be between 1 and {max}, got {actual}")]
    FixedPointBits { max: u8, actual: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// A masking configuration.
pub struct MaskConfig {
    /// The absolute bound enforced on every value before masking.
    pub clipping_range: f64,
    /// The number of fractional bits of the fixed point representation.
    pub fixed_point_bits: u8,
}

impl Default for MaskConfig {
    fn default() -> Self {
        Self {
            clipping_range: 3.0,
            fixed_point_bits: 20,
        }
    }
}

impl MaskConfig {
    /// The largest supported number of fractional bits.
    pub const MAX_FIXED_POINT_BITS: u8 = 40;

    /// Checks the configuration.
    pub fn validate(&self) -> Result<(), MaskConfigError> {
        if !(self.clipping_range.is_finite() && self.clipping_range > 0.0) {
            return Err(MaskConfigError::ClippingRange(self.clipping_range));
        }
        if self.fixed_point_bits == 0 || self.fixed_point_bits > Self::MAX_FIXED_POINT_BITS {
            return Err(MaskConfigError::FixedPointBits {
                max: Self::MAX_FIXED_POINT_BITS,
                actual: self.fixed_point_bits,
            });
        }
        Ok(())
    }

    fn scale(&self) -> f64 {
        (1_u64 << self.fixed_point_bits) as f64
    }

    /// The largest absolute value an unscaled element may take, i.e. the
    /// clipping range or the verification element bound of 1.
    fn element_bound(&self) -> f64 {
        self.clipping_range.max(1.0)
    }

    /// Gets the largest total weight for which an aggregated sum cannot overflow.
    pub fn max_total_weight(&self) -> u64 {
        let bound = (self.element_bound() * self.scale()).ceil() as u128;
        // the sum must stay a valid two's complement value
        (i64::MAX as u128 / bound.max(1)) as u64
    }

    /// Encodes `weight * clamp(value)` in fixed point, as an element of the group.
    pub fn encode(&self, weight: u64, value: f64) -> u64 {
        let clamped = if value.is_nan() {
            0.0
        } else {
            value.max(-self.clipping_range).min(self.clipping_range)
        };
        self.encode_unclipped(weight, clamped)
    }

    /// Encodes `weight * value` without clipping.
    pub(crate) fn encode_unclipped(&self, weight: u64, value: f64) -> u64 {
        // float to int casts saturate, the two's complement cast wraps
        ((weight as f64 * value * self.scale()).round() as i64) as u64
    }

    /// Decodes an aggregated group element back into a (weighted) value.
    pub fn decode(&self, element: u64) -> f64 {
        (element as i64) as f64 / self.scale()
    }

    /// Gets the resolution of the fixed point representation.
    pub fn resolution(&self) -> f64 {
        1.0 / self.scale()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(MaskConfig::default().validate().is_ok());
        assert!(MaskConfig {
            clipping_range: 0.0,
            ..MaskConfig::default()
        }
        .validate()
        .is_err());
        assert!(MaskConfig {
            clipping_range: f64::INFINITY,
            ..MaskConfig::default()
        }
        .validate()
        .is_err());
        assert_eq!(
            MaskConfig {
                fixed_point_bits: 41,
                ..MaskConfig::default()
            }
            .validate(),
            Err(MaskConfigError::FixedPointBits {
                max: 40,
                actual: 41
            })
        );
    }

    #[test]
    fn test_encode_decode() {
        let config = MaskConfig::default();
        assert_eq!(config.decode(config.encode(1, 0.5)), 0.5);
        assert_eq!(config.decode(config.encode(4, -0.25)), -1.0);
        // clipped to the range
        assert_eq!(config.decode(config.encode(1, 10.0)), 3.0);
        assert_eq!(config.decode(config.encode(2, -10.0)), -6.0);
    }

    #[test]
    fn test_negative_values_wrap() {
        let config = MaskConfig::default();
        let sum = config.encode(1, -1.0).wrapping_add(config.encode(1, 0.25));
        assert_eq!(config.decode(sum), -0.75);
    }

    #[test]
    fn test_max_total_weight() {
        let config = MaskConfig {
            clipping_range: 1.0,
            fixed_point_bits: 40,
        };
        assert_eq!(config.max_total_weight(), (1 << 23) - 1);
    }
}
