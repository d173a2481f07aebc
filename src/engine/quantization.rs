//! Quantization parameters and fixed-point requantization.
//!
//! A quantized value `q` represents the real value `scale * (q - zero_point)`.
//! A deconvolution accumulates `(a - input_zp) * (w - kernel_zp)` products in
//! i32 and converts the sum back to u8 with the combined scale
//! `input_scale * kernel_scale / output_scale`, expressed as a Q31 multiplier
//! and a power-of-two shift so the micro-kernel never touches floating point.

use tracing::error;

use super::error::DeconvError;

/// Combined scales at or above this bound are rejected; the multiplier
/// decomposition needs a non-negative shift.
pub const MAX_REQUANTIZATION_SCALE: f32 = 2_147_483_648.0; // 2^31

/// Scale and zero point of one u8 tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantizationParams {
    pub scale: f32,
    pub zero_point: u8,
}

impl QuantizationParams {
    pub fn new(scale: f32, zero_point: u8) -> Self {
        Self { scale, zero_point }
    }
}

/// Reject a scale unless it is a positive normal float.
///
/// Zero, negative, infinite, NaN and subnormal values are all invalid.
pub fn validate_scale(what: &str, scale: f32) -> Result<(), DeconvError> {
    if scale <= 0.0 || !scale.is_normal() {
        error!(
            "failed to create deconvolution with {scale} {what} scale: \
             scale must be finite and positive"
        );
        return Err(DeconvError::InvalidParameter(format!(
            "{what} scale {scale} must be finite and positive"
        )));
    }
    Ok(())
}

/// Combined requantization scale `input_scale * kernel_scale / output_scale`.
///
/// Every operand is validated first; the product must itself be a positive
/// normal float below [`MAX_REQUANTIZATION_SCALE`].
pub fn requantization_scale(
    input_scale: f32,
    kernel_scale: f32,
    output_scale: f32,
) -> Result<f32, DeconvError> {
    validate_scale("input", input_scale)?;
    validate_scale("kernel", kernel_scale)?;
    validate_scale("output", output_scale)?;

    let scale = input_scale * kernel_scale / output_scale;
    if scale <= 0.0 || !scale.is_normal() || scale >= MAX_REQUANTIZATION_SCALE {
        error!(
            "failed to create deconvolution with {scale} requantization scale: \
             scale must be a normal float in (0, 2^31)"
        );
        return Err(DeconvError::InvalidParameter(format!(
            "requantization scale {scale} must be a normal float in (0, 2^31)"
        )));
    }
    Ok(scale)
}

/// Fixed-point requantization of i32 accumulators to u8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requantization {
    /// Q31 multiplier in `[2^30, 2^31)`, or 0 when the scale underflows.
    pub multiplier: i32,
    /// Right shift applied to `acc * multiplier`.
    pub shift: u32,
    /// Half of `2^shift`, added before shifting.
    pub rounding: i64,
    pub zero_point: i32,
    pub min: u8,
    pub max: u8,
}

impl Requantization {
    /// Decompose `scale` into `multiplier / 2^shift`.
    ///
    /// The f32 mantissa (with its implicit bit) is exactly the Q31 multiplier
    /// once shifted into bits 30..7, so the decomposition is lossless.
    pub fn from_scale(scale: f32, zero_point: u8, min: u8, max: u8) -> Self {
        debug_assert!(scale.is_normal() && scale > 0.0 && scale < MAX_REQUANTIZATION_SCALE);

        let bits = scale.to_bits();
        let exponent = ((bits >> 23) & 0xFF) as i32 - 127;
        let mantissa = ((bits & 0x007F_FFFF) | 0x0080_0000) as i32;
        let shift = 30 - exponent;

        // |acc * multiplier| < 2^62, so shifting by 63 or more always rounds to 0.
        let (multiplier, shift) = if shift > 62 { (0, 0) } else { (mantissa << 7, shift as u32) };
        let rounding = if shift == 0 { 0 } else { 1i64 << (shift - 1) };

        Self {
            multiplier,
            shift,
            rounding,
            zero_point: zero_point as i32,
            min,
            max,
        }
    }

    /// Convert one accumulator to its clamped u8 output.
    ///
    /// Rounds half away from zero.
    #[inline]
    pub fn requantize(&self, acc: i32) -> u8 {
        let product = acc as i64 * self.multiplier as i64;
        let magnitude = (product.abs() + self.rounding) >> self.shift;
        let scaled = if product < 0 { -magnitude } else { magnitude };
        (scaled + self.zero_point as i64).clamp(self.min as i64, self.max as i64) as u8
    }
}

/// Everything the micro-kernel needs to turn u8 inputs into u8 outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvQuantizationParams {
    pub input_zero_point: u8,
    pub kernel_zero_point: u8,
    pub requantization: Requantization,
}

impl ConvQuantizationParams {
    pub fn new(
        input_zero_point: u8,
        kernel_zero_point: u8,
        scale: f32,
        output_zero_point: u8,
        output_min: u8,
        output_max: u8,
    ) -> Self {
        Self {
            input_zero_point,
            kernel_zero_point,
            requantization: Requantization::from_scale(
                scale,
                output_zero_point,
                output_min,
                output_max,
            ),
        }
    }
}
