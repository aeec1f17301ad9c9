//! Minifloat formats and the float quant tensor
//!
//! A minifloat with `E` exponent bits, `M` mantissa bits and bias `b` encodes
//! normals as `(1 + m/2^M) · 2^(e - b)` and subnormals as `(m/2^M) · 2^(1 - b)`.
//! Special values live on the all-ones exponent and are identified by their
//! mantissa bit patterns (`"111"` for E4M3FN NaN).

use super::{check_broadcast, IntRepr};
use crate::{Error, Result, Tensor};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Minifloat encoding
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatFormat {
    pub exponent_bit_width: u32,
    pub mantissa_bit_width: u32,
    pub exponent_bias: i32,
    /// Clamp overflow to the largest finite value instead of inf/NaN
    #[serde(default = "default_true")]
    pub saturating: bool,
    /// Mantissa patterns of the top exponent that encode ±inf
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inf_values: Option<Vec<String>>,
    /// Mantissa patterns of the top exponent that encode NaN
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nan_values: Option<Vec<String>>,
}

impl FloatFormat {
    /// Format with the IEEE-style default bias and no special values
    pub fn new(exponent_bit_width: u32, mantissa_bit_width: u32) -> Self {
        Self {
            exponent_bit_width,
            mantissa_bit_width,
            exponent_bias: (1i32 << exponent_bit_width.saturating_sub(1)) - 1,
            saturating: true,
            inf_values: None,
            nan_values: None,
        }
    }

    /// OCP FP8 E4M3FN: bias 7, NaN at mantissa 111, no infinities, max 448
    pub fn e4m3() -> Self {
        Self {
            nan_values: Some(vec!["111".to_string()]),
            ..Self::new(4, 3)
        }
    }

    /// OCP FP8 E5M2: bias 15, IEEE-like inf/NaN, max 57344
    pub fn e5m2() -> Self {
        Self {
            inf_values: Some(vec!["00".to_string()]),
            nan_values: Some(vec!["01".to_string(), "10".to_string(), "11".to_string()]),
            ..Self::new(5, 2)
        }
    }

    pub fn with_saturating(mut self, saturating: bool) -> Self {
        self.saturating = saturating;
        self
    }

    /// Check field ranges and special-value patterns
    pub fn validate(&self) -> Result<()> {
        if self.exponent_bit_width == 0 || self.exponent_bit_width > 8 {
            return Err(Error::InvalidParameter(format!(
                "exponent bit width must be in 1..=8, got {}",
                self.exponent_bit_width
            )));
        }
        if self.mantissa_bit_width > 10 {
            return Err(Error::InvalidParameter(format!(
                "mantissa bit width must be <= 10, got {}",
                self.mantissa_bit_width
            )));
        }
        let m = self.mantissa_bit_width as usize;
        for pattern in self.patterns() {
            if pattern.len() != m || u32::from_str_radix(pattern, 2).is_err() {
                return Err(Error::InvalidParameter(format!(
                    "special value pattern {pattern:?} is not a {m}-bit mantissa"
                )));
            }
        }
        if self.max_value() <= 0.0 {
            return Err(Error::InvalidParameter(
                "format has no finite positive values".to_string(),
            ));
        }
        Ok(())
    }

    fn patterns(&self) -> impl Iterator<Item = &String> {
        self.inf_values
            .iter()
            .flatten()
            .chain(self.nan_values.iter().flatten())
    }

    fn parse(values: &Option<Vec<String>>) -> Vec<u32> {
        values
            .iter()
            .flatten()
            .filter_map(|p| u32::from_str_radix(p, 2).ok())
            .collect()
    }

    /// Total bit width including the sign bit when `signed`
    pub fn bit_width(&self, signed: bool) -> u32 {
        self.exponent_bit_width + self.mantissa_bit_width + u32::from(signed)
    }

    fn top_exponent_field(&self) -> i64 {
        (1i64 << self.exponent_bit_width) - 1
    }

    /// Smallest normal exponent (also the subnormal exponent)
    pub fn min_exponent(&self) -> i32 {
        1 - self.exponent_bias
    }

    /// Largest finite magnitude
    pub fn max_value(&self) -> f32 {
        let m_bits = self.mantissa_bit_width as i32;
        let m_levels = 1u32 << self.mantissa_bit_width;
        let mut special = Self::parse(&self.inf_values);
        special.extend(Self::parse(&self.nan_values));
        let top_exp = self.top_exponent_field() as i32 - self.exponent_bias;

        match (0..m_levels).rev().find(|m| !special.contains(m)) {
            Some(m) => (1.0 + m as f32 / 2f32.powi(m_bits)) * 2f32.powi(top_exp),
            None => (2.0 - 2f32.powi(-m_bits)) * 2f32.powi(top_exp - 1),
        }
    }

    fn overflow(&self, sign: f32) -> f32 {
        if self.saturating {
            sign * self.max_value()
        } else if self.inf_values.as_ref().is_some_and(|v| !v.is_empty()) {
            sign * f32::INFINITY
        } else {
            f32::NAN
        }
    }

    /// Round a value (already divided by scale) to the nearest representable minifloat
    pub fn round(&self, v: f32, signed: bool) -> f32 {
        if v.is_nan() {
            return v;
        }
        let v = if signed { v } else { v.max(0.0) };
        let sign = if v < 0.0 { -1.0 } else { 1.0 };
        let a = v.abs();
        if a.is_infinite() {
            return self.overflow(sign);
        }
        if a == 0.0 {
            return 0.0;
        }

        let exp = (a.log2().floor() as i32).max(self.min_exponent());
        let step = 2f32.powi(exp - self.mantissa_bit_width as i32);
        let rounded = (a / step).round_ties_even() * step;
        if rounded > self.max_value() {
            self.overflow(sign)
        } else {
            sign * rounded
        }
    }

    /// Raw bit pattern of a representable minifloat value
    pub fn encode(&self, v: f32, signed: bool) -> i64 {
        let m_bits = self.mantissa_bit_width;
        let sign_bit = i64::from(signed && v.is_sign_negative() && v != 0.0 && !v.is_nan());
        let a = v.abs();
        let top = self.top_exponent_field() << m_bits;

        let field = if v.is_nan() {
            top | Self::parse(&self.nan_values)
                .first()
                .map_or((1i64 << m_bits) - 1, |&m| i64::from(m))
        } else if a.is_infinite() {
            top | Self::parse(&self.inf_values)
                .first()
                .map_or(0, |&m| i64::from(m))
        } else if a == 0.0 {
            0
        } else {
            let exp = a.log2().floor() as i32;
            let min_exp = self.min_exponent();
            if exp < min_exp {
                (a / 2f32.powi(min_exp - m_bits as i32)).round_ties_even() as i64
            } else {
                let mantissa = ((a / 2f32.powi(exp) - 1.0) * 2f32.powi(m_bits as i32))
                    .round_ties_even() as i64;
                // A rounded-up mantissa carries into the exponent field
                (i64::from(exp + self.exponent_bias) << m_bits) + mantissa
            }
        };

        (sign_bit << (self.exponent_bit_width + m_bits)) | field
    }

    /// Value of a raw bit pattern
    pub fn decode(&self, code: i64, signed: bool) -> f32 {
        let m_bits = self.mantissa_bit_width;
        let e_mask = self.top_exponent_field();
        let negative = signed && (code >> (self.exponent_bit_width + m_bits)) & 1 == 1;
        let e_field = (code >> m_bits) & e_mask;
        let mantissa = code & ((1i64 << m_bits) - 1);
        let sign = if negative { -1.0 } else { 1.0 };

        if e_field == e_mask {
            let m = mantissa as u32;
            if Self::parse(&self.inf_values).contains(&m) {
                return sign * f32::INFINITY;
            }
            if Self::parse(&self.nan_values).contains(&m) {
                return f32::NAN;
            }
        }

        let frac = mantissa as f32 / 2f32.powi(m_bits as i32);
        let magnitude = if e_field == 0 {
            frac * 2f32.powi(self.min_exponent())
        } else {
            (1.0 + frac) * 2f32.powi(e_field as i32 - self.exponent_bias)
        };
        sign * magnitude
    }
}

/// Minifloat-quantized value with per-tensor or per-channel scale
#[derive(Clone, Debug)]
pub struct FloatQuantTensor {
    value: Tensor,
    scale: ArrayD<f32>,
    zero_point: ArrayD<f32>,
    format: FloatFormat,
    signed: bool,
    training: bool,
}

impl FloatQuantTensor {
    pub fn new(
        value: Tensor,
        scale: ArrayD<f32>,
        zero_point: ArrayD<f32>,
        format: FloatFormat,
        signed: bool,
        training: bool,
    ) -> Result<Self> {
        format.validate()?;
        check_broadcast(&scale, value.shape(), "scale")?;
        check_broadcast(&zero_point, value.shape(), "zero_point")?;
        Ok(Self {
            value,
            scale,
            zero_point,
            format,
            signed,
            training,
        })
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }

    pub fn into_value(self) -> Tensor {
        self.value
    }

    pub fn scale(&self) -> &ArrayD<f32> {
        &self.scale
    }

    pub fn zero_point(&self) -> &ArrayD<f32> {
        &self.zero_point
    }

    pub fn format(&self) -> &FloatFormat {
        &self.format
    }

    pub fn exponent_bit_width(&self) -> u32 {
        self.format.exponent_bit_width
    }

    pub fn mantissa_bit_width(&self) -> u32 {
        self.format.mantissa_bit_width
    }

    pub fn exponent_bias(&self) -> i32 {
        self.format.exponent_bias
    }

    pub fn saturating(&self) -> bool {
        self.format.saturating
    }

    pub fn inf_values(&self) -> Option<&[String]> {
        self.format.inf_values.as_deref()
    }

    pub fn nan_values(&self) -> Option<&[String]> {
        self.format.nan_values.as_deref()
    }

    pub fn bit_width(&self) -> f32 {
        self.format.bit_width(self.signed) as f32
    }

    pub fn signed(&self) -> bool {
        self.signed
    }

    pub fn training(&self) -> bool {
        self.training
    }

    /// value / scale + zero_point, in the minifloat domain
    pub fn minifloat(&self) -> ArrayD<f32> {
        self.value.data() / &self.scale + &self.zero_point
    }

    /// Raw minifloat bit patterns, or minifloat values with `float_datatype`
    pub fn int(&self, float_datatype: bool) -> IntRepr {
        minifloat_codes(self.minifloat(), &self.format, self.signed, float_datatype)
    }

    pub fn dequantize(&self, codes: &IntRepr) -> Result<ArrayD<f32>> {
        dequantize_minifloat(codes, &self.scale, &self.zero_point, &self.format, self.signed)
    }

    pub fn detach(&self) -> Self {
        Self {
            value: self.value.detach(),
            ..self.clone()
        }
    }
}

pub(crate) fn minifloat_codes(
    minifloat: ArrayD<f32>,
    format: &FloatFormat,
    signed: bool,
    float_datatype: bool,
) -> IntRepr {
    if float_datatype {
        IntRepr::Float(minifloat)
    } else {
        IntRepr::Int(minifloat.mapv(|v| format.encode(v, signed)))
    }
}

pub(crate) fn dequantize_minifloat(
    codes: &IntRepr,
    scale: &ArrayD<f32>,
    zero_point: &ArrayD<f32>,
    format: &FloatFormat,
    signed: bool,
) -> Result<ArrayD<f32>> {
    let minifloat = match codes {
        IntRepr::Int(raw) => raw.mapv(|c| format.decode(c, signed)),
        IntRepr::Float(values) => values.clone(),
    };
    check_broadcast(scale, minifloat.shape(), "scale")?;
    check_broadcast(zero_point, minifloat.shape(), "zero_point")?;
    Ok((minifloat - zero_point) * scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr0, IxDyn};
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(200))]

        /// Rounding lands on a value whose bit pattern decodes back to itself
        #[test]
        fn prop_e4m3_round_is_representable(v in -600.0f32..600.0) {
            let fmt = FloatFormat::e4m3();
            let r = fmt.round(v, true);
            prop_assert!(r.abs() <= 448.0);
            let back = fmt.decode(fmt.encode(r, true), true);
            prop_assert_eq!(back, r);
        }

        #[test]
        fn prop_round_is_idempotent(v in -50000.0f32..50000.0) {
            let fmt = FloatFormat::e5m2();
            let r = fmt.round(v, true);
            prop_assert_eq!(fmt.round(r, true), r);
        }

        /// Relative rounding error of normals is bounded by half an ulp
        #[test]
        fn prop_relative_error_bounded(v in 0.02f32..400.0) {
            let fmt = FloatFormat::e4m3();
            let r = fmt.round(v, true);
            prop_assert!((r - v).abs() / v <= 2f32.powi(-4) + 1e-6);
        }
    }

    #[test]
    fn test_max_values() {
        assert_abs_diff_eq!(FloatFormat::e4m3().max_value(), 448.0);
        assert_abs_diff_eq!(FloatFormat::e5m2().max_value(), 57344.0);
        // No special values: top exponent fully usable
        assert_abs_diff_eq!(FloatFormat::new(4, 3).max_value(), 480.0);
    }

    #[test]
    fn test_bit_width() {
        assert_eq!(FloatFormat::e4m3().bit_width(true), 8);
        assert_eq!(FloatFormat::e4m3().bit_width(false), 7);
    }

    #[test]
    fn test_encode_known_patterns() {
        let fmt = FloatFormat::e4m3();
        assert_eq!(fmt.encode(1.0, true), 0b0_0111_000);
        assert_eq!(fmt.encode(-2.0, true), 0b1_1000_000);
        assert_eq!(fmt.encode(448.0, true), 0b0_1111_110);
        // Smallest subnormal 2^-9
        assert_eq!(fmt.encode(2f32.powi(-9), true), 0b0_0000_001);
        assert_eq!(fmt.encode(f32::NAN, true), 0b0_1111_111);
    }

    #[test]
    fn test_decode_specials() {
        let fmt = FloatFormat::e5m2();
        assert!(fmt.decode(0b0_11111_00, true).is_infinite());
        assert!(fmt.decode(0b1_11111_01, true).is_nan());
        assert_abs_diff_eq!(fmt.decode(0b0_11110_11, true), 57344.0);
    }

    #[test]
    fn test_saturation_policy() {
        let sat = FloatFormat::e4m3();
        assert_abs_diff_eq!(sat.round(1000.0, true), 448.0);
        assert_abs_diff_eq!(sat.round(-1000.0, true), -448.0);

        let non_sat = FloatFormat::e4m3().with_saturating(false);
        assert!(non_sat.round(1000.0, true).is_nan());

        let ieee = FloatFormat::e5m2().with_saturating(false);
        assert_eq!(ieee.round(1e6, true), f32::INFINITY);
    }

    #[test]
    fn test_unsigned_clamps_negative() {
        let fmt = FloatFormat::e4m3();
        assert_abs_diff_eq!(fmt.round(-3.0, false), 0.0);
    }

    #[test]
    fn test_validate_rejects_bad_pattern() {
        let mut fmt = FloatFormat::e4m3();
        fmt.nan_values = Some(vec!["11".to_string()]);
        assert!(fmt.validate().is_err());
        assert!(FloatFormat::e5m2().validate().is_ok());
    }

    #[test]
    fn test_float_quant_tensor_codes_round_trip() {
        let fmt = FloatFormat::e4m3();
        let scale = 0.5f32;
        let minifloat: Vec<f32> = vec![1.0, -2.5, 448.0, 0.0];
        let value: Vec<f32> = minifloat.iter().map(|v| v * scale).collect();
        let qt = FloatQuantTensor::new(
            Tensor::from_vec(value.clone(), false),
            arr0(scale).into_dyn(),
            ArrayD::zeros(IxDyn(&[])),
            fmt,
            true,
            false,
        )
        .unwrap();

        assert_eq!(qt.bit_width(), 8.0);
        let raw = qt.int(false);
        let deq = qt.dequantize(&raw).unwrap();
        for (d, v) in deq.iter().zip(value.iter()) {
            assert_abs_diff_eq!(*d, *v, epsilon = 1e-6);
        }
        let mf = qt.int(true).to_f32();
        assert_abs_diff_eq!(mf[[1]], -2.5);
    }
}
