//! Affine integer quant tensor

use super::{check_broadcast, IntRepr};
use crate::{Error, Result, Tensor};
use ndarray::ArrayD;

/// Dequantized value plus the affine metadata that produced it
///
/// `value == (int(value) - zero_point) * scale` holds by construction: every
/// strategy emits `value` from integer codes it clamped to `[min_int, max_int]`.
#[derive(Clone, Debug)]
pub struct QuantTensor {
    value: Tensor,
    scale: ArrayD<f32>,
    zero_point: ArrayD<f32>,
    bit_width: f32,
    signed: bool,
    narrow_range: bool,
    training: bool,
    shared_bit_width: Option<f32>,
}

impl QuantTensor {
    /// Create a quant tensor
    ///
    /// # Arguments
    /// * `value` - Dequantized values
    /// * `scale`, `zero_point` - Broadcastable to `value` (scalar, per-channel `[C, 1, ..]`)
    /// * `bit_width` - Positive bit-width of the integer codes
    pub fn new(
        value: Tensor,
        scale: ArrayD<f32>,
        zero_point: ArrayD<f32>,
        bit_width: f32,
        signed: bool,
        narrow_range: bool,
        training: bool,
    ) -> Result<Self> {
        check_broadcast(&scale, value.shape(), "scale")?;
        check_broadcast(&zero_point, value.shape(), "zero_point")?;
        if !(bit_width >= 1.0) {
            return Err(Error::InvalidParameter(format!(
                "bit width must be >= 1, got {bit_width}"
            )));
        }
        if scale.iter().any(|&s| !(s > 0.0) || !s.is_finite()) {
            return Err(Error::InvalidParameter(
                "scale must be positive and finite".to_string(),
            ));
        }

        Ok(Self {
            value,
            scale,
            zero_point,
            bit_width,
            signed,
            narrow_range,
            training,
            shared_bit_width: None,
        })
    }

    /// Record the shared bit-width this tensor was quantized with
    pub fn with_shared_bit_width(mut self, shared_bit_width: Option<f32>) -> Self {
        self.shared_bit_width = shared_bit_width;
        self
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

    pub fn bit_width(&self) -> f32 {
        self.bit_width
    }

    pub fn signed(&self) -> bool {
        self.signed
    }

    pub fn narrow_range(&self) -> bool {
        self.narrow_range
    }

    pub fn training(&self) -> bool {
        self.training
    }

    pub fn shared_bit_width(&self) -> Option<f32> {
        self.shared_bit_width
    }

    /// Smallest representable code
    pub fn min_int(&self) -> f64 {
        min_int(self.bit_width, self.signed, self.narrow_range)
    }

    /// Largest representable code
    pub fn max_int(&self) -> f64 {
        max_int(self.bit_width, self.signed, self.narrow_range)
    }

    /// Integer codes: round(value / scale + zero_point)
    ///
    /// With `float_datatype` the codes are returned as `f32` for consumers
    /// that need a float dtype.
    pub fn int(&self, float_datatype: bool) -> IntRepr {
        let codes =
            (self.value.data() / &self.scale + &self.zero_point).mapv(f32::round_ties_even);
        if float_datatype {
            IntRepr::Float(codes)
        } else {
            IntRepr::Int(codes.mapv(|c| c as i64))
        }
    }

    /// Map codes back to the real domain with this tensor's scale and zero-point
    pub fn dequantize(&self, codes: &IntRepr) -> Result<ArrayD<f32>> {
        dequantize(codes, &self.scale, &self.zero_point)
    }

    /// Codes are in range and reproduce `value`
    pub fn is_valid(&self) -> bool {
        let codes = self.int(true).to_f32();
        let (lo, hi) = (self.min_int() as f32, self.max_int() as f32);
        if codes.iter().any(|&c| c < lo || c > hi) {
            return false;
        }
        match self.dequantize(&IntRepr::Float(codes)) {
            Ok(deq) => deq
                .iter()
                .zip(self.value.data().iter())
                .all(|(&d, &v)| (d - v).abs() <= 1e-4 * v.abs().max(1.0)),
            Err(_) => false,
        }
    }

    /// Drop autograd history (for caching)
    pub fn detach(&self) -> Self {
        Self {
            value: self.value.detach(),
            ..self.clone()
        }
    }
}

/// (codes - zero_point) * scale
pub fn dequantize(
    codes: &IntRepr,
    scale: &ArrayD<f32>,
    zero_point: &ArrayD<f32>,
) -> Result<ArrayD<f32>> {
    let codes = codes.to_f32();
    check_broadcast(scale, codes.shape(), "scale")?;
    check_broadcast(zero_point, codes.shape(), "zero_point")?;
    Ok((codes - zero_point) * scale)
}

pub(crate) fn min_int(bit_width: f32, signed: bool, narrow_range: bool) -> f64 {
    if signed {
        let base = -(2f64.powf(bit_width as f64 - 1.0));
        if narrow_range {
            base + 1.0
        } else {
            base
        }
    } else {
        0.0
    }
}

pub(crate) fn max_int(bit_width: f32, signed: bool, narrow_range: bool) -> f64 {
    if signed {
        2f64.powf(bit_width as f64 - 1.0) - 1.0
    } else if narrow_range {
        2f64.powf(bit_width as f64) - 2.0
    } else {
        2f64.powf(bit_width as f64) - 1.0
    }
}
