//! Groupwise minifloat quant tensor
//!
//! Scale and zero-point are shared by `group_size` consecutive elements along
//! `group_dim`. They are stored compact: same rank as `value`, with the
//! grouped axis shrunk to the number of groups. The grouped axis must be an
//! exact multiple of the group size; ragged tails are rejected.

use super::float::{dequantize_minifloat, minifloat_codes};
use super::{check_broadcast, FloatFormat, IntRepr};
use crate::{Error, Result, Tensor};
use ndarray::{ArrayD, Dimension, IxDyn};

#[derive(Clone, Debug)]
pub struct GroupwiseFloatQuantTensor {
    value: Tensor,
    scale: ArrayD<f32>,
    zero_point: ArrayD<f32>,
    group_size: usize,
    group_dim: usize,
    format: FloatFormat,
    signed: bool,
    training: bool,
}

/// Shape of per-group metadata for a value of `shape`
pub fn grouped_shape(shape: &[usize], group_size: usize, group_dim: usize) -> Result<Vec<usize>> {
    if group_dim >= shape.len() {
        return Err(Error::InvalidParameter(format!(
            "group_dim {group_dim} out of range for rank {}",
            shape.len()
        )));
    }
    if group_size == 0 {
        return Err(Error::InvalidParameter("group_size must be positive".to_string()));
    }
    let extent = shape[group_dim];
    if extent % group_size != 0 {
        return Err(Error::InvalidParameter(format!(
            "dim {group_dim} of extent {extent} is not a multiple of group_size {group_size}"
        )));
    }
    let mut compact = shape.to_vec();
    compact[group_dim] = extent / group_size;
    Ok(compact)
}

/// Repeat compact per-group metadata back to the full shape
pub fn expand_groups(
    compact: &ArrayD<f32>,
    shape: &[usize],
    group_size: usize,
    group_dim: usize,
) -> Result<ArrayD<f32>> {
    let expected = grouped_shape(shape, group_size, group_dim)?;
    let compact = compact
        .broadcast(IxDyn(&expected))
        .ok_or_else(|| Error::ShapeMismatch {
            expected: expected.clone(),
            got: compact.shape().to_vec(),
        })?;
    Ok(ArrayD::from_shape_fn(IxDyn(shape), |mut idx| {
        idx[group_dim] /= group_size;
        compact[idx.slice()]
    }))
}

impl GroupwiseFloatQuantTensor {
    /// Create a groupwise float quant tensor
    ///
    /// `scale` must have the compact grouped shape; `zero_point` must broadcast to it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        value: Tensor,
        scale: ArrayD<f32>,
        zero_point: ArrayD<f32>,
        group_size: usize,
        group_dim: usize,
        format: FloatFormat,
        signed: bool,
        training: bool,
    ) -> Result<Self> {
        format.validate()?;
        let compact = grouped_shape(value.shape(), group_size, group_dim)?;
        if scale.shape() != compact.as_slice() {
            return Err(Error::ShapeMismatch {
                expected: compact,
                got: scale.shape().to_vec(),
            });
        }
        check_broadcast(&zero_point, &compact, "zero_point")?;

        Ok(Self {
            value,
            scale,
            zero_point,
            group_size,
            group_dim,
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

    /// Compact per-group scale
    pub fn scale(&self) -> &ArrayD<f32> {
        &self.scale
    }

    pub fn zero_point(&self) -> &ArrayD<f32> {
        &self.zero_point
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn group_dim(&self) -> usize {
        self.group_dim
    }

    pub fn num_groups(&self) -> usize {
        self.value.shape()[self.group_dim] / self.group_size
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

    /// Scale repeated to the shape of `value`
    pub fn expanded_scale(&self) -> Result<ArrayD<f32>> {
        expand_groups(&self.scale, self.value.shape(), self.group_size, self.group_dim)
    }

    pub fn expanded_zero_point(&self) -> Result<ArrayD<f32>> {
        expand_groups(&self.zero_point, self.value.shape(), self.group_size, self.group_dim)
    }

    pub fn minifloat(&self) -> Result<ArrayD<f32>> {
        Ok(self.value.data() / &self.expanded_scale()? + &self.expanded_zero_point()?)
    }

    /// Raw minifloat bit patterns, or minifloat values with `float_datatype`
    pub fn int(&self, float_datatype: bool) -> Result<IntRepr> {
        Ok(minifloat_codes(
            self.minifloat()?,
            &self.format,
            self.signed,
            float_datatype,
        ))
    }

    pub fn dequantize(&self, codes: &IntRepr) -> Result<ArrayD<f32>> {
        dequantize_minifloat(
            codes,
            &self.expanded_scale()?,
            &self.expanded_zero_point()?,
            &self.format,
            self.signed,
        )
    }

    pub fn detach(&self) -> Self {
        Self {
            value: self.value.detach(),
            ..self.clone()
        }
    }
}
