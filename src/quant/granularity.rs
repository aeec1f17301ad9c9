//! Per-tensor, per-channel and per-group statistics
//!
//! Provides the reductions quantizers derive scales and zero-points from:
//! - **Per-tensor**: one value for the entire tensor
//! - **Per-channel**: one value per index of `axis`, other axes reduced
//! - **Per-group**: one value per `size` consecutive elements along `dim`
//!
//! Reduced arrays keep the input's rank (reduced axes have extent 1, grouped
//! axes shrink to the group count), except per-tensor which is a scalar.

use crate::quant_tensor::grouped_shape;
use crate::{Error, Result};
use ndarray::{arr0, concatenate, ArrayD, ArrayViewD, Axis, IxDyn, Slice};
use serde::{Deserialize, Serialize};

/// Quantization granularity options
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuantGranularity {
    /// Single scale/zero-point for entire tensor
    #[default]
    PerTensor,
    /// Separate scale/zero-point per index of `axis`
    PerChannel { axis: usize },
    /// Separate scale/zero-point per group of `size` elements along `dim`
    PerGroup { size: usize, dim: usize },
}

/// Statistic reduced over each granule
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StatsOp {
    #[default]
    MaxAbs,
    Min,
    Max,
    /// L1 norm
    AbsSum,
}

impl StatsOp {
    fn fold(self, values: ArrayViewD<'_, f32>) -> f32 {
        let v = match self {
            StatsOp::MaxAbs => values.fold(0.0f32, |m, &v| m.max(v.abs())),
            StatsOp::Min => values.fold(f32::INFINITY, |m, &v| m.min(v)),
            StatsOp::Max => values.fold(f32::NEG_INFINITY, |m, &v| m.max(v)),
            StatsOp::AbsSum => values.fold(0.0f32, |s, &v| s + v.abs()),
        };
        if v.is_finite() {
            v
        } else {
            0.0
        }
    }
}

impl QuantGranularity {
    /// Shape of metadata reduced from a tensor of `shape`
    pub fn reduced_shape(&self, shape: &[usize]) -> Result<Vec<usize>> {
        match *self {
            QuantGranularity::PerTensor => Ok(Vec::new()),
            QuantGranularity::PerChannel { axis } => {
                check_axis(axis, shape.len())?;
                let mut reduced = vec![1; shape.len()];
                reduced[axis] = shape[axis];
                Ok(reduced)
            }
            QuantGranularity::PerGroup { size, dim } => grouped_shape(shape, size, dim),
        }
    }
}

fn check_axis(axis: usize, ndim: usize) -> Result<()> {
    if axis >= ndim {
        return Err(Error::InvalidParameter(format!(
            "channel axis {axis} out of range for rank {ndim}"
        )));
    }
    Ok(())
}

/// Reduce `x` to one statistic per granule
pub fn reduce(x: &ArrayD<f32>, granularity: QuantGranularity, op: StatsOp) -> Result<ArrayD<f32>> {
    match granularity {
        QuantGranularity::PerTensor => Ok(arr0(op.fold(x.view())).into_dyn()),
        QuantGranularity::PerChannel { axis } => {
            check_axis(axis, x.ndim())?;
            let values: Vec<f32> = x
                .axis_iter(Axis(axis))
                .map(|channel| op.fold(channel))
                .collect();
            let shape = granularity.reduced_shape(x.shape())?;
            ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|_| Error::ShapeMismatch {
                expected: shape.clone(),
                got: x.shape().to_vec(),
            })
        }
        QuantGranularity::PerGroup { size, dim } => {
            let compact = grouped_shape(x.shape(), size, dim)?;
            let parts: Vec<ArrayD<f32>> = (0..compact[dim])
                .map(|g| {
                    x.slice_axis(Axis(dim), Slice::from(g * size..(g + 1) * size))
                        .map_axis(Axis(dim), |lane| op.fold(lane.into_dyn()))
                        .insert_axis(Axis(dim))
                })
                .collect();
            let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
            concatenate(Axis(dim), &views).map_err(|e| Error::InvalidParameter(e.to_string()))
        }
    }
}
