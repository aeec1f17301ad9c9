//! Scale, zero-point and bit-width submodules
//!
//! Strategies are assembled from these three pieces. Scaling and zero-point
//! come in a runtime-statistics flavour (recomputed from every tensor they
//! see) and a parameter flavour (initialised once from statistics in
//! `init_tensor_quant`, then held). Only the parameter flavours are
//! sliceable: runtime statistics already describe whatever region they are
//! handed.

use super::granularity::{reduce, QuantGranularity, StatsOp};
use super::module::{QuantModule, SubtensorSliceable};
use crate::autograd::{slice_info, SubtensorSlice};
use crate::{Error, Result};
use ndarray::{arr0, ArrayD};
use serde::{Deserialize, Serialize};

/// Smallest scale a quantizer will emit
pub const MIN_SCALE: f32 = 1e-10;

/// Statistic a scale is derived from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScalingStats {
    /// Symmetric range: max |x|
    #[default]
    MaxAbs,
    /// Affine range: max(x, 0) - min(x, 0)
    MinMax,
}

#[derive(Clone, Debug)]
enum ScalingState {
    Stats,
    Parameter(Option<ArrayD<f32>>),
    Const(f32),
}

/// Produces the scale of a quantizer
///
/// The statistic is a threshold (the real value mapped to the largest code);
/// the caller supplies the code range it is divided by, so the same threshold
/// serves any bit-width.
#[derive(Clone, Debug)]
pub struct ScalingImpl {
    stats: ScalingStats,
    granularity: QuantGranularity,
    state: ScalingState,
    slice: Option<Vec<SubtensorSlice>>,
}

impl ScalingImpl {
    /// Recomputed from every tensor
    pub fn stats(stats: ScalingStats, granularity: QuantGranularity) -> Self {
        Self {
            stats,
            granularity,
            state: ScalingState::Stats,
            slice: None,
        }
    }

    /// Held threshold initialised from the registered tensor
    pub fn parameter(stats: ScalingStats, granularity: QuantGranularity) -> Self {
        Self {
            state: ScalingState::Parameter(None),
            ..Self::stats(stats, granularity)
        }
    }

    /// Fixed per-tensor scale
    pub fn constant(scale: f32) -> Self {
        Self {
            state: ScalingState::Const(scale),
            ..Self::stats(ScalingStats::MaxAbs, QuantGranularity::PerTensor)
        }
    }

    pub fn granularity(&self) -> QuantGranularity {
        self.granularity
    }

    pub fn stats_kind(&self) -> ScalingStats {
        self.stats
    }

    pub fn is_parameter(&self) -> bool {
        matches!(self.state, ScalingState::Parameter(_))
    }

    /// Current threshold parameter, if initialised
    pub fn parameter_value(&self) -> Option<&ArrayD<f32>> {
        match &self.state {
            ScalingState::Parameter(value) => value.as_ref(),
            _ => None,
        }
    }

    /// Overwrite the threshold parameter (e.g. after an external update)
    pub fn set_parameter_value(&mut self, value: ArrayD<f32>) -> Result<()> {
        match &mut self.state {
            ScalingState::Parameter(current) => {
                if let Some(old) = current.as_ref() {
                    if old.shape() != value.shape() {
                        return Err(Error::ShapeMismatch {
                            expected: old.shape().to_vec(),
                            got: value.shape().to_vec(),
                        });
                    }
                }
                *current = Some(value);
                Ok(())
            }
            _ => Err(Error::InvalidParameter(
                "scaling has no learnable parameter".to_string(),
            )),
        }
    }

    fn threshold(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        match self.stats {
            ScalingStats::MaxAbs => reduce(x, self.granularity, StatsOp::MaxAbs),
            ScalingStats::MinMax => {
                let max = reduce(x, self.granularity, StatsOp::Max)?.mapv(|v| v.max(0.0));
                let min = reduce(x, self.granularity, StatsOp::Min)?.mapv(|v| v.min(0.0));
                Ok(max - min)
            }
        }
    }

    /// Initialise parameter state from the registered tensor
    pub fn init_from(&mut self, x: &ArrayD<f32>) -> Result<()> {
        if self.is_parameter() {
            let threshold = self.threshold(x)?;
            self.state = ScalingState::Parameter(Some(threshold));
        }
        Ok(())
    }

    /// Scale for `x`, given the code range the threshold maps onto
    pub fn scale(&self, x: &ArrayD<f32>, divisor: f32) -> Result<ArrayD<f32>> {
        let threshold = match &self.state {
            ScalingState::Const(scale) => return Ok(arr0(scale.max(MIN_SCALE)).into_dyn()),
            ScalingState::Stats => self.threshold(x)?,
            ScalingState::Parameter(None) => {
                return Err(Error::MissingParameter(
                    "scaling parameter used before init_tensor_quant".to_string(),
                ))
            }
            ScalingState::Parameter(Some(value)) => match &self.slice {
                Some(slices) => slice_param(value, self.granularity, slices)?,
                None => value.clone(),
            },
        };
        if !(divisor > 0.0) {
            return Err(Error::InvalidParameter(format!(
                "scale divisor must be positive, got {divisor}"
            )));
        }
        Ok(threshold.mapv(|t| (t / divisor).max(MIN_SCALE)))
    }
}

impl QuantModule for ScalingImpl {
    fn name(&self) -> &str {
        "scaling_impl"
    }

    fn as_sliceable(&mut self) -> Option<&mut dyn SubtensorSliceable> {
        if self.is_parameter() {
            Some(self)
        } else {
            None
        }
    }
}

impl SubtensorSliceable for ScalingImpl {
    fn set_subtensor_slice(&mut self, slice: Option<Vec<SubtensorSlice>>) {
        self.slice = slice;
    }

    fn subtensor_slice(&self) -> Option<&[SubtensorSlice]> {
        self.slice.as_deref()
    }
}

#[derive(Clone, Debug)]
enum ZeroPointState {
    Zero,
    Stats,
    Parameter(Option<ArrayD<f32>>),
}

/// Produces the zero-point of a quantizer
///
/// Non-zero variants place `min(x, 0)` on the lowest code:
/// `zp = clamp(round(min_int - min / scale), min_int, max_int)`.
#[derive(Clone, Debug)]
pub struct ZeroPointImpl {
    granularity: QuantGranularity,
    state: ZeroPointState,
    slice: Option<Vec<SubtensorSlice>>,
}

impl Default for ZeroPointImpl {
    fn default() -> Self {
        Self::zero()
    }
}

impl ZeroPointImpl {
    pub fn zero() -> Self {
        Self {
            granularity: QuantGranularity::PerTensor,
            state: ZeroPointState::Zero,
            slice: None,
        }
    }

    pub fn stats(granularity: QuantGranularity) -> Self {
        Self {
            granularity,
            state: ZeroPointState::Stats,
            slice: None,
        }
    }

    pub fn parameter(granularity: QuantGranularity) -> Self {
        Self {
            granularity,
            state: ZeroPointState::Parameter(None),
            slice: None,
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self.state, ZeroPointState::Zero)
    }

    pub fn granularity(&self) -> QuantGranularity {
        self.granularity
    }

    fn negative_min(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        Ok(reduce(x, self.granularity, StatsOp::Min)?.mapv(|v| v.min(0.0)))
    }

    pub fn init_from(&mut self, x: &ArrayD<f32>) -> Result<()> {
        if matches!(self.state, ZeroPointState::Parameter(_)) {
            let min = self.negative_min(x)?;
            self.state = ZeroPointState::Parameter(Some(min));
        }
        Ok(())
    }

    pub fn zero_point(
        &self,
        x: &ArrayD<f32>,
        scale: &ArrayD<f32>,
        min_int: f32,
        max_int: f32,
    ) -> Result<ArrayD<f32>> {
        let min = match &self.state {
            ZeroPointState::Zero => return Ok(arr0(0.0f32).into_dyn()),
            ZeroPointState::Stats => self.negative_min(x)?,
            ZeroPointState::Parameter(None) => {
                return Err(Error::MissingParameter(
                    "zero-point parameter used before init_tensor_quant".to_string(),
                ))
            }
            ZeroPointState::Parameter(Some(value)) => match &self.slice {
                Some(slices) => slice_param(value, self.granularity, slices)?,
                None => value.clone(),
            },
        };
        Ok((&min / scale).mapv(|r| (min_int - r).round_ties_even().clamp(min_int, max_int)))
    }
}

impl QuantModule for ZeroPointImpl {
    fn name(&self) -> &str {
        "zero_point_impl"
    }

    fn as_sliceable(&mut self) -> Option<&mut dyn SubtensorSliceable> {
        if matches!(self.state, ZeroPointState::Parameter(_)) {
            Some(self)
        } else {
            None
        }
    }
}

impl SubtensorSliceable for ZeroPointImpl {
    fn set_subtensor_slice(&mut self, slice: Option<Vec<SubtensorSlice>>) {
        self.slice = slice;
    }

    fn subtensor_slice(&self) -> Option<&[SubtensorSlice]> {
        self.slice.as_deref()
    }
}

/// Produces the bit-width of a quantizer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitWidthImpl {
    Const(u32),
    /// Follows a bit-width coordinated across layers when one is supplied
    Shared { default: u32 },
}

impl BitWidthImpl {
    pub fn bit_width(&self, shared: Option<f32>) -> f32 {
        match *self {
            BitWidthImpl::Const(bits) => bits as f32,
            BitWidthImpl::Shared { default } => match shared {
                Some(bits) if bits > 0.0 => bits,
                _ => default as f32,
            },
        }
    }

    pub fn nominal(&self) -> f32 {
        self.bit_width(None)
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, BitWidthImpl::Shared { .. })
    }
}

impl QuantModule for BitWidthImpl {
    fn name(&self) -> &str {
        "bit_width_impl"
    }
}

/// Restrict a reduced parameter to the region selected on the full tensor
///
/// Axes the parameter broadcasts along (extent 1) are left whole; a grouped
/// axis is sliced in group units and the range must be group-aligned.
pub(crate) fn slice_param(
    param: &ArrayD<f32>,
    granularity: QuantGranularity,
    slices: &[SubtensorSlice],
) -> Result<ArrayD<f32>> {
    if param.ndim() == 0 {
        return Ok(param.clone());
    }
    if slices.len() > param.ndim() {
        return Err(Error::InvalidSlice(format!(
            "{} slices given for a parameter of rank {}",
            slices.len(),
            param.ndim()
        )));
    }

    let mut param_slices = Vec::with_capacity(slices.len());
    for (axis, slice) in slices.iter().enumerate() {
        let mapped = match *slice {
            None => None,
            Some(_) if param.shape()[axis] == 1 => None,
            Some((start, stop)) => match granularity {
                QuantGranularity::PerGroup { size, dim } if dim == axis => {
                    if start % size != 0 || stop % size != 0 {
                        return Err(Error::InvalidSlice(format!(
                            "range {start}..{stop} on dim {axis} is not aligned to group size {size}"
                        )));
                    }
                    Some((start / size, stop / size))
                }
                _ => Some((start, stop)),
            },
        };
        param_slices.push(mapped);
    }

    let info = slice_info(param.shape(), &param_slices)?;
    Ok(param.slice(info.as_slice()).to_owned())
}
