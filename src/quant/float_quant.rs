//! Minifloat (FP8 and custom) quantization
//!
//! The tensor is divided by a scale that maps its max-abs onto the format's
//! largest finite value, rounded to the nearest representable minifloat and
//! scaled back.

use super::granularity::QuantGranularity;
use super::module::QuantModule;
use super::scaling::{ScalingImpl, ScalingStats};
use super::strategy::{QuantArgs, QuantStrategy};
use crate::autograd::{fake_quant, Device};
use crate::quant_tensor::{
    check_broadcast, expand_groups, FloatFormat, FloatQuantTensor, GroupwiseFloatQuantTensor,
    QuantOutput,
};
use crate::{Error, Result, Tensor};
use ndarray::{arr0, ArrayD};

fn round_scaled(
    x: &ArrayD<f32>,
    scale: &ArrayD<f32>,
    format: &FloatFormat,
    signed: bool,
) -> ArrayD<f32> {
    (x / scale).mapv(|v| format.round(v, signed)) * scale
}

/// Per-tensor or per-channel minifloat quantizer
#[derive(Clone, Debug)]
pub struct FloatQuant {
    format: FloatFormat,
    signed: bool,
    scaling: ScalingImpl,
    device: Device,
}

impl FloatQuant {
    pub fn new(format: FloatFormat) -> Self {
        Self {
            format,
            signed: true,
            scaling: ScalingImpl::stats(ScalingStats::MaxAbs, QuantGranularity::PerTensor),
            device: Device::Cpu,
        }
    }

    pub fn fp8_e4m3() -> Self {
        Self::new(FloatFormat::e4m3())
    }

    pub fn fp8_e5m2() -> Self {
        Self::new(FloatFormat::e5m2())
    }

    pub fn with_signed(mut self, signed: bool) -> Self {
        self.signed = signed;
        self
    }

    pub fn with_scaling(mut self, scaling: ScalingImpl) -> Self {
        self.scaling = scaling;
        self
    }

    pub fn format(&self) -> &FloatFormat {
        &self.format
    }
}

impl QuantModule for FloatQuant {
    fn name(&self) -> &str {
        "float_quant"
    }

    fn children_mut(&mut self) -> Vec<&mut dyn QuantModule> {
        vec![&mut self.scaling as &mut dyn QuantModule]
    }
}

impl QuantStrategy for FloatQuant {
    fn is_narrow_range(&self) -> Option<bool> {
        Some(false)
    }

    fn is_signed(&self) -> Option<bool> {
        Some(self.signed)
    }

    fn bit_width_hint(&self) -> Option<f32> {
        Some(self.format.bit_width(self.signed) as f32)
    }

    fn init_tensor_quant(&mut self, tensor: &Tensor) -> Result<()> {
        self.format.validate()?;
        if matches!(self.scaling.granularity(), QuantGranularity::PerGroup { .. }) {
            return Err(Error::Configuration(
                "per-group minifloat scaling needs GroupwiseFloatQuant".to_string(),
            ));
        }
        self.scaling.init_from(tensor.data())
    }

    fn device(&self) -> Device {
        self.device
    }

    fn to_device(&mut self, device: Device) {
        self.device = device;
    }

    fn forward(&mut self, x: &Tensor, args: &QuantArgs) -> Result<QuantOutput> {
        let scale = self.scaling.scale(x.data(), self.format.max_value())?;
        check_broadcast(&scale, x.shape(), "scale")?;
        let value = fake_quant(x, round_scaled(x.data(), &scale, &self.format, self.signed));
        Ok(QuantOutput::Float(FloatQuantTensor::new(
            value,
            scale,
            arr0(0.0f32).into_dyn(),
            self.format.clone(),
            self.signed,
            args.training,
        )?))
    }

    fn as_module_mut(&mut self) -> &mut dyn QuantModule {
        self
    }
}

/// Minifloat quantizer with one scale per group of `group_size` elements
#[derive(Clone, Debug)]
pub struct GroupwiseFloatQuant {
    format: FloatFormat,
    signed: bool,
    group_size: usize,
    group_dim: usize,
    scaling: ScalingImpl,
    device: Device,
}

impl GroupwiseFloatQuant {
    /// Runtime max-abs scale per group along `group_dim`
    pub fn new(format: FloatFormat, group_size: usize, group_dim: usize) -> Self {
        let granularity = QuantGranularity::PerGroup {
            size: group_size,
            dim: group_dim,
        };
        Self {
            format,
            signed: true,
            group_size,
            group_dim,
            scaling: ScalingImpl::stats(ScalingStats::MaxAbs, granularity),
            device: Device::Cpu,
        }
    }

    /// Hold per-group scales initialised from the registered tensor
    pub fn with_parameter_scaling(mut self) -> Self {
        self.scaling = ScalingImpl::parameter(ScalingStats::MaxAbs, self.scaling.granularity());
        self
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn group_dim(&self) -> usize {
        self.group_dim
    }

    pub fn format(&self) -> &FloatFormat {
        &self.format
    }
}

impl QuantModule for GroupwiseFloatQuant {
    fn name(&self) -> &str {
        "groupwise_float_quant"
    }

    fn children_mut(&mut self) -> Vec<&mut dyn QuantModule> {
        vec![&mut self.scaling as &mut dyn QuantModule]
    }
}

impl QuantStrategy for GroupwiseFloatQuant {
    fn is_narrow_range(&self) -> Option<bool> {
        Some(false)
    }

    fn is_signed(&self) -> Option<bool> {
        Some(self.signed)
    }

    fn bit_width_hint(&self) -> Option<f32> {
        Some(self.format.bit_width(self.signed) as f32)
    }

    fn init_tensor_quant(&mut self, tensor: &Tensor) -> Result<()> {
        self.format.validate()?;
        self.scaling.init_from(tensor.data())
    }

    fn device(&self) -> Device {
        self.device
    }

    fn to_device(&mut self, device: Device) {
        self.device = device;
    }

    fn forward(&mut self, x: &Tensor, args: &QuantArgs) -> Result<QuantOutput> {
        let compact = self.scaling.scale(x.data(), self.format.max_value())?;
        let scale = expand_groups(&compact, x.shape(), self.group_size, self.group_dim)?;
        let value = fake_quant(x, round_scaled(x.data(), &scale, &self.format, self.signed));
        Ok(QuantOutput::GroupwiseFloat(GroupwiseFloatQuantTensor::new(
            value,
            compact,
            arr0(0.0f32).into_dyn(),
            self.group_size,
            self.group_dim,
            self.format.clone(),
            self.signed,
            args.training,
        )?))
    }

    fn as_module_mut(&mut self) -> &mut dyn QuantModule {
        self
    }
}
