//! Affine integer quantization
//!
//! `code = clamp(round(x / scale + zero_point), min_int, max_int)` and
//! `value = (code - zero_point) * scale`, with a straight-through gradient.

use super::granularity::QuantGranularity;
use super::module::QuantModule;
use super::scaling::{BitWidthImpl, ScalingImpl, ScalingStats, ZeroPointImpl};
use super::strategy::{QuantArgs, QuantStrategy};
use crate::autograd::{fake_quant, Device};
use crate::quant_tensor::{check_broadcast, max_int, min_int, QuantOutput, QuantTensor};
use crate::{Error, Result, Tensor};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

/// Rounding applied to `x / scale`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    /// Round half to even
    #[default]
    HalfEven,
    /// Truncate toward zero; never increases magnitude
    TowardZero,
}

impl RoundingMode {
    pub fn apply(self, v: f32) -> f32 {
        match self {
            RoundingMode::HalfEven => v.round_ties_even(),
            RoundingMode::TowardZero => v.trunc(),
        }
    }
}

/// Integer quantizer
#[derive(Clone, Debug)]
pub struct IntQuant {
    signed: bool,
    narrow_range: bool,
    rounding: RoundingMode,
    scaling: ScalingImpl,
    zero_point: ZeroPointImpl,
    bit_width: BitWidthImpl,
    device: Device,
}

impl IntQuant {
    /// Symmetric signed quantizer with runtime max-abs scaling
    pub fn new(bit_width: u32) -> Self {
        Self {
            signed: true,
            narrow_range: false,
            rounding: RoundingMode::HalfEven,
            scaling: ScalingImpl::stats(ScalingStats::MaxAbs, QuantGranularity::PerTensor),
            zero_point: ZeroPointImpl::zero(),
            bit_width: BitWidthImpl::Const(bit_width),
            device: Device::Cpu,
        }
    }

    /// Signed narrow-range weights, per-tensor scale held as a parameter
    pub fn int8_weight_per_tensor() -> Self {
        Self::new(8)
            .with_narrow_range(true)
            .with_scaling(ScalingImpl::parameter(ScalingStats::MaxAbs, QuantGranularity::PerTensor))
    }

    /// Signed narrow-range weights, one scale per output channel
    pub fn int8_weight_per_channel(axis: usize) -> Self {
        Self::new(8).with_narrow_range(true).with_scaling(ScalingImpl::parameter(
            ScalingStats::MaxAbs,
            QuantGranularity::PerChannel { axis },
        ))
    }

    /// Signed activations with runtime scale
    pub fn int8_act() -> Self {
        Self::new(8)
    }

    /// Unsigned asymmetric activations with runtime scale and zero-point
    pub fn uint8_act_asym() -> Self {
        Self::new(8)
            .with_signed(false)
            .with_scaling(ScalingImpl::stats(ScalingStats::MinMax, QuantGranularity::PerTensor))
            .with_zero_point(ZeroPointImpl::stats(QuantGranularity::PerTensor))
    }

    pub fn with_signed(mut self, signed: bool) -> Self {
        self.signed = signed;
        self
    }

    pub fn with_narrow_range(mut self, narrow_range: bool) -> Self {
        self.narrow_range = narrow_range;
        self
    }

    pub fn with_rounding(mut self, rounding: RoundingMode) -> Self {
        self.rounding = rounding;
        self
    }

    pub fn with_scaling(mut self, scaling: ScalingImpl) -> Self {
        self.scaling = scaling;
        self
    }

    pub fn with_zero_point(mut self, zero_point: ZeroPointImpl) -> Self {
        self.zero_point = zero_point;
        self
    }

    pub fn with_bit_width(mut self, bit_width: BitWidthImpl) -> Self {
        self.bit_width = bit_width;
        self
    }

    pub fn scaling(&self) -> &ScalingImpl {
        &self.scaling
    }

    pub fn scaling_mut(&mut self) -> &mut ScalingImpl {
        &mut self.scaling
    }

    pub fn bit_width_impl(&self) -> BitWidthImpl {
        self.bit_width
    }

    fn check_granularity(&self) -> Result<()> {
        let grouped = |g: QuantGranularity| matches!(g, QuantGranularity::PerGroup { .. });
        if grouped(self.scaling.granularity()) || grouped(self.zero_point.granularity()) {
            return Err(Error::Configuration(
                "integer quantization supports per-tensor and per-channel granularity".to_string(),
            ));
        }
        Ok(())
    }

    /// Quantize with an explicit scale, bypassing the scaling submodule
    pub(crate) fn quantize(
        &self,
        x: &Tensor,
        args: &QuantArgs,
        scale_override: Option<ArrayD<f32>>,
    ) -> Result<QuantTensor> {
        self.check_granularity()?;
        let bits = self.bit_width.bit_width(args.shared_bit_width);
        let lo = min_int(bits, self.signed, self.narrow_range) as f32;
        let hi = max_int(bits, self.signed, self.narrow_range) as f32;
        // Symmetric schemes map the threshold onto max_int, affine ones onto the full range
        let divisor = if self.zero_point.is_zero() { hi } else { hi - lo };

        let scale = match scale_override {
            Some(scale) => scale,
            None => self.scaling.scale(x.data(), divisor)?,
        };
        check_broadcast(&scale, x.shape(), "scale")?;
        let zero_point = self.zero_point.zero_point(x.data(), &scale, lo, hi)?;
        check_broadcast(&zero_point, x.shape(), "zero_point")?;

        let rounding = self.rounding;
        let codes = (x.data() / &scale + &zero_point).mapv(|v| rounding.apply(v).clamp(lo, hi));
        let dequantized = (codes - &zero_point) * &scale;
        let value = fake_quant(x, dequantized);

        let shared = if self.bit_width.is_shared() {
            args.shared_bit_width
        } else {
            None
        };
        Ok(QuantTensor::new(
            value,
            scale,
            zero_point,
            bits,
            self.signed,
            self.narrow_range,
            args.training,
        )?
        .with_shared_bit_width(shared))
    }
}

impl QuantModule for IntQuant {
    fn name(&self) -> &str {
        "int_quant"
    }

    fn children_mut(&mut self) -> Vec<&mut dyn QuantModule> {
        vec![
            &mut self.scaling as &mut dyn QuantModule,
            &mut self.zero_point,
            &mut self.bit_width,
        ]
    }
}

impl QuantStrategy for IntQuant {
    fn is_narrow_range(&self) -> Option<bool> {
        Some(self.narrow_range)
    }

    fn is_signed(&self) -> Option<bool> {
        Some(self.signed)
    }

    fn bit_width_hint(&self) -> Option<f32> {
        Some(self.bit_width.nominal())
    }

    fn init_tensor_quant(&mut self, tensor: &Tensor) -> Result<()> {
        self.check_granularity()?;
        self.scaling.init_from(tensor.data())?;
        self.zero_point.init_from(tensor.data())
    }

    fn device(&self) -> Device {
        self.device
    }

    fn to_device(&mut self, device: Device) {
        self.device = device;
    }

    fn forward(&mut self, x: &Tensor, args: &QuantArgs) -> Result<QuantOutput> {
        Ok(QuantOutput::Int(self.quantize(x, args, None)?))
    }

    fn as_module_mut(&mut self) -> &mut dyn QuantModule {
        self
    }
}
