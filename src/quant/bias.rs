//! Bias quantization in the accumulator domain
//!
//! A bias is added to the integer accumulator of `x · w`, so its scale is
//! dictated by the layer: `input_scale × weight_scale`. Its bit-width is
//! either fixed (typically 32) or follows the accumulator.

use super::int_quant::{IntQuant, RoundingMode};
use super::module::QuantModule;
use super::scaling::{BitWidthImpl, ScalingImpl};
use super::strategy::{QuantArgs, QuantStrategy};
use crate::autograd::Device;
use crate::quant_tensor::QuantOutput;
use crate::{Error, Result, Tensor};

/// Signed bias quantizer driven by an external scale
#[derive(Clone, Debug)]
pub struct IntBiasQuant {
    bit_width: Option<u32>,
    narrow_range: bool,
    rounding: RoundingMode,
    device: Device,
}

impl IntBiasQuant {
    /// Fixed bit-width
    pub fn new(bit_width: u32) -> Self {
        Self {
            bit_width: Some(bit_width),
            narrow_range: false,
            rounding: RoundingMode::HalfEven,
            device: Device::Cpu,
        }
    }

    pub fn int32() -> Self {
        Self::new(32)
    }

    /// Bit-width taken from the accumulator at every call
    pub fn accumulator_bit_width() -> Self {
        Self {
            bit_width: None,
            ..Self::new(32)
        }
    }

    pub fn with_narrow_range(mut self, narrow_range: bool) -> Self {
        self.narrow_range = narrow_range;
        self
    }

    pub fn fixed_bit_width(&self) -> Option<u32> {
        self.bit_width
    }
}

impl QuantModule for IntBiasQuant {
    fn name(&self) -> &str {
        "int_bias_quant"
    }
}

impl QuantStrategy for IntBiasQuant {
    fn is_narrow_range(&self) -> Option<bool> {
        Some(self.narrow_range)
    }

    fn is_signed(&self) -> Option<bool> {
        Some(true)
    }

    fn requires_input_scale(&self) -> bool {
        true
    }

    fn requires_input_bit_width(&self) -> bool {
        self.bit_width.is_none()
    }

    fn bit_width_hint(&self) -> Option<f32> {
        self.bit_width.map(|b| b as f32)
    }

    fn init_tensor_quant(&mut self, _tensor: &Tensor) -> Result<()> {
        Ok(())
    }

    fn device(&self) -> Device {
        self.device
    }

    fn to_device(&mut self, device: Device) {
        self.device = device;
    }

    fn forward(&mut self, x: &Tensor, args: &QuantArgs) -> Result<QuantOutput> {
        let scale = args.input_scale.clone().ok_or_else(|| {
            Error::Configuration("bias quantization requires an input scale".to_string())
        })?;
        let bits = match (self.bit_width, args.input_bit_width) {
            (Some(bits), _) => bits,
            (None, Some(bits)) if bits >= 1.0 => bits.ceil() as u32,
            (None, _) => {
                return Err(Error::Configuration(
                    "bias quantization requires an input bit-width".to_string(),
                ))
            }
        };

        let quantizer = IntQuant::new(bits)
            .with_narrow_range(self.narrow_range)
            .with_rounding(self.rounding)
            .with_bit_width(BitWidthImpl::Const(bits))
            .with_scaling(ScalingImpl::constant(1.0));
        let args = QuantArgs {
            shared_bit_width: None,
            ..args.clone()
        };
        Ok(QuantOutput::Int(quantizer.quantize(x, &args, Some(scale))?))
    }

    fn as_module_mut(&mut self) -> &mut dyn QuantModule {
        self
    }
}
