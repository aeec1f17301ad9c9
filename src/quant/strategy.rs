//! Pluggable quantization strategies

use super::module::QuantModule;
use crate::autograd::Device;
use crate::quant_tensor::QuantOutput;
use crate::{Result, Tensor};
use ndarray::ArrayD;

/// Per-call inputs a strategy may depend on
#[derive(Clone, Debug, Default)]
pub struct QuantArgs {
    /// Bit-width of the upstream quantized activation
    pub input_bit_width: Option<f32>,
    pub input_is_signed: Option<bool>,
    /// Accumulator scale, for bias quantizers
    pub input_scale: Option<ArrayD<f32>>,
    /// Bit-width coordinated across layers
    pub shared_bit_width: Option<f32>,
    pub training: bool,
}

/// Quantization algorithm injected into a proxy
///
/// Implementations must be deterministic for a given input and state: the
/// same tensor quantized twice in inference mode yields identical metadata.
pub trait QuantStrategy: QuantModule {
    fn is_quant_enabled(&self) -> bool {
        true
    }

    /// `None` when the notion does not apply (disabled quantization)
    fn is_narrow_range(&self) -> Option<bool>;

    fn is_signed(&self) -> Option<bool>;

    /// Needs the bit-width and signedness of the quantized input
    fn requires_quant_input(&self) -> bool {
        false
    }

    fn requires_input_scale(&self) -> bool {
        false
    }

    fn requires_input_bit_width(&self) -> bool {
        false
    }

    /// Nominal bit-width before any shared override
    fn bit_width_hint(&self) -> Option<f32>;

    /// Bind the strategy to a concrete tensor (shape-dependent parameters)
    fn init_tensor_quant(&mut self, tensor: &Tensor) -> Result<()>;

    fn device(&self) -> Device;

    fn to_device(&mut self, device: Device);

    fn forward(&mut self, x: &Tensor, args: &QuantArgs) -> Result<QuantOutput>;

    fn as_module_mut(&mut self) -> &mut dyn QuantModule;
}
