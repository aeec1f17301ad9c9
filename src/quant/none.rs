//! Disabled quantization

use super::module::QuantModule;
use super::strategy::{QuantArgs, QuantStrategy};
use crate::autograd::Device;
use crate::quant_tensor::QuantOutput;
use crate::{Result, Tensor};

/// Strategy that leaves tensors untouched
#[derive(Clone, Debug, Default)]
pub struct NoneQuant {
    device: Device,
}

impl NoneQuant {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QuantModule for NoneQuant {
    fn name(&self) -> &str {
        "none"
    }
}

impl QuantStrategy for NoneQuant {
    fn is_quant_enabled(&self) -> bool {
        false
    }

    fn is_narrow_range(&self) -> Option<bool> {
        None
    }

    fn is_signed(&self) -> Option<bool> {
        None
    }

    fn bit_width_hint(&self) -> Option<f32> {
        None
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

    fn forward(&mut self, x: &Tensor, _args: &QuantArgs) -> Result<QuantOutput> {
        Ok(QuantOutput::Passthrough(x.clone()))
    }

    fn as_module_mut(&mut self) -> &mut dyn QuantModule {
        self
    }
}
