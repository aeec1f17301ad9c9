//! Weight quantizer proxy

use super::QuantInputSource;
use crate::autograd::Device;
use crate::quant::{QuantArgs, QuantModule, QuantStrategy};
use crate::quant_tensor::QuantOutput;
use crate::{Error, Result, Tensor};

/// Binds a weight tensor to an injected strategy
pub struct WeightQuantProxy {
    strategy: Box<dyn QuantStrategy>,
    disable_quant: bool,
    training: bool,
    init_count: usize,
}

impl WeightQuantProxy {
    pub fn new(strategy: Box<dyn QuantStrategy>) -> Self {
        Self {
            strategy,
            disable_quant: false,
            training: true,
            init_count: 0,
        }
    }

    /// (Re)initialise the strategy against `tensor` and follow its device
    pub fn init_tensor_quant(&mut self, tensor: &Tensor) -> Result<()> {
        self.strategy.init_tensor_quant(tensor)?;
        self.strategy.to_device(tensor.device());
        self.init_count += 1;
        tracing::debug!(
            strategy = self.strategy.name(),
            shape = ?tensor.shape(),
            device = ?tensor.device(),
            "initialised weight quantizer"
        );
        Ok(())
    }

    /// Number of times the strategy has been bound to a tensor
    pub fn init_count(&self) -> usize {
        self.init_count
    }

    pub fn is_quant_enabled(&self) -> bool {
        !self.disable_quant && self.strategy.is_quant_enabled()
    }

    /// Temporarily bypass quantization without dropping the strategy
    pub fn set_quant_enabled(&mut self, enabled: bool) {
        self.disable_quant = !enabled;
    }

    pub fn is_narrow_range(&self) -> Option<bool> {
        self.is_quant_enabled()
            .then(|| self.strategy.is_narrow_range())
            .flatten()
    }

    pub fn is_signed(&self) -> Option<bool> {
        self.is_quant_enabled()
            .then(|| self.strategy.is_signed())
            .flatten()
    }

    pub fn requires_quant_input(&self) -> bool {
        self.is_quant_enabled() && self.strategy.requires_quant_input()
    }

    pub fn requires_input_bit_width(&self) -> bool {
        self.is_quant_enabled() && self.strategy.requires_input_bit_width()
    }

    pub fn requires_input_scale(&self) -> bool {
        self.is_quant_enabled() && self.strategy.requires_input_scale()
    }

    pub fn device(&self) -> Device {
        self.strategy.device()
    }

    pub fn training(&self) -> bool {
        self.training
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn strategy(&self) -> &dyn QuantStrategy {
        self.strategy.as_ref()
    }

    /// Root of the strategy's module tree
    pub fn module_mut(&mut self) -> &mut dyn QuantModule {
        self.strategy.as_module_mut()
    }

    /// Quantize `x`
    ///
    /// Input metadata not passed explicitly is taken from `input_source`; a
    /// strategy that needs it when neither provides it is a configuration error.
    pub fn forward(
        &mut self,
        x: &Tensor,
        input_bit_width: Option<f32>,
        input_is_signed: Option<bool>,
        shared_bit_width: Option<f32>,
        input_source: Option<&dyn QuantInputSource>,
    ) -> Result<QuantOutput> {
        if !self.is_quant_enabled() {
            return Ok(QuantOutput::Passthrough(x.clone()));
        }

        let needs_bit_width =
            self.strategy.requires_quant_input() || self.strategy.requires_input_bit_width();
        let needs_signed = self.strategy.requires_quant_input();
        let input_bit_width =
            input_bit_width.or_else(|| input_source.and_then(|s| s.quant_input_bit_width()));
        let input_is_signed =
            input_is_signed.or_else(|| input_source.and_then(|s| s.is_quant_input_signed()));

        if needs_bit_width && input_bit_width.is_none() {
            return Err(Error::Configuration(format!(
                "{} requires the input bit-width, but none was passed and the layer has no quantized input",
                self.strategy.name()
            )));
        }
        if needs_signed && input_is_signed.is_none() {
            return Err(Error::Configuration(format!(
                "{} requires the input signedness, but none was passed and the layer has no quantized input",
                self.strategy.name()
            )));
        }

        let args = QuantArgs {
            input_bit_width,
            input_is_signed,
            input_scale: None,
            shared_bit_width,
            training: self.training,
        };
        self.strategy.forward(x, &args)
    }
}

impl std::fmt::Debug for WeightQuantProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightQuantProxy")
            .field("strategy", &self.strategy.name())
            .field("disable_quant", &self.disable_quant)
            .field("training", &self.training)
            .finish()
    }
}
