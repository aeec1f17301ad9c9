//! Input (activation) quantizer proxy

use super::QuantInputSource;
use crate::quant::{NoneQuant, QuantArgs, QuantStrategy};
use crate::quant_tensor::QuantOutput;
use crate::{Result, Tensor};

/// Quantizes a layer's input and remembers what it produced
pub struct ActQuantProxy {
    strategy: Box<dyn QuantStrategy>,
    initialized: bool,
    training: bool,
    last_bit_width: Option<f32>,
    last_signed: Option<bool>,
}

impl Default for ActQuantProxy {
    fn default() -> Self {
        Self::new(Box::new(NoneQuant::new()))
    }
}

impl ActQuantProxy {
    pub fn new(strategy: Box<dyn QuantStrategy>) -> Self {
        Self {
            strategy,
            initialized: false,
            training: true,
            last_bit_width: None,
            last_signed: None,
        }
    }

    pub fn is_quant_enabled(&self) -> bool {
        self.strategy.is_quant_enabled()
    }

    pub fn training(&self) -> bool {
        self.training
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// Quantize an input; the strategy is bound to the first tensor it sees
    pub fn forward(&mut self, x: &Tensor) -> Result<QuantOutput> {
        if !self.is_quant_enabled() {
            return Ok(QuantOutput::Passthrough(x.clone()));
        }
        if !self.initialized {
            self.strategy.init_tensor_quant(x)?;
            self.strategy.to_device(x.device());
            self.initialized = true;
            tracing::debug!(strategy = self.strategy.name(), "initialised input quantizer");
        }
        let args = QuantArgs {
            training: self.training,
            ..QuantArgs::default()
        };
        let out = self.strategy.forward(x, &args)?;
        self.last_bit_width = out.bit_width();
        self.last_signed = out.signed();
        Ok(out)
    }
}

impl QuantInputSource for ActQuantProxy {
    fn quant_input_bit_width(&self) -> Option<f32> {
        if !self.is_quant_enabled() {
            return None;
        }
        self.last_bit_width.or_else(|| self.strategy.bit_width_hint())
    }

    fn is_quant_input_signed(&self) -> Option<bool> {
        if !self.is_quant_enabled() {
            return None;
        }
        self.last_signed.or_else(|| self.strategy.is_signed())
    }
}

impl std::fmt::Debug for ActQuantProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActQuantProxy")
            .field("strategy", &self.strategy.name())
            .field("last_bit_width", &self.last_bit_width)
            .field("last_signed", &self.last_signed)
            .finish()
    }
}
