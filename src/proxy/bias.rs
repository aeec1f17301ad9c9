//! Bias quantizer proxy with the inference cache

use super::cache::CachedQuantMetadata;
use crate::autograd::Device;
use crate::quant::{QuantArgs, QuantStrategy};
use crate::quant_tensor::QuantOutput;
use crate::{Error, Result, Tensor};
use ndarray::ArrayD;

/// Binds a bias tensor to an injected strategy
///
/// Strategies that quantize on an external (accumulator) scale can only be
/// queried outside a forward pass through the cache, which is filled by
/// inference-mode passes when `cache_inference_bias` is set.
pub struct BiasQuantProxy {
    strategy: Box<dyn QuantStrategy>,
    cache_inference_bias: bool,
    cached: Option<CachedQuantMetadata>,
    disable_quant: bool,
    training: bool,
    init_count: usize,
}

impl BiasQuantProxy {
    pub fn new(strategy: Box<dyn QuantStrategy>, cache_inference_bias: bool) -> Self {
        Self {
            strategy,
            cache_inference_bias,
            cached: None,
            disable_quant: false,
            training: true,
            init_count: 0,
        }
    }

    pub fn init_tensor_quant(&mut self, tensor: &Tensor) -> Result<()> {
        self.strategy.init_tensor_quant(tensor)?;
        self.strategy.to_device(tensor.device());
        self.init_count += 1;
        tracing::debug!(
            strategy = self.strategy.name(),
            shape = ?tensor.shape(),
            device = ?tensor.device(),
            "initialised bias quantizer"
        );
        Ok(())
    }

    pub fn init_count(&self) -> usize {
        self.init_count
    }

    pub fn is_quant_enabled(&self) -> bool {
        !self.disable_quant && self.strategy.is_quant_enabled()
    }

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

    pub fn requires_input_scale(&self) -> bool {
        self.is_quant_enabled() && self.strategy.requires_input_scale()
    }

    pub fn requires_input_bit_width(&self) -> bool {
        self.is_quant_enabled() && self.strategy.requires_input_bit_width()
    }

    /// Metadata queries must go through the cache
    pub fn requires_external_metadata(&self) -> bool {
        self.requires_input_scale() || self.requires_input_bit_width()
    }

    pub fn cache_inference_bias(&self) -> bool {
        self.cache_inference_bias
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

    /// Last cached metadata
    ///
    /// Reading the cache in training mode is allowed but the values come from
    /// an earlier inference pass and may be stale.
    pub fn cached(&self) -> Result<&CachedQuantMetadata> {
        let cached = self.cached.as_ref().ok_or(Error::NoCachedBias)?;
        if self.training {
            tracing::warn!(
                strategy = self.strategy.name(),
                "cached bias quantization from an inference pass is being used during training"
            );
        }
        Ok(cached)
    }

    pub fn clear_cache(&mut self) {
        self.cached = None;
    }

    /// Quantize without touching the cache
    pub fn quantize(
        &mut self,
        x: &Tensor,
        input_scale: Option<ArrayD<f32>>,
        input_bit_width: Option<f32>,
    ) -> Result<QuantOutput> {
        if !self.is_quant_enabled() {
            return Ok(QuantOutput::Passthrough(x.clone()));
        }
        if self.strategy.requires_input_scale() && input_scale.is_none() {
            return Err(Error::Configuration(format!(
                "{} requires the accumulator scale",
                self.strategy.name()
            )));
        }
        if self.strategy.requires_input_bit_width() && input_bit_width.is_none() {
            return Err(Error::Configuration(format!(
                "{} requires the accumulator bit-width",
                self.strategy.name()
            )));
        }
        let args = QuantArgs {
            input_bit_width,
            input_is_signed: None,
            input_scale,
            shared_bit_width: None,
            training: self.training,
        };
        self.strategy.forward(x, &args)
    }

    /// Quantize during a layer pass; inference passes refresh the cache
    pub fn forward(
        &mut self,
        x: &Tensor,
        input_scale: Option<ArrayD<f32>>,
        input_bit_width: Option<f32>,
    ) -> Result<QuantOutput> {
        let out = self.quantize(x, input_scale, input_bit_width)?;
        if self.cache_inference_bias && !self.training {
            if let Some(metadata) = CachedQuantMetadata::from_output(&out) {
                tracing::debug!(
                    strategy = self.strategy.name(),
                    bit_width = metadata.bit_width,
                    "cached inference bias quantization"
                );
                self.cached = Some(metadata);
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for BiasQuantProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BiasQuantProxy")
            .field("strategy", &self.strategy.name())
            .field("cache_inference_bias", &self.cache_inference_bias)
            .field("cached", &self.cached.is_some())
            .field("training", &self.training)
            .finish()
    }
}
