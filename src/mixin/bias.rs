//! Quantized bias parameter
//!
//! Every query degrades to `None` when the layer has no bias. Strategies that
//! quantize on the accumulator scale are answered from the proxy's inference
//! cache; the rest are recomputed on each call.

use crate::autograd::Device;
use crate::proxy::{BiasQuantProxy, CachedQuantMetadata};
use crate::quant::QuantStrategy;
use crate::quant_tensor::{IntRepr, QuantOutput};
use crate::{Error, Result, Tensor};
use ndarray::ArrayD;

/// Optional bias tensor plus its quantizer
#[derive(Debug)]
pub struct QuantBias {
    bias: Option<Tensor>,
    proxy: BiasQuantProxy,
}

impl QuantBias {
    pub fn new(strategy: Box<dyn QuantStrategy>, cache_inference_bias: bool) -> Self {
        Self {
            bias: None,
            proxy: BiasQuantProxy::new(strategy, cache_inference_bias),
        }
    }

    /// Assign or remove the bias; an assigned bias re-binds the quantizer
    pub fn register_bias(&mut self, bias: Option<Tensor>) -> Result<()> {
        if let Some(b) = &bias {
            self.proxy.init_tensor_quant(b)?;
        }
        self.bias = bias;
        Ok(())
    }

    /// Replace the quantizer, keeping the caching policy
    pub fn set_quantizer(
        &mut self,
        strategy: Box<dyn QuantStrategy>,
        cache_inference_bias: bool,
    ) -> Result<()> {
        let mut proxy = BiasQuantProxy::new(strategy, cache_inference_bias);
        proxy.set_training(self.proxy.training());
        if let Some(b) = &self.bias {
            proxy.init_tensor_quant(b)?;
        }
        self.proxy = proxy;
        Ok(())
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Overwrite the bias values in place; the shape is fixed
    pub fn update_bias(&mut self, data: ArrayD<f32>) -> Result<()> {
        let bias = self
            .bias
            .as_mut()
            .ok_or_else(|| Error::MissingParameter("bias".to_string()))?;
        if bias.shape() != data.shape() {
            return Err(Error::ShapeMismatch {
                expected: bias.shape().to_vec(),
                got: data.shape().to_vec(),
            });
        }
        bias.data_mut().assign(&data);
        Ok(())
    }

    pub fn proxy(&self) -> &BiasQuantProxy {
        &self.proxy
    }

    pub fn proxy_mut(&mut self) -> &mut BiasQuantProxy {
        &mut self.proxy
    }

    pub fn device(&self) -> Device {
        self.proxy.device()
    }

    pub fn set_training(&mut self, training: bool) {
        self.proxy.set_training(training);
    }

    pub fn is_bias_quant_enabled(&self) -> Option<bool> {
        self.bias.as_ref().map(|_| self.proxy.is_quant_enabled())
    }

    pub fn is_quant_bias_narrow_range(&self) -> Option<bool> {
        self.bias.as_ref().and_then(|_| self.proxy.is_narrow_range())
    }

    pub fn is_quant_bias_signed(&self) -> Option<bool> {
        self.bias.as_ref().and_then(|_| self.proxy.is_signed())
    }

    /// Does the accumulator scale (or bit-width) have to come from the layer?
    pub fn requires_input_scale(&self) -> bool {
        self.bias.is_some() && self.proxy.requires_input_scale()
    }

    pub fn requires_input_bit_width(&self) -> bool {
        self.bias.is_some() && self.proxy.requires_input_bit_width()
    }

    /// Quantize during a layer pass with the accumulator metadata of that pass
    pub fn forward_bias(
        &mut self,
        input_scale: Option<ArrayD<f32>>,
        input_bit_width: Option<f32>,
    ) -> Result<Option<QuantOutput>> {
        match &self.bias {
            None => Ok(None),
            Some(b) => self.proxy.forward(b, input_scale, input_bit_width).map(Some),
        }
    }

    fn cached(&self) -> Result<Option<&CachedQuantMetadata>> {
        if self.bias.is_none() || !self.proxy.requires_external_metadata() {
            return Ok(None);
        }
        self.proxy.cached().map(Some)
    }

    /// Quantized bias outside a layer pass
    pub fn quant_bias(&mut self) -> Result<Option<QuantOutput>> {
        let Some(b) = &self.bias else {
            return Ok(None);
        };
        if !self.proxy.requires_external_metadata() {
            return self.proxy.quantize(b, None, None).map(Some);
        }
        let cached = self.proxy.cached()?;
        let (scale, bit_width) = (cached.scale.clone(), cached.bit_width);
        self.proxy.quantize(b, Some(scale), Some(bit_width)).map(Some)
    }

    pub fn int_bias(&mut self, float_datatype: bool) -> Result<Option<IntRepr>> {
        match self.quant_bias()? {
            Some(out) => out.int(float_datatype),
            None => Ok(None),
        }
    }

    pub fn quant_bias_scale(&mut self) -> Result<Option<ArrayD<f32>>> {
        if let Some(cached) = self.cached()? {
            return Ok(Some(cached.scale.clone()));
        }
        Ok(self.quant_bias()?.and_then(|out| out.scale().cloned()))
    }

    pub fn quant_bias_zero_point(&mut self) -> Result<Option<ArrayD<f32>>> {
        if let Some(cached) = self.cached()? {
            return Ok(Some(cached.zero_point.clone()));
        }
        Ok(self.quant_bias()?.and_then(|out| out.zero_point().cloned()))
    }

    pub fn quant_bias_bit_width(&mut self) -> Result<Option<f32>> {
        if let Some(cached) = self.cached()? {
            return Ok(Some(cached.bit_width));
        }
        Ok(self.quant_bias()?.and_then(|out| out.bit_width()))
    }
}
