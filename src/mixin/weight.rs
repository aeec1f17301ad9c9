//! Quantized weight parameter

use super::slice::SliceScope;
use crate::autograd::{Device, SubtensorSlice};
use crate::proxy::{QuantInputSource, WeightQuantProxy};
use crate::quant::{discover_sliceable, ModulePath, QuantStrategy};
use crate::quant_tensor::{IntRepr, QuantOutput};
use crate::{Error, Result, Tensor};
use ndarray::ArrayD;

/// Per-call options of [`QuantWeight::quant_weight`]
#[derive(Clone, Copy, Default)]
pub struct QuantWeightArgs<'a> {
    /// Quantized input of the current pass; supplies input bit-width and signedness
    pub quant_input: Option<&'a QuantOutput>,
    /// One `(start, stop)` or `None` (whole axis) per leading dimension
    pub subtensor_slice_list: Option<&'a [SubtensorSlice]>,
    pub shared_weight_bits: Option<f32>,
    /// Owning layer's record of its input quantization
    pub input_source: Option<&'a dyn QuantInputSource>,
}

/// Weight tensor plus its quantizer
#[derive(Debug)]
pub struct QuantWeight {
    weight: Option<Tensor>,
    weight_orig: Option<Tensor>,
    proxy: WeightQuantProxy,
    sliceable: Option<Vec<ModulePath>>,
    discovery_runs: usize,
}

impl QuantWeight {
    pub fn new(strategy: Box<dyn QuantStrategy>) -> Self {
        Self {
            weight: None,
            weight_orig: None,
            proxy: WeightQuantProxy::new(strategy),
            sliceable: None,
            discovery_runs: 0,
        }
    }

    /// Assign the weight; the quantizer is re-bound to its shape and device
    pub fn register_weight(&mut self, weight: Tensor) -> Result<()> {
        self.proxy.init_tensor_quant(&weight)?;
        self.weight = Some(weight);
        Ok(())
    }

    /// Replace the quantizer, binding it to the current weight if any
    pub fn set_quantizer(&mut self, strategy: Box<dyn QuantStrategy>) -> Result<()> {
        let mut proxy = WeightQuantProxy::new(strategy);
        proxy.set_training(self.proxy.training());
        if let Some(weight) = &self.weight {
            proxy.init_tensor_quant(weight)?;
        }
        self.proxy = proxy;
        self.sliceable = None;
        self.discovery_runs = 0;
        Ok(())
    }

    pub fn weight(&self) -> Option<&Tensor> {
        self.weight.as_ref()
    }

    /// Overwrite the weight values in place, e.g. after an optimizer step
    ///
    /// The shape is fixed; a new shape or device goes through
    /// [`QuantWeight::register_weight`] so the quantizer is re-bound.
    pub fn update_weight(&mut self, data: ArrayD<f32>) -> Result<()> {
        let weight = self
            .weight
            .as_mut()
            .ok_or_else(|| Error::MissingParameter("weight".to_string()))?;
        if weight.shape() != data.shape() {
            return Err(Error::ShapeMismatch {
                expected: weight.shape().to_vec(),
                got: data.shape().to_vec(),
            });
        }
        weight.data_mut().assign(&data);
        Ok(())
    }

    /// Full-precision copy used while quantization is disabled
    pub fn weight_orig(&self) -> Option<&Tensor> {
        self.weight_orig.as_ref()
    }

    pub fn set_weight_orig(&mut self, weight_orig: Option<Tensor>) {
        self.weight_orig = weight_orig;
    }

    /// Snapshot the live weight as the full-precision copy
    pub fn store_weight_orig(&mut self) {
        self.weight_orig = self.weight.as_ref().map(Tensor::detach);
    }

    pub fn proxy(&self) -> &WeightQuantProxy {
        &self.proxy
    }

    pub fn proxy_mut(&mut self) -> &mut WeightQuantProxy {
        &mut self.proxy
    }

    pub fn is_weight_quant_enabled(&self) -> bool {
        self.proxy.is_quant_enabled()
    }

    pub fn set_weight_quant_enabled(&mut self, enabled: bool) {
        self.proxy.set_quant_enabled(enabled);
    }

    pub fn is_quant_weight_narrow_range(&self) -> Option<bool> {
        self.proxy.is_narrow_range()
    }

    pub fn is_quant_weight_signed(&self) -> Option<bool> {
        self.proxy.is_signed()
    }

    pub fn requires_quant_input(&self) -> bool {
        self.proxy.requires_quant_input()
    }

    pub fn device(&self) -> Device {
        self.proxy.device()
    }

    pub fn set_training(&mut self, training: bool) {
        self.proxy.set_training(training);
    }

    /// Walk the strategy's module tree once and remember its sliceable submodules
    fn discover_sliceable_once(&mut self) {
        if self.sliceable.is_none() {
            let paths = discover_sliceable(self.proxy.module_mut());
            self.discovery_runs += 1;
            tracing::trace!(count = paths.len(), "discovered sliceable quantizer modules");
            self.sliceable = Some(paths);
        }
    }

    /// Module-tree walks performed for the current quantizer
    pub fn discovery_runs(&self) -> usize {
        self.discovery_runs
    }

    /// Quantize the weight, or a region of it
    ///
    /// With a slice list the region is cut from the source tensor and the
    /// strategy's parameter submodules are restricted to the same region for
    /// the duration of the call.
    pub fn quant_weight(&mut self, args: QuantWeightArgs<'_>) -> Result<QuantOutput> {
        let live = self
            .weight
            .as_ref()
            .ok_or_else(|| Error::MissingParameter("weight".to_string()))?;
        let source = match &self.weight_orig {
            Some(orig) if !self.proxy.is_quant_enabled() => orig,
            _ => live,
        };

        let input_bit_width = args.quant_input.and_then(QuantOutput::bit_width);
        let input_is_signed = args.quant_input.and_then(QuantOutput::signed);

        match args.subtensor_slice_list {
            Some(slices) => {
                let region = source.slice(slices)?;
                self.discover_sliceable_once();
                let paths = self.sliceable.as_deref().unwrap_or_default();
                let mut scope = SliceScope::bind(&mut self.proxy, paths, slices)?;
                scope.forward(
                    &region,
                    input_bit_width,
                    input_is_signed,
                    args.shared_weight_bits,
                    args.input_source,
                )
            }
            None => self.proxy.forward(
                source,
                input_bit_width,
                input_is_signed,
                args.shared_weight_bits,
                args.input_source,
            ),
        }
    }

    fn full(&mut self, input_source: Option<&dyn QuantInputSource>) -> Result<QuantOutput> {
        self.quant_weight(QuantWeightArgs {
            input_source,
            ..QuantWeightArgs::default()
        })
    }

    /// Integer codes of the full weight; `None` when quantization is disabled
    pub fn int_weight(
        &mut self,
        float_datatype: bool,
        input_source: Option<&dyn QuantInputSource>,
    ) -> Result<Option<IntRepr>> {
        self.full(input_source)?.int(float_datatype)
    }

    pub fn quant_weight_scale(
        &mut self,
        input_source: Option<&dyn QuantInputSource>,
    ) -> Result<Option<ArrayD<f32>>> {
        Ok(self.full(input_source)?.scale().cloned())
    }

    pub fn quant_weight_zero_point(
        &mut self,
        input_source: Option<&dyn QuantInputSource>,
    ) -> Result<Option<ArrayD<f32>>> {
        Ok(self.full(input_source)?.zero_point().cloned())
    }

    pub fn quant_weight_bit_width(
        &mut self,
        input_source: Option<&dyn QuantInputSource>,
    ) -> Result<Option<f32>> {
        Ok(self.full(input_source)?.bit_width())
    }

    pub fn quant_weight_shared_bit_width(
        &mut self,
        shared_weight_bits: Option<f32>,
        input_source: Option<&dyn QuantInputSource>,
    ) -> Result<Option<f32>> {
        let out = self.quant_weight(QuantWeightArgs {
            shared_weight_bits,
            input_source,
            ..QuantWeightArgs::default()
        })?;
        Ok(out.shared_bit_width())
    }
}
