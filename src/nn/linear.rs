//! Quantized fully-connected layer

use crate::autograd::{linear, Context};
use crate::mixin::{QuantBias, QuantWeight, QuantWeightArgs};
use crate::proxy::{ActQuantProxy, QuantInputSource};
use crate::quant::{NoneQuant, QuantStrategy};
use crate::quant_tensor::{IntRepr, QuantOutput};
use crate::{Error, Result, SubtensorSlice, Tensor};
use ndarray::{arr0, Array1, ArrayD};
use rand::{Rng, SeedableRng};

/// Everything a forward pass quantized, plus its output
#[derive(Debug)]
pub struct LinearPass {
    pub input: QuantOutput,
    pub weight: QuantOutput,
    pub bias: Option<QuantOutput>,
    pub output: Tensor,
}

/// `y = q(x) · q(W)ᵀ + q(b)`
///
/// The bias quantizer may work on the accumulator: scale
/// `input_scale × weight_scale` and bit-width
/// `input_bits + weight_bits + ⌈log₂ in_features⌉`.
#[derive(Debug)]
pub struct QuantLinear {
    in_features: usize,
    out_features: usize,
    input_quant: ActQuantProxy,
    weight: QuantWeight,
    bias: QuantBias,
    context: Context,
}

impl QuantLinear {
    /// Unquantized layer, weights uniform in ±1/√in_features, zero bias
    pub fn new(in_features: usize, out_features: usize, bias: bool, seed: u64) -> Result<Self> {
        if in_features == 0 || out_features == 0 {
            return Err(Error::InvalidParameter(format!(
                "linear layer needs positive dimensions, got {in_features}x{out_features}"
            )));
        }
        let bound = 1.0 / (in_features as f32).sqrt();
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let data: Vec<f32> = (0..in_features * out_features)
            .map(|_| rng.random_range(-bound..bound))
            .collect();

        let mut weight = QuantWeight::new(Box::new(NoneQuant::new()));
        weight.register_weight(Tensor::from_shape_vec(&[out_features, in_features], data, true)?)?;
        let mut quant_bias = QuantBias::new(Box::new(NoneQuant::new()), false);
        quant_bias.register_bias(bias.then(|| Tensor::zeros(&[out_features], true)))?;

        Ok(Self {
            in_features,
            out_features,
            input_quant: ActQuantProxy::default(),
            weight,
            bias: quant_bias,
            context: Context::new(),
        })
    }

    pub fn with_input_quant(mut self, strategy: Box<dyn QuantStrategy>) -> Self {
        self.input_quant = ActQuantProxy::new(strategy);
        self.input_quant.set_training(self.context.is_training());
        self
    }

    pub fn with_weight_quant(mut self, strategy: Box<dyn QuantStrategy>) -> Result<Self> {
        self.weight.set_quantizer(strategy)?;
        Ok(self)
    }

    pub fn with_bias_quant(
        mut self,
        strategy: Box<dyn QuantStrategy>,
        cache_inference_bias: bool,
    ) -> Result<Self> {
        self.bias.set_quantizer(strategy, cache_inference_bias)?;
        Ok(self)
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn input_quant(&self) -> &ActQuantProxy {
        &self.input_quant
    }

    pub fn weight(&self) -> &QuantWeight {
        &self.weight
    }

    pub fn weight_mut(&mut self) -> &mut QuantWeight {
        &mut self.weight
    }

    pub fn bias(&self) -> &QuantBias {
        &self.bias
    }

    pub fn bias_mut(&mut self) -> &mut QuantBias {
        &mut self.bias
    }

    /// Training mode: statistics are live and the bias cache is not refreshed
    pub fn train(&mut self) {
        self.set_training(true);
    }

    /// Inference mode: bias passes refresh the cache when enabled
    pub fn eval(&mut self) {
        self.set_training(false);
    }

    fn set_training(&mut self, training: bool) {
        self.context.set_training(training);
        self.input_quant.set_training(training);
        self.weight.set_training(training);
        self.bias.set_training(training);
    }

    pub fn is_training(&self) -> bool {
        self.context.is_training()
    }

    /// Inference passes since the layer last entered inference mode
    pub fn inference_passes(&self) -> usize {
        self.context.inference_passes()
    }

    /// Quantize a weight region with this layer as the input source
    pub fn quant_weight(
        &mut self,
        subtensor_slice_list: Option<&[SubtensorSlice]>,
        shared_weight_bits: Option<f32>,
    ) -> Result<QuantOutput> {
        self.weight.quant_weight(QuantWeightArgs {
            subtensor_slice_list,
            shared_weight_bits,
            input_source: Some(&self.input_quant),
            ..QuantWeightArgs::default()
        })
    }

    pub fn int_weight(&mut self, float_datatype: bool) -> Result<Option<IntRepr>> {
        self.weight.int_weight(float_datatype, Some(&self.input_quant))
    }

    pub fn quant_weight_scale(&mut self) -> Result<Option<ArrayD<f32>>> {
        self.weight.quant_weight_scale(Some(&self.input_quant))
    }

    pub fn quant_weight_zero_point(&mut self) -> Result<Option<ArrayD<f32>>> {
        self.weight.quant_weight_zero_point(Some(&self.input_quant))
    }

    pub fn quant_weight_bit_width(&mut self) -> Result<Option<f32>> {
        self.weight.quant_weight_bit_width(Some(&self.input_quant))
    }

    fn accumulator_scale(&self, input: &QuantOutput, weight: &QuantOutput) -> Result<ArrayD<f32>> {
        let (Some(input_scale), Some(weight_scale)) = (input.scale(), weight.scale()) else {
            return Err(Error::Configuration(
                "bias quantization on the accumulator scale needs a quantized input and weight"
                    .to_string(),
            ));
        };
        let input_scale = match input_scale.len() {
            1 => input_scale.iter().copied().next().unwrap_or(1.0),
            _ => {
                return Err(Error::Configuration(
                    "bias quantization needs a per-tensor input scale".to_string(),
                ))
            }
        };
        let scale: Vec<f32> = weight_scale.iter().map(|s| s * input_scale).collect();
        match scale.len() {
            1 => Ok(arr0(scale[0]).into_dyn()),
            n if n == self.out_features => Ok(Array1::from(scale).into_dyn()),
            _ => Err(Error::ShapeMismatch {
                expected: vec![self.out_features],
                got: weight_scale.shape().to_vec(),
            }),
        }
    }

    fn accumulator_bit_width(&self, input: &QuantOutput, weight: &QuantOutput) -> Result<f32> {
        match (input.bit_width(), weight.bit_width()) {
            (Some(input_bits), Some(weight_bits)) => {
                Ok(input_bits + weight_bits + (self.in_features as f32).log2().ceil())
            }
            _ => Err(Error::Configuration(
                "bias quantization on the accumulator bit-width needs a quantized input and weight"
                    .to_string(),
            )),
        }
    }

    /// Forward pass keeping every quantized operand
    pub fn forward_quant(&mut self, x: &Tensor) -> Result<LinearPass> {
        let input = self.input_quant.forward(x)?;
        let weight = self.weight.quant_weight(QuantWeightArgs {
            quant_input: Some(&input),
            input_source: Some(&self.input_quant),
            ..QuantWeightArgs::default()
        })?;

        let bias = if self.bias.bias().is_some() {
            let scale = if self.bias.requires_input_scale() {
                Some(self.accumulator_scale(&input, &weight)?)
            } else {
                None
            };
            let bit_width = if self.bias.requires_input_bit_width() {
                Some(self.accumulator_bit_width(&input, &weight)?)
            } else {
                None
            };
            self.bias.forward_bias(scale, bit_width)?
        } else {
            None
        };

        let output = linear(input.value(), weight.value(), bias.as_ref().map(QuantOutput::value))?;
        self.context.record_pass();
        Ok(LinearPass {
            input,
            weight,
            bias,
            output,
        })
    }

    pub fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        Ok(self.forward_quant(x)?.output)
    }
}

impl QuantInputSource for QuantLinear {
    fn quant_input_bit_width(&self) -> Option<f32> {
        self.input_quant.quant_input_bit_width()
    }

    fn is_quant_input_signed(&self) -> Option<bool> {
        self.input_quant.is_quant_input_signed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::backward;
    use crate::quant::{AccumulatorAwareQuant, IntBiasQuant, IntQuant};
    use approx::assert_abs_diff_eq;

    fn input() -> Tensor {
        let data = vec![0.5, -1.0, 0.25, 2.0, 1.0, 0.0, -0.5, 0.75];
        Tensor::from_shape_vec(&[2, 4], data, false).unwrap()
    }

    fn int8_layer(cache: bool) -> QuantLinear {
        QuantLinear::new(4, 3, true, 7)
            .unwrap()
            .with_input_quant(Box::new(IntQuant::int8_act()))
            .with_weight_quant(Box::new(IntQuant::int8_weight_per_channel(0)))
            .unwrap()
            .with_bias_quant(Box::new(IntBiasQuant::int32()), cache)
            .unwrap()
    }

    #[test]
    fn test_seeded_init_is_deterministic() {
        let a = QuantLinear::new(4, 3, true, 42).unwrap();
        let b = QuantLinear::new(4, 3, true, 42).unwrap();
        let c = QuantLinear::new(4, 3, true, 43).unwrap();
        let wa = a.weight().weight().unwrap().data();
        assert_eq!(wa, b.weight().weight().unwrap().data());
        assert_ne!(wa, c.weight().weight().unwrap().data());
        assert!(wa.iter().all(|v| v.abs() <= 0.5));
    }

    #[test]
    fn test_unquantized_matches_plain_linear() {
        let mut layer = QuantLinear::new(4, 3, true, 1).unwrap();
        let y = layer.forward(&input()).unwrap();
        let w = layer.weight().weight().unwrap().clone();
        let expected = linear(&input(), &w, layer.bias().bias()).unwrap();
        assert_eq!(y.data(), expected.data());
        assert_eq!(y.shape(), &[2, 3]);
    }

    #[test]
    fn test_int8_forward_close_to_float() {
        let mut float_layer = QuantLinear::new(4, 3, true, 7).unwrap();
        let reference = float_layer.forward(&input()).unwrap();
        let mut layer = int8_layer(false);
        let y = layer.forward(&input()).unwrap();
        for (a, b) in y.data().iter().zip(reference.data().iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 0.05);
        }
    }

    #[test]
    fn test_bias_uses_accumulator_scale() {
        let mut layer = int8_layer(false);
        let pass = layer.forward_quant(&input()).unwrap();
        let input_scale = pass.input.scale().unwrap()[[]];
        let weight_scale = pass.weight.scale().unwrap();
        let bias_scale = pass.bias.as_ref().unwrap().scale().unwrap();
        assert_eq!(bias_scale.shape(), &[3]);
        for c in 0..3 {
            assert_abs_diff_eq!(bias_scale[[c]], weight_scale[[c, 0]] * input_scale);
        }
    }

    #[test]
    fn test_bias_cache_after_eval_pass() {
        let mut layer = int8_layer(true);
        assert!(matches!(
            layer.bias_mut().quant_bias_scale().unwrap_err(),
            Error::NoCachedBias
        ));
        layer.forward(&input()).unwrap();
        assert!(layer.bias_mut().quant_bias_scale().is_err());
        assert_eq!(layer.inference_passes(), 0);

        layer.eval();
        let pass = layer.forward_quant(&input()).unwrap();
        assert_eq!(layer.inference_passes(), 1);
        let cached = layer.bias_mut().quant_bias_scale().unwrap().unwrap();
        assert_eq!(Some(&cached), pass.bias.as_ref().unwrap().scale());
        assert_eq!(layer.bias_mut().quant_bias_bit_width().unwrap(), Some(32.0));
    }

    #[test]
    fn test_accumulator_bit_width_for_bias() {
        let mut layer = QuantLinear::new(4, 2, true, 3)
            .unwrap()
            .with_input_quant(Box::new(IntQuant::int8_act()))
            .with_weight_quant(Box::new(IntQuant::new(4)))
            .unwrap()
            .with_bias_quant(Box::new(IntBiasQuant::accumulator_bit_width()), true)
            .unwrap();
        layer.eval();
        let pass = layer.forward_quant(&input()).unwrap();
        // 8 + 4 + ceil(log2 4)
        assert_eq!(pass.bias.unwrap().bit_width(), Some(14.0));
        assert_eq!(layer.bias_mut().quant_bias_bit_width().unwrap(), Some(14.0));
    }

    #[test]
    fn test_bias_quant_without_input_quant_is_error() {
        let mut layer = QuantLinear::new(4, 2, true, 3)
            .unwrap()
            .with_weight_quant(Box::new(IntQuant::new(8)))
            .unwrap()
            .with_bias_quant(Box::new(IntBiasQuant::int32()), false)
            .unwrap();
        assert!(matches!(
            layer.forward(&input()).unwrap_err(),
            Error::Configuration(_)
        ));
    }

    #[test]
    fn test_accumulator_aware_weight_reads_layer_input() {
        let mut layer = QuantLinear::new(4, 3, false, 9)
            .unwrap()
            .with_input_quant(Box::new(IntQuant::uint8_act_asym()))
            .with_weight_quant(Box::new(AccumulatorAwareQuant::new(8, 16)))
            .unwrap();
        // Before any pass the input quantizer reports its nominal metadata
        assert!(layer.quant_weight_scale().unwrap().is_some());
        assert_eq!(layer.quant_input_bit_width(), Some(8.0));
        assert_eq!(layer.is_quant_input_signed(), Some(false));
        let y = layer.forward(&input()).unwrap();
        assert_eq!(y.shape(), &[2, 3]);

        let mut plain = QuantLinear::new(4, 3, false, 9)
            .unwrap()
            .with_weight_quant(Box::new(AccumulatorAwareQuant::new(8, 16)))
            .unwrap();
        assert!(matches!(
            plain.forward(&input()).unwrap_err(),
            Error::Configuration(_)
        ));
    }

    #[test]
    fn test_train_eval_propagates() {
        let mut layer = int8_layer(true);
        assert!(layer.is_training());
        layer.eval();
        assert!(!layer.is_training());
        assert!(!layer.bias().proxy().training());
        assert!(!layer.weight().proxy().training());
        assert!(!layer.input_quant().training());
        let pass = layer.forward_quant(&input()).unwrap();
        assert_eq!(pass.weight.training(), Some(false));
        layer.train();
        assert!(layer.bias().proxy().training());
    }

    #[test]
    fn test_gradient_reaches_weight_through_quantizer() {
        let mut layer = int8_layer(false);
        let mut y = layer.forward(&input()).unwrap();
        backward(&mut y, None);
        let grad = layer.weight().weight().unwrap().grad().unwrap();
        assert_eq!(grad.shape(), &[3, 4]);
        // Column sums of the batch
        assert_abs_diff_eq!(grad[[0, 3]], grad[[2, 3]]);
        assert!(grad.iter().any(|&g| g != 0.0));
    }

    #[test]
    fn test_rejects_empty_dimensions() {
        assert!(QuantLinear::new(0, 3, true, 0).is_err());
    }
}
