//! Accumulator-aware weight quantization
//!
//! Guarantees that a dot product of quantized inputs with quantized weights
//! fits a `P`-bit signed accumulator. For an `N`-bit input the largest input
//! magnitude is `2^(N-1)` (signed) or `2^N - 1` (unsigned), so each output
//! channel's integer weights must satisfy
//!
//! `Σ|q| ≤ T = (2^(P-1) - 1) / max|input|`.
//!
//! With round-toward-zero `|q| ≤ |w| / s`, hence choosing
//! `s ≥ ‖w‖₁ / T` per channel is sufficient.

use super::granularity::{reduce, QuantGranularity, StatsOp};
use super::int_quant::{IntQuant, RoundingMode};
use super::module::QuantModule;
use super::scaling::{ScalingImpl, ScalingStats, MIN_SCALE};
use super::strategy::{QuantArgs, QuantStrategy};
use crate::autograd::Device;
use crate::quant_tensor::{check_broadcast, max_int, QuantOutput};
use crate::{Error, Result, Tensor};

/// Largest magnitude an `N`-bit input code can take
pub fn max_input_magnitude(input_bit_width: f32, input_is_signed: bool) -> f64 {
    if input_is_signed {
        2f64.powf(input_bit_width as f64 - 1.0)
    } else {
        2f64.powf(input_bit_width as f64) - 1.0
    }
}

/// L1 budget of one output channel's integer weights
pub fn l1_budget(accumulator_bit_width: u32, input_bit_width: f32, input_is_signed: bool) -> f64 {
    (2f64.powi(accumulator_bit_width as i32 - 1) - 1.0)
        / max_input_magnitude(input_bit_width, input_is_signed)
}

/// Per-channel signed narrow-range weight quantizer bounded by accumulator width
#[derive(Clone, Debug)]
pub struct AccumulatorAwareQuant {
    inner: IntQuant,
    accumulator_bit_width: u32,
    axis: usize,
}

impl AccumulatorAwareQuant {
    pub fn new(bit_width: u32, accumulator_bit_width: u32) -> Self {
        Self::with_axis(bit_width, accumulator_bit_width, 0)
    }

    /// `axis` indexes output channels
    pub fn with_axis(bit_width: u32, accumulator_bit_width: u32, axis: usize) -> Self {
        let inner = IntQuant::new(bit_width)
            .with_narrow_range(true)
            .with_rounding(RoundingMode::TowardZero)
            .with_scaling(ScalingImpl::stats(
                ScalingStats::MaxAbs,
                QuantGranularity::PerChannel { axis },
            ));
        Self {
            inner,
            accumulator_bit_width,
            axis,
        }
    }

    pub fn accumulator_bit_width(&self) -> u32 {
        self.accumulator_bit_width
    }

    pub fn axis(&self) -> usize {
        self.axis
    }
}

impl QuantModule for AccumulatorAwareQuant {
    fn name(&self) -> &str {
        "accumulator_aware_quant"
    }

    fn children_mut(&mut self) -> Vec<&mut dyn QuantModule> {
        vec![&mut self.inner as &mut dyn QuantModule]
    }
}

impl QuantStrategy for AccumulatorAwareQuant {
    fn is_narrow_range(&self) -> Option<bool> {
        Some(true)
    }

    fn is_signed(&self) -> Option<bool> {
        Some(true)
    }

    fn requires_quant_input(&self) -> bool {
        true
    }

    fn requires_input_bit_width(&self) -> bool {
        true
    }

    fn bit_width_hint(&self) -> Option<f32> {
        self.inner.bit_width_hint()
    }

    fn init_tensor_quant(&mut self, tensor: &Tensor) -> Result<()> {
        if self.axis >= tensor.ndim() {
            return Err(Error::InvalidParameter(format!(
                "channel axis {} out of range for rank {}",
                self.axis,
                tensor.ndim()
            )));
        }
        self.inner.init_tensor_quant(tensor)
    }

    fn device(&self) -> Device {
        self.inner.device()
    }

    fn to_device(&mut self, device: Device) {
        self.inner.to_device(device);
    }

    fn forward(&mut self, x: &Tensor, args: &QuantArgs) -> Result<QuantOutput> {
        let (input_bits, input_signed) = match (args.input_bit_width, args.input_is_signed) {
            (Some(bits), Some(signed)) => (bits, signed),
            _ => {
                return Err(Error::Configuration(
                    "accumulator-aware quantization requires the input bit-width and signedness"
                        .to_string(),
                ))
            }
        };
        let budget = l1_budget(self.accumulator_bit_width, input_bits, input_signed) as f32;
        if !(budget > 0.0) {
            return Err(Error::InvalidParameter(format!(
                "accumulator of {} bits cannot hold {input_bits}-bit inputs",
                self.accumulator_bit_width
            )));
        }

        let bits = self.inner.bit_width_impl().bit_width(args.shared_bit_width);
        let hi = max_int(bits, true, true) as f32;
        let base = self.inner.scaling().scale(x.data(), hi)?;
        let l1 = reduce(
            x.data(),
            QuantGranularity::PerChannel { axis: self.axis },
            StatsOp::AbsSum,
        )?;
        check_broadcast(&base, l1.shape(), "scale")?;

        let mut scale = l1.mapv(|n| (n / budget).max(MIN_SCALE));
        scale.zip_mut_with(&base, |s, &b| *s = s.max(b));

        Ok(QuantOutput::Int(self.inner.quantize(x, args, Some(scale))?))
    }

    fn as_module_mut(&mut self) -> &mut dyn QuantModule {
        self
    }
}
