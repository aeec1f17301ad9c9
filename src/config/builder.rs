//! Build quantizers and layers from configuration

use super::schema::{LayerQuantSpec, QuantizerSpec, ScalingSpec, ZeroPointSpec};
use super::validate::{resolve_format, validate_spec};
use crate::error::{Error, Result};
use crate::nn::QuantLinear;
use crate::quant::{
    AccumulatorAwareQuant, BitWidthImpl, FloatQuant, GroupwiseFloatQuant, IntBiasQuant, IntQuant,
    NoneQuant, QuantGranularity, QuantStrategy, ScalingImpl, ZeroPointImpl,
};

fn build_scaling(spec: ScalingSpec, granularity: QuantGranularity) -> ScalingImpl {
    match spec {
        ScalingSpec::Stats { stats } => ScalingImpl::stats(stats, granularity),
        ScalingSpec::Parameter { stats } => ScalingImpl::parameter(stats, granularity),
        ScalingSpec::Const { value } => ScalingImpl::constant(value),
    }
}

fn build_zero_point(spec: ZeroPointSpec, granularity: QuantGranularity) -> ZeroPointImpl {
    match spec {
        ZeroPointSpec::Zero => ZeroPointImpl::zero(),
        ZeroPointSpec::Stats => ZeroPointImpl::stats(granularity),
        ZeroPointSpec::Parameter => ZeroPointImpl::parameter(granularity),
    }
}

/// Build a quantization strategy from configuration
pub fn build_quantizer(spec: &QuantizerSpec) -> Result<Box<dyn QuantStrategy>> {
    let invalid =
        |e: super::ValidationError| Error::Configuration(format!("Invalid quantizer: {e}"));
    match spec {
        QuantizerSpec::None => Ok(Box::new(NoneQuant::new())),
        QuantizerSpec::Int(int) => {
            let granularity: QuantGranularity = int.granularity.into();
            let bit_width = if int.shared_bit_width {
                BitWidthImpl::Shared {
                    default: int.bit_width,
                }
            } else {
                BitWidthImpl::Const(int.bit_width)
            };
            Ok(Box::new(
                IntQuant::new(int.bit_width)
                    .with_signed(int.signed)
                    .with_narrow_range(int.narrow_range)
                    .with_rounding(int.rounding)
                    .with_scaling(build_scaling(int.scaling, granularity))
                    .with_zero_point(build_zero_point(int.zero_point, granularity))
                    .with_bit_width(bit_width),
            ))
        }
        QuantizerSpec::AccumulatorAware(a2q) => Ok(Box::new(AccumulatorAwareQuant::with_axis(
            a2q.bit_width,
            a2q.accumulator_bit_width,
            a2q.axis,
        ))),
        QuantizerSpec::Float(float) => {
            let format =
                resolve_format(float.format, float.custom_format.as_ref()).map_err(invalid)?;
            Ok(Box::new(
                FloatQuant::new(format)
                    .with_signed(float.signed)
                    .with_scaling(build_scaling(float.scaling, float.granularity.into())),
            ))
        }
        QuantizerSpec::GroupwiseFloat(group) => {
            let format =
                resolve_format(group.format, group.custom_format.as_ref()).map_err(invalid)?;
            let quant = GroupwiseFloatQuant::new(format, group.group_size, group.group_dim);
            Ok(Box::new(if group.parameter_scaling {
                quant.with_parameter_scaling()
            } else {
                quant
            }))
        }
        QuantizerSpec::IntBias(bias) => {
            let quant = match bias.bit_width {
                Some(bits) => IntBiasQuant::new(bits),
                None => IntBiasQuant::accumulator_bit_width(),
            };
            Ok(Box::new(quant.with_narrow_range(bias.narrow_range)))
        }
    }
}

/// Build a quantized linear layer from a validated specification
pub fn build_linear(spec: &LayerQuantSpec) -> Result<QuantLinear> {
    validate_spec(spec).map_err(|e| Error::Configuration(format!("Invalid spec: {e}")))?;

    let layer = QuantLinear::new(spec.in_features, spec.out_features, spec.bias, spec.seed)?
        .with_input_quant(build_quantizer(&spec.input_quant)?)
        .with_weight_quant(build_quantizer(&spec.weight_quant)?)?
        .with_bias_quant(build_quantizer(&spec.bias_quant)?, spec.cache_inference_bias)?;

    tracing::debug!(
        in_features = spec.in_features,
        out_features = spec.out_features,
        input = spec.input_quant.kind(),
        weight = spec.weight_quant.kind(),
        bias = spec.bias_quant.kind(),
        "built quant linear"
    );
    Ok(layer)
}
