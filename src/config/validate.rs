//! Layer specification validation

use super::schema::{FloatPreset, GranularitySpec, LayerQuantSpec, QuantizerSpec, ScalingSpec};
use crate::quant_tensor::FloatFormat;

/// Validation error type
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid layer dimensions: {0}x{1} (must be > 0)")]
    InvalidDimensions(usize, usize),

    #[error("Invalid {role} bit-width: {bits} (must be in 2..=32)")]
    InvalidBitWidth { role: &'static str, bits: u32 },

    #[error("Invalid accumulator bit-width: {accumulator} (must exceed weight bit-width {bits} and be <= 64)")]
    InvalidAccumulator { bits: u32, accumulator: u32 },

    #[error("Invalid {role} axis: {axis} (tensor has {ndim} dimensions)")]
    AxisOutOfRange {
        role: &'static str,
        axis: usize,
        ndim: usize,
    },

    #[error("Invalid group size {size}: extent {extent} of dim {dim} is not a positive multiple")]
    InvalidGroupSize { size: usize, dim: usize, extent: usize },

    #[error("Invalid constant scale: {0} (must be finite and > 0)")]
    InvalidConstScale(f32),

    #[error("Custom float format requires custom_format")]
    MissingFloatFormat,

    #[error("Invalid float format: {0}")]
    InvalidFloatFormat(String),

    #[error("Quantizer '{kind}' cannot be used as the {role} quantizer")]
    UnsupportedRole { kind: &'static str, role: &'static str },

    #[error("Quantizer '{0}' needs an input quantizer")]
    RequiresInputQuant(&'static str),

    #[error("Bias quantizer needs a weight quantizer")]
    RequiresWeightQuant,
}

/// Resolve a preset or custom float format
pub fn resolve_format(
    preset: FloatPreset,
    custom: Option<&FloatFormat>,
) -> Result<FloatFormat, ValidationError> {
    let format = match preset {
        FloatPreset::E4m3 => FloatFormat::e4m3(),
        FloatPreset::E5m2 => FloatFormat::e5m2(),
        FloatPreset::Custom => custom.cloned().ok_or(ValidationError::MissingFloatFormat)?,
    };
    format
        .validate()
        .map_err(|e| ValidationError::InvalidFloatFormat(e.to_string()))?;
    Ok(format)
}

fn check_bits(role: &'static str, bits: u32) -> Result<(), ValidationError> {
    if !(2..=32).contains(&bits) {
        return Err(ValidationError::InvalidBitWidth { role, bits });
    }
    Ok(())
}

fn check_axis(role: &'static str, granularity: GranularitySpec) -> Result<(), ValidationError> {
    if let GranularitySpec::PerChannel { axis } = granularity {
        if axis >= 2 {
            return Err(ValidationError::AxisOutOfRange { role, axis, ndim: 2 });
        }
    }
    Ok(())
}

fn check_scaling(scaling: ScalingSpec) -> Result<(), ValidationError> {
    if let ScalingSpec::Const { value } = scaling {
        if !value.is_finite() || value <= 0.0 {
            return Err(ValidationError::InvalidConstScale(value));
        }
    }
    Ok(())
}

/// Quantizers valid for input and weight tensors; `extents` is the 2-D shape
/// the quantizer sees, with the input's batch axis left unknown
fn check_tensor_quantizer(
    role: &'static str,
    spec: &QuantizerSpec,
    extents: [Option<usize>; 2],
) -> Result<(), ValidationError> {
    match spec {
        QuantizerSpec::None => Ok(()),
        QuantizerSpec::Int(int) => {
            check_bits(role, int.bit_width)?;
            check_axis(role, int.granularity)?;
            check_scaling(int.scaling)
        }
        QuantizerSpec::AccumulatorAware(a2q) => {
            if role != "weight" {
                return Err(ValidationError::UnsupportedRole {
                    kind: spec.kind(),
                    role,
                });
            }
            check_bits(role, a2q.bit_width)?;
            if a2q.accumulator_bit_width <= a2q.bit_width || a2q.accumulator_bit_width > 64 {
                return Err(ValidationError::InvalidAccumulator {
                    bits: a2q.bit_width,
                    accumulator: a2q.accumulator_bit_width,
                });
            }
            if a2q.axis >= 2 {
                return Err(ValidationError::AxisOutOfRange {
                    role,
                    axis: a2q.axis,
                    ndim: 2,
                });
            }
            Ok(())
        }
        QuantizerSpec::Float(float) => {
            resolve_format(float.format, float.custom_format.as_ref())?;
            check_axis(role, float.granularity)?;
            check_scaling(float.scaling)
        }
        QuantizerSpec::GroupwiseFloat(group) => {
            resolve_format(group.format, group.custom_format.as_ref())?;
            if group.group_dim >= 2 {
                return Err(ValidationError::AxisOutOfRange {
                    role,
                    axis: group.group_dim,
                    ndim: 2,
                });
            }
            let extent = extents[group.group_dim];
            let aligned =
                group.group_size > 0 && extent.map_or(true, |e| e % group.group_size == 0);
            if !aligned {
                return Err(ValidationError::InvalidGroupSize {
                    size: group.group_size,
                    dim: group.group_dim,
                    extent: extent.unwrap_or(0),
                });
            }
            Ok(())
        }
        QuantizerSpec::IntBias(_) => Err(ValidationError::UnsupportedRole {
            kind: spec.kind(),
            role,
        }),
    }
}

/// Validate a layer specification
///
/// Checks:
/// - Dimensions are positive
/// - Bit-widths, axes and group sizes fit the layer's tensors
/// - Every quantizer can get the metadata it depends on
pub fn validate_spec(spec: &LayerQuantSpec) -> Result<(), ValidationError> {
    if spec.in_features == 0 || spec.out_features == 0 {
        return Err(ValidationError::InvalidDimensions(
            spec.in_features,
            spec.out_features,
        ));
    }

    check_tensor_quantizer("input", &spec.input_quant, [None, Some(spec.in_features)])?;
    check_tensor_quantizer(
        "weight",
        &spec.weight_quant,
        [Some(spec.out_features), Some(spec.in_features)],
    )?;

    if matches!(spec.weight_quant, QuantizerSpec::AccumulatorAware(_)) && spec.input_quant.is_none()
    {
        return Err(ValidationError::RequiresInputQuant(spec.weight_quant.kind()));
    }

    match &spec.bias_quant {
        QuantizerSpec::None => {}
        QuantizerSpec::IntBias(bias) => {
            if let Some(bits) = bias.bit_width {
                check_bits("bias", bits)?;
            }
            if spec.input_quant.is_none() {
                return Err(ValidationError::RequiresInputQuant(spec.bias_quant.kind()));
            }
            if spec.weight_quant.is_none() {
                return Err(ValidationError::RequiresWeightQuant);
            }
        }
        other => {
            return Err(ValidationError::UnsupportedRole {
                kind: other.kind(),
                role: "bias",
            })
        }
    }

    Ok(())
}
