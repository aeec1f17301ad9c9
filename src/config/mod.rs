//! Declarative YAML configuration
//!
//! A [`LayerQuantSpec`] names a linear layer and the quantizers bound to its
//! input, weight and bias.
//!
//! # Example
//!
//! ```yaml
//! in_features: 64
//! out_features: 32
//! cache_inference_bias: true
//!
//! input_quant:
//!   kind: int
//!   bit_width: 8
//!
//! weight_quant:
//!   kind: int
//!   narrow_range: true
//!   granularity: { type: per_channel, axis: 0 }
//!
//! bias_quant:
//!   kind: int_bias
//!   bit_width: 32
//! ```

mod builder;
mod load;
mod schema;
mod validate;

#[cfg(test)]
mod tests;

pub use builder::{build_linear, build_quantizer};
pub use load::{load_spec, parse_spec};
pub use schema::{
    AccumulatorAwareSpec, FloatPreset, FloatQuantSpec, GranularitySpec, GroupwiseFloatSpec,
    IntBiasSpec, IntQuantSpec, LayerQuantSpec, QuantizerSpec, ScalingSpec, ZeroPointSpec,
};
pub use validate::{resolve_format, validate_spec, ValidationError};
