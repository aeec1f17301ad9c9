//! Quantization strategies
//!
//! Pluggable algorithms injected into proxies:
//! - Affine integer quantization (per-tensor / per-channel, symmetric or affine)
//! - Accumulator-aware weight quantization
//! - Minifloat quantization (per-tensor / per-channel / per-group)
//! - Bias quantization on the accumulator scale
//!
//! Each strategy is a tree of submodules; parameter-holding submodules accept
//! a per-call subtensor slice.

mod accumulator;
mod bias;
mod float_quant;
mod granularity;
mod int_quant;
mod module;
mod none;
mod scaling;
mod strategy;

pub use accumulator::{l1_budget, max_input_magnitude, AccumulatorAwareQuant};
pub use bias::IntBiasQuant;
pub use float_quant::{FloatQuant, GroupwiseFloatQuant};
pub use granularity::{reduce, QuantGranularity, StatsOp};
pub use int_quant::{IntQuant, RoundingMode};
pub use module::{discover_sliceable, module_at, ModulePath, QuantModule, SubtensorSliceable};
pub use none::NoneQuant;
pub use scaling::{BitWidthImpl, ScalingImpl, ScalingStats, ZeroPointImpl, MIN_SCALE};
pub use strategy::{QuantArgs, QuantStrategy};
