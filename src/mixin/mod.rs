//! Quantized parameters for layers
//!
//! Layers hold a [`QuantWeight`] and a [`QuantBias`] as fields and delegate
//! to them:
//! - registration binds the quantizer to the parameter's shape and device
//! - `quant_weight` supports quantizing a subtensor region
//! - bias metadata can be answered from an inference-time cache

mod bias;
mod slice;
mod weight;

#[cfg(test)]
mod tests;

pub use bias::QuantBias;
pub use slice::SliceScope;
pub use weight::{QuantWeight, QuantWeightArgs};
