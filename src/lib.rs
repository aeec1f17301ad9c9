//! # Cuantizar: Quantization-Aware Layers
//!
//! Cuantizar attaches pluggable quantizers to the parameters and inputs of
//! neural-network layers and emits export records for the quantized graph.
//!
//! ## Architecture
//!
//! - **autograd**: Tensors with a straight-through gradient path
//! - **quant_tensor**: Quantized values (integer, minifloat, groupwise minifloat)
//! - **quant**: Quantization strategies and their submodule trees
//! - **proxy**: Weight, bias and input quantizer proxies
//! - **mixin**: Quantized weight and bias parameters with subtensor slicing
//! - **nn**: Quantized layers
//! - **config**: Declarative YAML layer specifications
//! - **export**: QCDQ/QONNX records, graphs and quantized weight files

pub mod autograd;
pub mod config;
pub mod export;
pub mod mixin;
pub mod nn;
pub mod proxy;
pub mod quant;
pub mod quant_tensor;

pub mod error;

// Re-export commonly used types
pub use autograd::{backward, Context, Device, SubtensorSlice, Tensor};
pub use error::{Error, Result};
pub use nn::QuantLinear;
pub use quant_tensor::{QuantOutput, QuantTensor};
