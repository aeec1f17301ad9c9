//! Quantized layers

mod linear;

pub use linear::{LinearPass, QuantLinear};
