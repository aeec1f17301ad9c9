//! Inference-time snapshot of bias quantization metadata

use crate::quant_tensor::QuantOutput;
use ndarray::ArrayD;

/// Metadata of the last bias quantization run in inference mode
#[derive(Clone, Debug, PartialEq)]
pub struct CachedQuantMetadata {
    pub scale: ArrayD<f32>,
    pub zero_point: ArrayD<f32>,
    pub bit_width: f32,
    pub signed: bool,
}

impl CachedQuantMetadata {
    /// `None` for a passthrough output
    pub fn from_output(output: &QuantOutput) -> Option<Self> {
        Some(Self {
            scale: output.scale()?.clone(),
            zero_point: output.zero_point()?.clone(),
            bit_width: output.bit_width()?,
            signed: output.signed()?,
        })
    }
}
