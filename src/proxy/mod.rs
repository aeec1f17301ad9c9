//! Quantizer proxies
//!
//! A proxy owns an injected [`QuantStrategy`](crate::quant::QuantStrategy)
//! and adapts it to one role in a layer:
//! - [`WeightQuantProxy`]: weights, optionally driven by input metadata
//! - [`BiasQuantProxy`]: biases, with the inference-time metadata cache
//! - [`ActQuantProxy`]: layer inputs; the source of input metadata

mod act;
mod bias;
mod cache;
mod weight;


pub use act::ActQuantProxy;
pub use bias::BiasQuantProxy;
pub use cache::CachedQuantMetadata;
pub use weight::WeightQuantProxy;

/// Quantization metadata of a layer's input, as recorded by the layer
pub trait QuantInputSource {
    fn quant_input_bit_width(&self) -> Option<f32>;

    fn is_quant_input_signed(&self) -> Option<bool>;
}
