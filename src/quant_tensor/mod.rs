//! Quantized values and their metadata
//!
//! Every quantizer call produces a fresh value object carrying the
//! dequantized tensor plus what is needed to recover integer (or minifloat)
//! codes and to export a quantize/dequantize pair:
//! - [`QuantTensor`]: affine integer, per-tensor or per-channel
//! - [`FloatQuantTensor`]: minifloat, per-tensor or per-channel
//! - [`GroupwiseFloatQuantTensor`]: minifloat with per-group scales
//!
//! [`QuantOutput`] unifies them with a passthrough variant for disabled
//! quantizers, so callers can treat quantized and plain layers alike.

mod float;
mod groupwise;
mod int;

pub use float::{FloatFormat, FloatQuantTensor};
pub use groupwise::{expand_groups, grouped_shape, GroupwiseFloatQuantTensor};
pub use int::{dequantize, QuantTensor};
pub(crate) use int::{max_int, min_int};

use crate::{Error, Result, Tensor};
use ndarray::{ArrayD, IxDyn};

/// Integer-domain representation of a quantized value
#[derive(Clone, Debug, PartialEq)]
pub enum IntRepr {
    /// Exact integer codes (raw bit patterns for minifloats)
    Int(ArrayD<i64>),
    /// Codes carried in a float dtype
    Float(ArrayD<f32>),
}

impl IntRepr {
    pub fn is_float(&self) -> bool {
        matches!(self, IntRepr::Float(_))
    }

    /// Codes as `f32` (raw bit patterns are cast, not decoded)
    pub fn to_f32(&self) -> ArrayD<f32> {
        match self {
            IntRepr::Int(codes) => codes.mapv(|c| c as f32),
            IntRepr::Float(codes) => codes.clone(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            IntRepr::Int(codes) => codes.shape(),
            IntRepr::Float(codes) => codes.shape(),
        }
    }
}

pub(crate) fn check_broadcast(param: &ArrayD<f32>, shape: &[usize], what: &str) -> Result<()> {
    if param.ndim() > 0 && param.ndim() != shape.len() {
        return Err(Error::ShapeMismatch {
            expected: shape.to_vec(),
            got: param.shape().to_vec(),
        });
    }
    param
        .broadcast(IxDyn(shape))
        .map(|_| ())
        .ok_or_else(|| {
            tracing::trace!(
                "{what} of shape {:?} does not broadcast to {:?}",
                param.shape(),
                shape
            );
            Error::ShapeMismatch {
                expected: shape.to_vec(),
                got: param.shape().to_vec(),
            }
        })
}

/// Result of a quantizer call
#[derive(Clone, Debug)]
pub enum QuantOutput {
    /// Quantization disabled: the input, unchanged
    Passthrough(Tensor),
    Int(QuantTensor),
    Float(FloatQuantTensor),
    GroupwiseFloat(GroupwiseFloatQuantTensor),
}

impl QuantOutput {
    pub fn value(&self) -> &Tensor {
        match self {
            QuantOutput::Passthrough(t) => t,
            QuantOutput::Int(q) => q.value(),
            QuantOutput::Float(q) => q.value(),
            QuantOutput::GroupwiseFloat(q) => q.value(),
        }
    }

    pub fn into_value(self) -> Tensor {
        match self {
            QuantOutput::Passthrough(t) => t,
            QuantOutput::Int(q) => q.into_value(),
            QuantOutput::Float(q) => q.into_value(),
            QuantOutput::GroupwiseFloat(q) => q.into_value(),
        }
    }

    pub fn is_quantized(&self) -> bool {
        !matches!(self, QuantOutput::Passthrough(_))
    }

    /// Scale; compact per-group for groupwise tensors
    pub fn scale(&self) -> Option<&ArrayD<f32>> {
        match self {
            QuantOutput::Passthrough(_) => None,
            QuantOutput::Int(q) => Some(q.scale()),
            QuantOutput::Float(q) => Some(q.scale()),
            QuantOutput::GroupwiseFloat(q) => Some(q.scale()),
        }
    }

    pub fn zero_point(&self) -> Option<&ArrayD<f32>> {
        match self {
            QuantOutput::Passthrough(_) => None,
            QuantOutput::Int(q) => Some(q.zero_point()),
            QuantOutput::Float(q) => Some(q.zero_point()),
            QuantOutput::GroupwiseFloat(q) => Some(q.zero_point()),
        }
    }

    pub fn bit_width(&self) -> Option<f32> {
        match self {
            QuantOutput::Passthrough(_) => None,
            QuantOutput::Int(q) => Some(q.bit_width()),
            QuantOutput::Float(q) => Some(q.bit_width()),
            QuantOutput::GroupwiseFloat(q) => Some(q.bit_width()),
        }
    }

    pub fn signed(&self) -> Option<bool> {
        match self {
            QuantOutput::Passthrough(_) => None,
            QuantOutput::Int(q) => Some(q.signed()),
            QuantOutput::Float(q) => Some(q.signed()),
            QuantOutput::GroupwiseFloat(q) => Some(q.signed()),
        }
    }

    pub fn training(&self) -> Option<bool> {
        match self {
            QuantOutput::Passthrough(_) => None,
            QuantOutput::Int(q) => Some(q.training()),
            QuantOutput::Float(q) => Some(q.training()),
            QuantOutput::GroupwiseFloat(q) => Some(q.training()),
        }
    }

    pub fn shared_bit_width(&self) -> Option<f32> {
        match self {
            QuantOutput::Int(q) => q.shared_bit_width(),
            _ => None,
        }
    }

    /// Integer-domain codes; `None` when quantization is disabled
    pub fn int(&self, float_datatype: bool) -> Result<Option<IntRepr>> {
        Ok(match self {
            QuantOutput::Passthrough(_) => None,
            QuantOutput::Int(q) => Some(q.int(float_datatype)),
            QuantOutput::Float(q) => Some(q.int(float_datatype)),
            QuantOutput::GroupwiseFloat(q) => Some(q.int(float_datatype)?),
        })
    }

    /// Inverse of [`QuantOutput::int`]
    pub fn dequantize(&self, codes: &IntRepr) -> Result<ArrayD<f32>> {
        match self {
            QuantOutput::Passthrough(_) => Err(Error::InvalidParameter(
                "cannot dequantize codes of a passthrough tensor".to_string(),
            )),
            QuantOutput::Int(q) => q.dequantize(codes),
            QuantOutput::Float(q) => q.dequantize(codes),
            QuantOutput::GroupwiseFloat(q) => q.dequantize(codes),
        }
    }

    pub fn as_int(&self) -> Option<&QuantTensor> {
        match self {
            QuantOutput::Int(q) => Some(q),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<&FloatQuantTensor> {
        match self {
            QuantOutput::Float(q) => Some(q),
            _ => None,
        }
    }

    pub fn as_groupwise_float(&self) -> Option<&GroupwiseFloatQuantTensor> {
        match self {
            QuantOutput::GroupwiseFloat(q) => Some(q),
            _ => None,
        }
    }

    /// Drop autograd history
    pub fn detach(&self) -> Self {
        match self {
            QuantOutput::Passthrough(t) => QuantOutput::Passthrough(t.detach()),
            QuantOutput::Int(q) => QuantOutput::Int(q.detach()),
            QuantOutput::Float(q) => QuantOutput::Float(q.detach()),
            QuantOutput::GroupwiseFloat(q) => QuantOutput::GroupwiseFloat(q.detach()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr0;

    #[test]
    fn test_passthrough_sentinels() {
        let t = Tensor::from_vec(vec![1.0, 2.0], false);
        let out = QuantOutput::Passthrough(t);
        assert!(!out.is_quantized());
        assert!(out.scale().is_none());
        assert!(out.zero_point().is_none());
        assert!(out.bit_width().is_none());
        assert!(out.signed().is_none());
        assert!(out.int(false).unwrap().is_none());
        assert!(out.dequantize(&IntRepr::Float(ArrayD::zeros(IxDyn(&[2])))).is_err());
        assert_eq!(out.value().len(), 2);
    }

    #[test]
    fn test_int_variant_forwards_metadata() {
        let qt = QuantTensor::new(
            Tensor::from_vec(vec![0.5, -0.5], false),
            arr0(0.5f32).into_dyn(),
            arr0(0.0f32).into_dyn(),
            4.0,
            true,
            false,
            true,
        )
        .unwrap()
        .with_shared_bit_width(Some(4.0));
        let out = QuantOutput::Int(qt);
        assert!(out.is_quantized());
        assert_eq!(out.bit_width(), Some(4.0));
        assert_eq!(out.signed(), Some(true));
        assert_eq!(out.training(), Some(true));
        assert_eq!(out.shared_bit_width(), Some(4.0));
        assert!(out.as_int().is_some());
        assert!(out.as_float().is_none());
    }

    #[test]
    fn test_check_broadcast_rank_rules() {
        let scalar = arr0(1.0f32).into_dyn();
        assert!(check_broadcast(&scalar, &[3, 4], "scale").is_ok());
        let col = ArrayD::ones(IxDyn(&[3, 1]));
        assert!(check_broadcast(&col, &[3, 4], "scale").is_ok());
        let vec = ArrayD::ones(IxDyn(&[4]));
        assert!(check_broadcast(&vec, &[3, 4], "scale").is_err());
    }
}
