//! Quantized weights in SafeTensors

use super::record::QuantDtype;
use crate::nn::QuantLinear;
use crate::quant_tensor::{IntRepr, QuantOutput};
use crate::{Error, Result};
use ndarray::ArrayD;
use safetensors::tensor::{Dtype, TensorView};
use std::collections::HashMap;
use std::path::Path;

pub const CODES: &str = "weight.codes";
pub const SCALE: &str = "weight.scale";
pub const ZERO_POINT: &str = "weight.zero_point";

fn f32_bytes(a: &ArrayD<f32>) -> Vec<u8> {
    let data: Vec<f32> = a.iter().copied().collect();
    bytemuck::cast_slice(&data).to_vec()
}

/// Integer codes as `I32`; FP8 bit patterns as their native dtype
fn code_bytes(codes: IntRepr, fp8: Option<QuantDtype>) -> (Dtype, Vec<u8>) {
    let codes = match codes {
        IntRepr::Int(codes) => codes,
        IntRepr::Float(codes) => codes.mapv(|c| c as i64),
    };
    match fp8 {
        Some(QuantDtype::Float8E4m3fn) => {
            (Dtype::F8_E4M3, codes.iter().map(|&c| c as u8).collect())
        }
        Some(QuantDtype::Float8E5m2) => (Dtype::F8_E5M2, codes.iter().map(|&c| c as u8).collect()),
        _ => {
            let data: Vec<i32> = codes.iter().map(|&c| c as i32).collect();
            (Dtype::I32, bytemuck::cast_slice(&data).to_vec())
        }
    }
}

/// Write the layer's quantized weight: codes, scale, zero-point and metadata
pub fn save_quant_weights(layer: &mut QuantLinear, path: impl AsRef<Path>) -> Result<()> {
    let out = layer.quant_weight(None, None)?;
    let mut metadata = HashMap::new();
    let (codes, scale, zero_point, fp8) = match &out {
        QuantOutput::Passthrough(_) => {
            return Err(Error::Export(
                "weight quantization is disabled, nothing to export".to_string(),
            ))
        }
        QuantOutput::Int(qt) => {
            metadata.insert("kind".to_string(), "int".to_string());
            metadata.insert("narrow_range".to_string(), qt.narrow_range().to_string());
            (qt.int(false), qt.scale().clone(), qt.zero_point().clone(), None)
        }
        QuantOutput::Float(ft) => {
            metadata.insert("kind".to_string(), "float".to_string());
            let fp8 = QuantDtype::fp8(ft.format(), ft.signed());
            (ft.int(false), ft.scale().clone(), ft.zero_point().clone(), fp8)
        }
        QuantOutput::GroupwiseFloat(gt) => {
            metadata.insert("kind".to_string(), "groupwise_float".to_string());
            metadata.insert("group_size".to_string(), gt.group_size().to_string());
            metadata.insert("group_dim".to_string(), gt.group_dim().to_string());
            let fp8 = QuantDtype::fp8(gt.format(), gt.signed());
            (gt.int(false)?, gt.scale().clone(), gt.zero_point().clone(), fp8)
        }
    };
    if let Some(bits) = out.bit_width() {
        metadata.insert("bit_width".to_string(), bits.to_string());
    }
    if let Some(signed) = out.signed() {
        metadata.insert("signed".to_string(), signed.to_string());
    }

    let codes_shape = codes.shape().to_vec();
    let (codes_dtype, codes_bytes) = code_bytes(codes, fp8);
    let tensor_data = [
        (CODES, codes_dtype, codes_shape, codes_bytes),
        (SCALE, Dtype::F32, scale.shape().to_vec(), f32_bytes(&scale)),
        (ZERO_POINT, Dtype::F32, zero_point.shape().to_vec(), f32_bytes(&zero_point)),
    ];
    let views = tensor_data
        .iter()
        .map(|(name, dtype, shape, bytes)| {
            TensorView::new(*dtype, shape.clone(), bytes)
                .map(|view| (*name, view))
                .map_err(|e| Error::Serialization(format!("Invalid tensor {name}: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let bytes = safetensors::serialize(views, Some(metadata))
        .map_err(|e| Error::Serialization(format!("SafeTensors serialization failed: {e}")))?;
    std::fs::write(path, bytes)?;

    tracing::debug!(codes = ?codes_dtype, "saved quantized weight");
    Ok(())
}
