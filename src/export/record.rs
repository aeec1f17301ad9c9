//! Quantize/dequantize node records
//!
//! A record is the fixed-schema description of how one quantized tensor is
//! lowered to an interchange graph. [`QuantNodeRecord::execute`] evaluates
//! the emitted chain so exports can be checked against the quantizer that
//! produced them.

use super::format::{ExportConfig, ExportFormat};
use crate::quant_tensor::{
    expand_groups, max_int, min_int, FloatFormat, FloatQuantTensor, GroupwiseFloatQuantTensor,
    QuantOutput, QuantTensor,
};
use crate::{Error, Result};
use ndarray::{arr0, Array1, ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

/// Largest disagreement, in quantization steps, between an executed record
/// and the value the quantizer produced
pub const INT_TOLERANCE: f32 = 1.0;

/// Output element type of `QuantizeLinear`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantDtype {
    Int8,
    Uint8,
    Int32,
    Float8E4m3fn,
    Float8E5m2,
}

impl QuantDtype {
    /// The FP8 element type a minifloat format maps to, if any
    pub fn fp8(format: &FloatFormat, signed: bool) -> Option<Self> {
        if !signed {
            None
        } else if *format == FloatFormat::e4m3() {
            Some(QuantDtype::Float8E4m3fn)
        } else if *format == FloatFormat::e5m2() {
            Some(QuantDtype::Float8E5m2)
        } else {
            None
        }
    }

    /// Saturation range of integer types
    pub fn int_range(self) -> Option<(f32, f32)> {
        match self {
            QuantDtype::Int8 => Some((-128.0, 127.0)),
            QuantDtype::Uint8 => Some((0.0, 255.0)),
            QuantDtype::Int32 => Some((i32::MIN as f32, i32::MAX as f32)),
            QuantDtype::Float8E4m3fn | QuantDtype::Float8E5m2 => None,
        }
    }

    pub fn float_format(self) -> Option<FloatFormat> {
        match self {
            QuantDtype::Float8E4m3fn => Some(FloatFormat::e4m3()),
            QuantDtype::Float8E5m2 => Some(FloatFormat::e5m2()),
            _ => None,
        }
    }
}

/// One operator of an exported chain
///
/// QCDQ parameters are scalars, 1-D per `axis`, or blocked (`block_size`
/// elements of `axis` per entry). QONNX parameters keep the tensor's rank and
/// broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum QuantNode {
    QuantizeLinear {
        scale: ArrayD<f32>,
        zero_point: ArrayD<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        axis: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        block_size: Option<usize>,
        output_dtype: QuantDtype,
    },
    Clip {
        min: f32,
        max: f32,
    },
    DequantizeLinear {
        scale: ArrayD<f32>,
        zero_point: ArrayD<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        axis: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        block_size: Option<usize>,
    },
    Quant {
        scale: ArrayD<f32>,
        zero_point: ArrayD<f32>,
        bit_width: f32,
        signed: bool,
        narrow: bool,
    },
    FloatQuant {
        scale: ArrayD<f32>,
        format: FloatFormat,
        signed: bool,
    },
}

/// Broadcast a node parameter to `shape`
fn expand_param(
    param: &ArrayD<f32>,
    axis: Option<usize>,
    block_size: Option<usize>,
    shape: &[usize],
) -> Result<ArrayD<f32>> {
    let mismatch = || Error::ShapeMismatch {
        expected: shape.to_vec(),
        got: param.shape().to_vec(),
    };
    match (axis, block_size) {
        (Some(axis), Some(block_size)) => expand_groups(param, shape, block_size, axis),
        (Some(axis), None) if param.ndim() == 1 => {
            if axis >= shape.len() {
                return Err(mismatch());
            }
            let mut layout = vec![1; shape.len()];
            layout[axis] = param.len();
            let reshaped = param
                .clone()
                .into_shape_with_order(IxDyn(&layout))
                .map_err(|_| mismatch())?;
            let expanded = reshaped.broadcast(IxDyn(shape)).map(|v| v.to_owned());
            expanded.ok_or_else(mismatch)
        }
        _ => {
            let expanded = param.broadcast(IxDyn(shape)).map(|v| v.to_owned());
            expanded.ok_or_else(mismatch)
        }
    }
}

impl QuantNode {
    /// Reference semantics of the operator
    pub fn apply(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        match self {
            QuantNode::QuantizeLinear {
                scale,
                zero_point,
                axis,
                block_size,
                output_dtype,
            } => {
                let s = expand_param(scale, *axis, *block_size, x.shape())?;
                let scaled = x / &s;
                if let Some((lo, hi)) = output_dtype.int_range() {
                    let z = expand_param(zero_point, *axis, *block_size, x.shape())?;
                    Ok((scaled.mapv(f32::round_ties_even) + &z).mapv(|v| v.clamp(lo, hi)))
                } else if let Some(format) = output_dtype.float_format() {
                    Ok(scaled.mapv(|v| format.round(v, true)))
                } else {
                    Err(Error::Export(format!("unsupported output dtype {output_dtype:?}")))
                }
            }
            QuantNode::Clip { min, max } => Ok(x.mapv(|v| v.clamp(*min, *max))),
            QuantNode::DequantizeLinear {
                scale,
                zero_point,
                axis,
                block_size,
            } => {
                let s = expand_param(scale, *axis, *block_size, x.shape())?;
                let z = expand_param(zero_point, *axis, *block_size, x.shape())?;
                Ok((x - &z) * &s)
            }
            QuantNode::Quant {
                scale,
                zero_point,
                bit_width,
                signed,
                narrow,
            } => {
                let lo = min_int(*bit_width, *signed, *narrow) as f32;
                let hi = max_int(*bit_width, *signed, *narrow) as f32;
                let s = expand_param(scale, None, None, x.shape())?;
                let z = expand_param(zero_point, None, None, x.shape())?;
                let codes = (x / &s + &z).mapv(|v| v.round_ties_even().clamp(lo, hi));
                Ok((codes - &z) * &s)
            }
            QuantNode::FloatQuant {
                scale,
                format,
                signed,
            } => {
                let s = expand_param(scale, None, None, x.shape())?;
                Ok((x / &s).mapv(|v| format.round(v, *signed)) * &s)
            }
        }
    }
}

/// Scalar, or 1-D along the single axis a rank-preserving parameter varies on
fn axis_layout(
    scale: &ArrayD<f32>,
    zero_point: &ArrayD<f32>,
) -> Result<(ArrayD<f32>, ArrayD<f32>, Option<usize>)> {
    if scale.len() == 1 && zero_point.len() == 1 {
        let s = scale.iter().copied().sum::<f32>();
        let z = zero_point.iter().copied().sum::<f32>();
        return Ok((arr0(s).into_dyn(), arr0(z).into_dyn(), None));
    }
    let varying: Vec<usize> = scale
        .shape()
        .iter()
        .enumerate()
        .filter(|(_, n)| **n > 1)
        .map(|(i, _)| i)
        .collect();
    let &[axis] = varying.as_slice() else {
        return Err(Error::Export(format!(
            "scale of shape {:?} does not vary along a single axis",
            scale.shape()
        )));
    };
    let zero_point = zero_point
        .broadcast(scale.raw_dim())
        .ok_or_else(|| Error::ShapeMismatch {
            expected: scale.shape().to_vec(),
            got: zero_point.shape().to_vec(),
        })?;
    Ok((
        Array1::from_iter(scale.iter().copied()).into_dyn(),
        Array1::from_iter(zero_point.iter().copied()).into_dyn(),
        Some(axis),
    ))
}

fn require_opset(opset: u32, needed: u32, what: &str) -> Result<()> {
    if opset < needed {
        return Err(Error::Export(format!(
            "{what} requires opset >= {needed}, got {opset}"
        )));
    }
    Ok(())
}

/// Assemble `[QuantizeLinear ->] [Clip ->] DequantizeLinear`
fn qdq_chain(
    scale: ArrayD<f32>,
    zero_point: ArrayD<f32>,
    axis: Option<usize>,
    block_size: Option<usize>,
    output_dtype: QuantDtype,
    clip: Option<(f32, f32)>,
    pre_quantized: bool,
) -> Vec<QuantNode> {
    let mut nodes = Vec::with_capacity(3);
    if !pre_quantized {
        nodes.push(QuantNode::QuantizeLinear {
            scale: scale.clone(),
            zero_point: zero_point.clone(),
            axis,
            block_size,
            output_dtype,
        });
        if let Some((min, max)) = clip {
            nodes.push(QuantNode::Clip { min, max });
        }
    }
    nodes.push(QuantNode::DequantizeLinear {
        scale,
        zero_point,
        axis,
        block_size,
    });
    nodes
}

type Lowered = (Option<ArrayD<f32>>, Vec<QuantNode>);

fn int_qcdq(qt: &QuantTensor, opset: u32, pre_quantized: bool) -> Result<Lowered> {
    let bits = qt.bit_width();
    // 32-bit integers only appear as constants (biases)
    let (dtype, pre_quantized) = if bits <= 8.0 {
        let dtype = if qt.signed() {
            QuantDtype::Int8
        } else {
            QuantDtype::Uint8
        };
        (dtype, pre_quantized)
    } else if bits == 32.0 && qt.signed() {
        (QuantDtype::Int32, true)
    } else {
        return Err(Error::Export(format!(
            "QCDQ supports integers of at most 8 bits or signed 32 bits, got {bits} bits"
        )));
    };

    let (scale, zero_point, axis) = axis_layout(qt.scale(), qt.zero_point())?;
    if axis.is_some() {
        require_opset(opset, 13, "per-axis QuantizeLinear")?;
    }
    let clip = (bits < 8.0 || qt.narrow_range())
        .then(|| (qt.min_int() as f32, qt.max_int() as f32));
    let codes = pre_quantized.then(|| qt.int(true).to_f32());
    Ok((
        codes,
        qdq_chain(scale, zero_point, axis, None, dtype, clip, pre_quantized),
    ))
}

fn fp8_dtype(format: &FloatFormat, signed: bool) -> Result<QuantDtype> {
    QuantDtype::fp8(format, signed).ok_or_else(|| {
        Error::Export("QCDQ minifloat export supports signed FP8 E4M3FN and E5M2 only".to_string())
    })
}

fn float_qcdq(ft: &FloatQuantTensor, opset: u32, pre_quantized: bool) -> Result<Lowered> {
    require_opset(opset, 19, "FP8 QuantizeLinear")?;
    let dtype = fp8_dtype(ft.format(), ft.signed())?;
    let (scale, zero_point, axis) = axis_layout(ft.scale(), ft.zero_point())?;
    let codes = pre_quantized.then(|| ft.int(true).to_f32());
    Ok((
        codes,
        qdq_chain(scale, zero_point, axis, None, dtype, None, pre_quantized),
    ))
}

fn groupwise_qcdq(
    gt: &GroupwiseFloatQuantTensor,
    opset: u32,
    pre_quantized: bool,
) -> Result<Lowered> {
    require_opset(opset, 21, "blocked QuantizeLinear")?;
    let dtype = fp8_dtype(gt.format(), gt.signed())?;
    let scale = gt.scale().clone();
    let zero_point = ArrayD::zeros(scale.raw_dim());
    let codes = if pre_quantized {
        Some(gt.int(true)?.to_f32())
    } else {
        None
    };
    Ok((
        codes,
        qdq_chain(
            scale,
            zero_point,
            Some(gt.group_dim()),
            Some(gt.group_size()),
            dtype,
            None,
            pre_quantized,
        ),
    ))
}

fn float_qonnx(scale: ArrayD<f32>, format: &FloatFormat, signed: bool) -> Result<Lowered> {
    if *format == FloatFormat::e4m3() || *format == FloatFormat::e5m2() {
        return Err(Error::Export("FP8 export requires QCDQ".to_string()));
    }
    Ok((
        None,
        vec![QuantNode::FloatQuant {
            scale,
            format: format.clone(),
            signed,
        }],
    ))
}

/// Exported description of one quantized tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantNodeRecord {
    pub name: String,

    /// Graph value the chain consumes
    pub input: String,

    pub format: ExportFormat,

    /// Pre-quantized codes standing in for `input`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codes: Option<ArrayD<f32>>,

    pub nodes: Vec<QuantNode>,
}

impl QuantNodeRecord {
    /// Lower a quantizer output; disabled quantizers export nothing
    ///
    /// `pre_quantized` stores QCDQ codes in place of the `QuantizeLinear`
    /// step. It has no effect on QONNX.
    pub fn from_output(
        name: &str,
        input: &str,
        output: &QuantOutput,
        config: &ExportConfig,
        pre_quantized: bool,
    ) -> Result<Option<Self>> {
        let (codes, nodes) = match (output, config.format) {
            (QuantOutput::Passthrough(_), _) => return Ok(None),
            (QuantOutput::Int(qt), ExportFormat::Qcdq) => {
                int_qcdq(qt, config.opset, pre_quantized)?
            }
            (QuantOutput::Int(qt), ExportFormat::Qonnx) => (
                None,
                vec![QuantNode::Quant {
                    scale: qt.scale().clone(),
                    zero_point: qt.zero_point().clone(),
                    bit_width: qt.bit_width(),
                    signed: qt.signed(),
                    narrow: qt.narrow_range(),
                }],
            ),
            (QuantOutput::Float(ft), ExportFormat::Qcdq) => {
                float_qcdq(ft, config.opset, pre_quantized)?
            }
            (QuantOutput::Float(ft), ExportFormat::Qonnx) => {
                float_qonnx(ft.scale().clone(), ft.format(), ft.signed())?
            }
            (QuantOutput::GroupwiseFloat(gt), ExportFormat::Qcdq) => {
                groupwise_qcdq(gt, config.opset, pre_quantized)?
            }
            (QuantOutput::GroupwiseFloat(gt), ExportFormat::Qonnx) => {
                float_qonnx(gt.expanded_scale()?, gt.format(), gt.signed())?
            }
        };
        Ok(Some(Self {
            name: name.to_string(),
            input: input.to_string(),
            format: config.format,
            codes,
            nodes,
        }))
    }

    /// Run the chain on `input`, or on the stored codes when pre-quantized
    pub fn execute(&self, input: Option<&ArrayD<f32>>) -> Result<ArrayD<f32>> {
        let mut x = match (&self.codes, input) {
            (Some(codes), _) => codes.clone(),
            (None, Some(input)) => input.clone(),
            (None, None) => {
                return Err(Error::Export(format!(
                    "record '{}' needs its input '{}'",
                    self.name, self.input
                )))
            }
        };
        for node in &self.nodes {
            x = node.apply(&x)?;
        }
        Ok(x)
    }

    /// Largest difference from `expected`, in units of its scale
    pub fn step_error(&self, input: Option<&ArrayD<f32>>, expected: &QuantOutput) -> Result<f32> {
        let got = self.execute(input)?;
        let value = expected.value().data();
        if got.shape() != value.shape() {
            return Err(Error::ShapeMismatch {
                expected: value.shape().to_vec(),
                got: got.shape().to_vec(),
            });
        }
        let scale = match expected {
            QuantOutput::Passthrough(_) => {
                return Err(Error::Export(
                    "an unquantized value has no quantization step".to_string(),
                ))
            }
            QuantOutput::Int(qt) => expand_param(qt.scale(), None, None, value.shape())?,
            QuantOutput::Float(ft) => expand_param(ft.scale(), None, None, value.shape())?,
            QuantOutput::GroupwiseFloat(gt) => gt.expanded_scale()?,
        };
        Ok(got
            .iter()
            .zip(value.iter())
            .zip(scale.iter())
            .fold(0.0f32, |m, ((&g, &v), &s)| m.max((g - v).abs() / s)))
    }

    /// Fail unless the chain reproduces `expected` within [`INT_TOLERANCE`]
    pub fn check_close(&self, input: Option<&ArrayD<f32>>, expected: &QuantOutput) -> Result<()> {
        let error = self.step_error(input, expected)?;
        if error > INT_TOLERANCE {
            return Err(Error::Export(format!(
                "record '{}' deviates by {error} steps (tolerance {INT_TOLERANCE})",
                self.name
            )));
        }
        Ok(())
    }
}
