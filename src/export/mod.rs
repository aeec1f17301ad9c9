//! Export contract for quantized layers
//!
//! Each enabled quantizer is lowered to a [`QuantNodeRecord`]: either a QCDQ
//! chain (`QuantizeLinear -> [Clip] -> DequantizeLinear`) or a single QONNX
//! `Quant`/`FloatQuant` node. Records carry everything a graph serializer
//! needs and can be executed to check them against the layer.
//!
//! Lowering rules:
//! - integer QCDQ: at most 8 bits (Clip below 8 bits or for narrow range),
//!   or signed 32 bits stored as codes
//! - minifloat QCDQ: signed FP8 E4M3FN/E5M2 only, opset 19 (21 for groups)
//! - minifloat QONNX: custom formats only, FP8 requires QCDQ

mod format;
mod graph;
mod record;
mod weights;

pub use format::{ExportConfig, ExportFormat, GraphFormat};
pub use graph::{export_linear, load_graph, save_graph, ExportGraph, BIAS, INPUT, WEIGHT};
pub use record::{QuantDtype, QuantNode, QuantNodeRecord, INT_TOLERANCE};
pub use weights::save_quant_weights;
