//! Export format definitions

use serde::{Deserialize, Serialize};

/// Operator set a quantized tensor is lowered to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    /// `QuantizeLinear -> [Clip] -> DequantizeLinear`
    #[default]
    Qcdq,
    /// A single `Quant` or `FloatQuant` node
    Qonnx,
}

/// Serialization of an [`ExportGraph`](super::ExportGraph)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphFormat {
    Json,
    Yaml,
}

impl GraphFormat {
    /// Get file extension for this format
    pub fn extension(&self) -> &str {
        match self {
            GraphFormat::Json => "json",
            GraphFormat::Yaml => "yaml",
        }
    }

    /// Detect format from file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "json" => Some(GraphFormat::Json),
            "yaml" | "yml" => Some(GraphFormat::Yaml),
            _ => None,
        }
    }
}

/// Options for exporting a layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportConfig {
    pub format: ExportFormat,

    /// Target opset; per-axis QCDQ needs 13, FP8 needs 19, blocked needs 21
    pub opset: u32,

    /// Store QCDQ weights as pre-quantized codes feeding `DequantizeLinear`
    pub export_q_weight: bool,
}

impl ExportConfig {
    pub fn new(format: ExportFormat) -> Self {
        Self {
            format,
            opset: 14,
            export_q_weight: false,
        }
    }

    pub fn with_opset(mut self, opset: u32) -> Self {
        self.opset = opset;
        self
    }

    pub fn with_export_q_weight(mut self, export_q_weight: bool) -> Self {
        self.export_q_weight = export_q_weight;
        self
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self::new(ExportFormat::Qcdq)
    }
}
