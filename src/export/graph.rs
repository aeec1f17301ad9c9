//! Exported layer graphs

use super::format::{ExportConfig, ExportFormat, GraphFormat};
use super::record::QuantNodeRecord;
use crate::nn::{LinearPass, QuantLinear};
use crate::{Error, Result, Tensor};
use ndarray::{ArrayD, Axis, Ix2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

pub const INPUT: &str = "input";
pub const WEIGHT: &str = "weight";
pub const BIAS: &str = "bias";

/// Float initializers plus the quantization records of one linear layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportGraph {
    pub format: ExportFormat,
    pub opset: u32,
    pub initializers: BTreeMap<String, ArrayD<f32>>,
    pub records: Vec<QuantNodeRecord>,
}

impl ExportGraph {
    pub fn record_for(&self, input: &str) -> Option<&QuantNodeRecord> {
        self.records.iter().find(|r| r.input == input)
    }

    /// A graph value after its quantization chain, if any
    fn resolve(&self, name: &str, value: Option<&ArrayD<f32>>) -> Result<Option<ArrayD<f32>>> {
        let value = value.or_else(|| self.initializers.get(name));
        match self.record_for(name) {
            Some(record) => record.execute(value).map(Some),
            None => Ok(value.cloned()),
        }
    }

    /// Evaluate `x · Wᵀ + b` through the exported chains
    pub fn execute_linear(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x = self
            .resolve(INPUT, Some(x))?
            .ok_or_else(|| Error::Export("graph has no input".to_string()))?;
        let w = self
            .resolve(WEIGHT, None)?
            .ok_or_else(|| Error::Export("graph has no weight".to_string()))?;
        let b = self.resolve(BIAS, None)?;

        let squeeze = x.ndim() == 1;
        let x = if squeeze { x.insert_axis(Axis(0)) } else { x };
        let as_matrix = |a: ArrayD<f32>| {
            let shape = a.shape().to_vec();
            a.into_dimensionality::<Ix2>()
                .map_err(|_| Error::ShapeMismatch {
                    expected: vec![0, 0],
                    got: shape,
                })
        };
        let (x, w) = (as_matrix(x)?, as_matrix(w)?);
        if x.ncols() != w.ncols() {
            return Err(Error::ShapeMismatch {
                expected: vec![w.nrows(), x.ncols()],
                got: w.shape().to_vec(),
            });
        }
        let mut y = x.dot(&w.t());
        if let Some(b) = b {
            if b.len() != w.nrows() {
                return Err(Error::ShapeMismatch {
                    expected: vec![w.nrows()],
                    got: b.shape().to_vec(),
                });
            }
            for mut row in y.rows_mut() {
                row.iter_mut().zip(b.iter()).for_each(|(v, &bias)| *v += bias);
            }
        }
        let y = y.into_dyn();
        Ok(if squeeze { y.index_axis_move(Axis(0), 0) } else { y })
    }
}

fn records_for(pass: &LinearPass, config: &ExportConfig) -> Result<Vec<QuantNodeRecord>> {
    let mut records = Vec::new();
    let mut push = |record: Option<QuantNodeRecord>| records.extend(record);
    push(QuantNodeRecord::from_output(
        "input_quant",
        INPUT,
        &pass.input,
        config,
        false,
    )?);
    push(QuantNodeRecord::from_output(
        "weight_quant",
        WEIGHT,
        &pass.weight,
        config,
        config.export_q_weight,
    )?);
    if let Some(bias) = &pass.bias {
        push(QuantNodeRecord::from_output(
            "bias_quant",
            BIAS,
            bias,
            config,
            config.export_q_weight,
        )?);
    }
    Ok(records)
}

/// Export a layer after an inference pass on `x`
///
/// The layer is switched to inference mode for the pass and restored after.
pub fn export_linear(
    layer: &mut QuantLinear,
    x: &Tensor,
    config: &ExportConfig,
) -> Result<ExportGraph> {
    let was_training = layer.is_training();
    layer.eval();
    let pass = layer.forward_quant(x);
    if was_training {
        layer.train();
    }
    let pass = pass?;
    let records = records_for(&pass, config)?;

    let mut initializers = BTreeMap::new();
    if let Some(w) = layer.weight().weight() {
        initializers.insert(WEIGHT.to_string(), w.data().clone());
    }
    if let Some(b) = layer.bias().bias() {
        initializers.insert(BIAS.to_string(), b.data().clone());
    }

    tracing::debug!(
        format = ?config.format,
        opset = config.opset,
        records = records.len(),
        "exported quant linear"
    );
    Ok(ExportGraph {
        format: config.format,
        opset: config.opset,
        initializers,
        records,
    })
}

/// Save a graph as JSON or YAML
pub fn save_graph(graph: &ExportGraph, path: impl AsRef<Path>, format: GraphFormat) -> Result<()> {
    let data = match format {
        GraphFormat::Json => serde_json::to_string_pretty(graph)
            .map_err(|e| Error::Serialization(format!("JSON serialization failed: {e}")))?,
        GraphFormat::Yaml => serde_yaml::to_string(graph)
            .map_err(|e| Error::Serialization(format!("YAML serialization failed: {e}")))?,
    };
    let mut file = File::create(path)?;
    file.write_all(data.as_bytes())?;
    Ok(())
}

/// Load a graph, detecting the format from the file extension
pub fn load_graph(path: impl AsRef<Path>) -> Result<ExportGraph> {
    let path = path.as_ref();
    let format = path
        .extension()
        .and_then(|e| e.to_str())
        .and_then(GraphFormat::from_extension)
        .ok_or_else(|| {
            Error::Serialization(format!("Cannot detect graph format of {}", path.display()))
        })?;
    let data = std::fs::read_to_string(path)?;
    match format {
        GraphFormat::Json => serde_json::from_str(&data)
            .map_err(|e| Error::Serialization(format!("JSON deserialization failed: {e}"))),
        GraphFormat::Yaml => serde_yaml::from_str(&data)
            .map_err(|e| Error::Serialization(format!("YAML deserialization failed: {e}"))),
    }
}
