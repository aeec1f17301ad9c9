//! YAML schema for declarative layer quantization

use crate::quant::{QuantGranularity, RoundingMode, ScalingStats};
use crate::quant_tensor::FloatFormat;
use serde::{Deserialize, Serialize};

/// A quantized linear layer and the quantizers bound to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerQuantSpec {
    pub in_features: usize,
    pub out_features: usize,

    /// Give the layer a bias parameter
    #[serde(default = "default_true")]
    pub bias: bool,

    /// Seed for weight initialisation
    #[serde(default)]
    pub seed: u64,

    /// Snapshot bias metadata on inference passes
    #[serde(default)]
    pub cache_inference_bias: bool,

    #[serde(default)]
    pub input_quant: QuantizerSpec,

    #[serde(default)]
    pub weight_quant: QuantizerSpec,

    #[serde(default)]
    pub bias_quant: QuantizerSpec,
}

/// Quantizer selection, tagged by `kind`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuantizerSpec {
    /// Quantization disabled
    #[default]
    None,
    Int(IntQuantSpec),
    AccumulatorAware(AccumulatorAwareSpec),
    Float(FloatQuantSpec),
    GroupwiseFloat(GroupwiseFloatSpec),
    IntBias(IntBiasSpec),
}

impl QuantizerSpec {
    pub fn is_none(&self) -> bool {
        matches!(self, QuantizerSpec::None)
    }

    /// Strategy name used in validation messages
    pub fn kind(&self) -> &'static str {
        match self {
            QuantizerSpec::None => "none",
            QuantizerSpec::Int(_) => "int",
            QuantizerSpec::AccumulatorAware(_) => "accumulator_aware",
            QuantizerSpec::Float(_) => "float",
            QuantizerSpec::GroupwiseFloat(_) => "groupwise_float",
            QuantizerSpec::IntBias(_) => "int_bias",
        }
    }
}

/// Integer quantizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntQuantSpec {
    #[serde(default = "default_bit_width")]
    pub bit_width: u32,

    #[serde(default = "default_true")]
    pub signed: bool,

    #[serde(default)]
    pub narrow_range: bool,

    #[serde(default)]
    pub granularity: GranularitySpec,

    #[serde(default)]
    pub scaling: ScalingSpec,

    #[serde(default)]
    pub zero_point: ZeroPointSpec,

    /// Follow a bit-width shared across layers when one is supplied
    #[serde(default)]
    pub shared_bit_width: bool,

    #[serde(default)]
    pub rounding: RoundingMode,
}

impl Default for IntQuantSpec {
    fn default() -> Self {
        Self {
            bit_width: default_bit_width(),
            signed: true,
            narrow_range: false,
            granularity: GranularitySpec::default(),
            scaling: ScalingSpec::default(),
            zero_point: ZeroPointSpec::default(),
            shared_bit_width: false,
            rounding: RoundingMode::default(),
        }
    }
}

/// Weight quantizer bounding each output channel's L1 norm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccumulatorAwareSpec {
    #[serde(default = "default_bit_width")]
    pub bit_width: u32,

    pub accumulator_bit_width: u32,

    /// Output-channel axis of the weight
    #[serde(default)]
    pub axis: usize,
}

/// Minifloat quantizer with per-tensor or per-channel scales
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloatQuantSpec {
    #[serde(default)]
    pub format: FloatPreset,

    /// Required when `format` is `custom`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_format: Option<FloatFormat>,

    #[serde(default = "default_true")]
    pub signed: bool,

    #[serde(default)]
    pub granularity: GranularitySpec,

    #[serde(default)]
    pub scaling: ScalingSpec,
}

/// Minifloat quantizer with one scale per group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupwiseFloatSpec {
    #[serde(default)]
    pub format: FloatPreset,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_format: Option<FloatFormat>,

    pub group_size: usize,

    /// Axis the groups run along (the input-feature axis of a weight)
    #[serde(default = "default_group_dim")]
    pub group_dim: usize,

    /// Hold per-group scales initialised from the registered tensor
    #[serde(default)]
    pub parameter_scaling: bool,
}

/// Bias quantizer on the accumulator scale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IntBiasSpec {
    /// Fixed width; absent means the accumulator bit-width of each pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_width: Option<u32>,

    #[serde(default)]
    pub narrow_range: bool,
}

/// Minifloat encoding preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FloatPreset {
    #[default]
    E4m3,
    E5m2,
    Custom,
}

/// Scale/zero-point granularity of an int or float quantizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GranularitySpec {
    #[default]
    PerTensor,
    PerChannel {
        #[serde(default)]
        axis: usize,
    },
}

impl From<GranularitySpec> for QuantGranularity {
    fn from(spec: GranularitySpec) -> Self {
        match spec {
            GranularitySpec::PerTensor => QuantGranularity::PerTensor,
            GranularitySpec::PerChannel { axis } => QuantGranularity::PerChannel { axis },
        }
    }
}

/// How the scale is produced
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScalingSpec {
    /// Recomputed from the tensor on every call
    Stats {
        #[serde(default)]
        stats: ScalingStats,
    },
    /// Initialised from the registered tensor, then held
    Parameter {
        #[serde(default)]
        stats: ScalingStats,
    },
    Const { value: f32 },
}

impl Default for ScalingSpec {
    fn default() -> Self {
        ScalingSpec::Stats {
            stats: ScalingStats::MaxAbs,
        }
    }
}

/// How the zero-point is produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ZeroPointSpec {
    /// Symmetric quantization
    #[default]
    Zero,
    Stats,
    Parameter,
}

fn default_true() -> bool {
    true
}

fn default_bit_width() -> u32 {
    8
}

fn default_group_dim() -> usize {
    1
}
