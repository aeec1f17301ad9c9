//! Integration tests for config module

use super::*;
use crate::{Error, Tensor};
use std::io::Write;
use tempfile::NamedTempFile;

const INT8_LAYER: &str = r#"
in_features: 8
out_features: 4
seed: 11
cache_inference_bias: true

input_quant:
  kind: int
  bit_width: 8

weight_quant:
  kind: int
  narrow_range: true
  granularity: { type: per_channel, axis: 0 }
  scaling: { type: parameter, stats: max_abs }

bias_quant:
  kind: int_bias
  bit_width: 32
"#;

fn input() -> Tensor {
    Tensor::from_shape_vec(&[2, 8], (0..16).map(|i| (i as f32 - 8.0) / 4.0).collect(), false)
        .unwrap()
}

#[test]
fn test_end_to_end_spec_loading() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(INT8_LAYER.as_bytes()).unwrap();

    let spec = load_spec(temp_file.path()).unwrap();
    assert_eq!(spec.in_features, 8);
    assert!(spec.bias);
    assert!(spec.cache_inference_bias);
    match &spec.weight_quant {
        QuantizerSpec::Int(int) => {
            assert_eq!(int.bit_width, 8);
            assert!(int.signed);
            assert!(int.narrow_range);
            assert_eq!(int.granularity, GranularitySpec::PerChannel { axis: 0 });
            assert!(matches!(int.scaling, ScalingSpec::Parameter { .. }));
        }
        other => panic!("unexpected weight quantizer {other:?}"),
    }
    assert_eq!(
        spec.bias_quant,
        QuantizerSpec::IntBias(IntBiasSpec {
            bit_width: Some(32),
            narrow_range: false
        })
    );

    let mut layer = build_linear(&spec).unwrap();
    layer.eval();
    let pass = layer.forward_quant(&input()).unwrap();
    assert_eq!(pass.output.shape(), &[2, 4]);
    assert_eq!(pass.weight.bit_width(), Some(8.0));
    assert_eq!(pass.weight.scale().unwrap().shape(), &[4, 1]);
    assert_eq!(layer.bias_mut().quant_bias_bit_width().unwrap(), Some(32.0));
}

#[test]
fn test_defaults_build_float_layer() {
    let spec = parse_spec("in_features: 3\nout_features: 2\n").unwrap();
    assert!(spec.bias);
    assert!(spec.input_quant.is_none());
    assert!(spec.weight_quant.is_none());

    let mut layer = build_linear(&spec).unwrap();
    let pass = layer.forward_quant(&Tensor::from_vec(vec![1.0, 2.0, 3.0], false)).unwrap();
    assert!(!pass.weight.is_quantized());
    assert!(!pass.bias.unwrap().is_quantized());
}

#[test]
fn test_minifloat_specs() {
    let yaml = r#"
in_features: 8
out_features: 2
bias: false
input_quant:
  kind: float
  format: e5m2
weight_quant:
  kind: groupwise_float
  group_size: 4
"#;
    let spec = parse_spec(yaml).unwrap();
    let mut layer = build_linear(&spec).unwrap();
    let pass = layer.forward_quant(&input()).unwrap();
    assert!(pass.input.as_float().is_some());
    let weight = pass.weight.as_groupwise_float().unwrap();
    assert_eq!(weight.group_size(), 4);
    assert_eq!(weight.scale().shape(), &[2, 2]);
}

#[test]
fn test_custom_float_format() {
    let yaml = r#"
in_features: 4
out_features: 2
bias: false
weight_quant:
  kind: float
  format: custom
  custom_format:
    exponent_bit_width: 3
    mantissa_bit_width: 2
    exponent_bias: 3
"#;
    let spec = parse_spec(yaml).unwrap();
    let strategy = build_quantizer(&spec.weight_quant).unwrap();
    assert_eq!(strategy.bit_width_hint(), Some(6.0));
}

#[test]
fn test_accumulator_aware_spec() {
    let yaml = r#"
in_features: 8
out_features: 4
bias: false
input_quant:
  kind: int
  signed: false
  zero_point: stats
  scaling: { type: stats, stats: min_max }
weight_quant:
  kind: accumulator_aware
  bit_width: 4
  accumulator_bit_width: 12
"#;
    let mut layer = build_linear(&parse_spec(yaml).unwrap()).unwrap();
    let pass = layer.forward_quant(&input()).unwrap();
    let codes = pass.weight.int(true).unwrap().unwrap().to_f32();
    // l1 budget for 8-bit unsigned inputs into a 12-bit accumulator
    let budget = ((1u32 << 11) - 1) as f32 / 255.0;
    for row in codes.outer_iter() {
        assert!(row.iter().map(|c| c.abs()).sum::<f32>() <= budget);
    }
}

#[test]
fn test_invalid_spec_is_configuration_error() {
    let yaml = r#"
in_features: 4
out_features: 2
weight_quant:
  kind: int
bias_quant:
  kind: int_bias
"#;
    assert!(matches!(parse_spec(yaml), Err(Error::Configuration(_))));
}

#[test]
fn test_malformed_yaml() {
    assert!(matches!(
        parse_spec("in_features: [not, a, number]"),
        Err(Error::Serialization(_))
    ));
    assert!(matches!(
        parse_spec("in_features: 4\nout_features: 2\nweight_quant:\n  kind: ternary\n"),
        Err(Error::Serialization(_))
    ));
}

#[test]
fn test_missing_file() {
    assert!(matches!(
        load_spec("/nonexistent/layer.yaml"),
        Err(Error::Configuration(_))
    ));
}

#[test]
fn test_spec_round_trips_through_yaml() {
    let spec = parse_spec(INT8_LAYER).unwrap();
    let yaml = serde_yaml::to_string(&spec).unwrap();
    assert_eq!(parse_spec(&yaml).unwrap(), spec);
}
