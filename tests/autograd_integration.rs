//! Integration tests for gradients through quantizers.
//!
//! Quantized weights reach the float parameters via the straight-through
//! estimator, so a quantized layer can still be trained.

use cuantizar::autograd::{backward, fake_quant, Tensor};
use cuantizar::quant::{IntQuant, QuantGranularity, ScalingImpl, ScalingStats, ZeroPointImpl};
use cuantizar::{QuantLinear, SubtensorSlice};
use ndarray::{ArrayD, IxDyn};

fn asym_per_channel() -> IntQuant {
    let granularity = QuantGranularity::PerChannel { axis: 0 };
    IntQuant::new(8)
        .with_signed(false)
        .with_scaling(ScalingImpl::parameter(ScalingStats::MinMax, granularity))
        .with_zero_point(ZeroPointImpl::parameter(granularity))
}

#[test]
fn test_fake_quant_passes_gradient_unchanged() {
    let x = Tensor::from_vec(vec![0.26, -1.74, 3.1], true);
    let quantized = ArrayD::from_shape_vec(IxDyn(&[3]), vec![0.25, -1.75, 3.0]).unwrap();
    let mut y = fake_quant(&x, quantized);
    let seed = ArrayD::from_shape_vec(IxDyn(&[3]), vec![1.0, 2.0, 3.0]).unwrap();
    backward(&mut y, Some(seed));
    assert_eq!(x.grad().unwrap().as_slice().unwrap(), &[1.0, 2.0, 3.0]);
}

#[test]
fn test_quant_weight_gradient_is_identity() {
    let mut layer = QuantLinear::new(5, 3, false, 1)
        .unwrap()
        .with_weight_quant(Box::new(IntQuant::new(4)))
        .unwrap();
    let out = layer.quant_weight(None, None).unwrap();
    let mut value = out.into_value();
    backward(&mut value, None);

    let grad = layer.weight().weight().unwrap().grad().unwrap();
    assert!(grad.iter().all(|&g| g == 1.0));
}

#[test]
fn test_sliced_quant_weight_gradient_is_scattered() {
    let mut layer = QuantLinear::new(4, 3, false, 1)
        .unwrap()
        .with_weight_quant(Box::new(asym_per_channel()))
        .unwrap();
    let slices: [SubtensorSlice; 2] = [Some((1, 3)), Some((0, 2))];
    let mut region = layer.quant_weight(Some(&slices), None).unwrap().into_value();
    backward(&mut region, None);

    let grad = layer.weight().weight().unwrap().grad().unwrap();
    for ((row, col), &g) in grad.indexed_iter().map(|(i, g)| ((i[0], i[1]), g)) {
        let inside = (1..3).contains(&row) && (0..2).contains(&col);
        assert_eq!(g, if inside { 1.0 } else { 0.0 }, "grad at ({row}, {col})");
    }
}

#[test]
fn test_gradients_accumulate_across_passes() {
    let mut layer = QuantLinear::new(3, 2, false, 4)
        .unwrap()
        .with_weight_quant(Box::new(IntQuant::new(8)))
        .unwrap();
    for _ in 0..2 {
        let mut value = layer.quant_weight(None, None).unwrap().into_value();
        backward(&mut value, None);
    }
    let grad = layer.weight().weight().unwrap().grad().unwrap();
    assert!(grad.iter().all(|&g| g == 2.0));

    layer.weight().weight().unwrap().zero_grad();
    let grad = layer.weight().weight().unwrap().grad();
    assert!(grad.map_or(true, |g| g.iter().all(|&v| v == 0.0)));
}

#[test]
fn test_quantization_aware_training_reduces_loss() {
    let target_w = [0.5f32, -0.25, 0.75, -1.0];
    // positive and negative unit vectors: a well-conditioned regression
    let inputs: Vec<[f32; 4]> = (0..8)
        .map(|i| {
            let mut row = [0.0; 4];
            row[i % 4] = if i < 4 { 1.0 } else { -1.0 };
            row
        })
        .collect();
    let flat = inputs.iter().flatten().copied().collect();
    let x = Tensor::from_shape_vec(&[8, 4], flat, false).unwrap();
    let targets: Vec<f32> = inputs
        .iter()
        .map(|row| row.iter().zip(target_w.iter()).map(|(a, b)| a * b).sum())
        .collect();

    let mut layer = QuantLinear::new(4, 1, false, 7)
        .unwrap()
        .with_weight_quant(Box::new(IntQuant::new(8)))
        .unwrap();

    let step = |layer: &mut QuantLinear| -> f32 {
        let mut y = layer.forward(&x).unwrap();
        let residual: Vec<f32> = y.data().iter().zip(&targets).map(|(p, t)| p - t).collect();
        let loss = residual.iter().map(|r| r * r).sum::<f32>() / residual.len() as f32;
        let grad_output = ArrayD::from_shape_vec(
            IxDyn(&[8, 1]),
            residual.iter().map(|r| 2.0 * r / residual.len() as f32).collect(),
        )
        .unwrap();
        backward(&mut y, Some(grad_output));

        let w = layer.weight().weight().unwrap();
        let grad = w.grad().unwrap();
        let updated = w.data() - &(grad * 0.5);
        w.zero_grad();
        layer.weight_mut().update_weight(updated).unwrap();
        loss
    };

    let initial = step(&mut layer);
    let mut last = initial;
    for _ in 0..100 {
        last = step(&mut layer);
    }
    assert!(last < initial * 0.1, "loss {initial} -> {last}");
}
