use super::*;
use crate::autograd::{backward, Device, SubtensorSlice};
use crate::proxy::QuantInputSource;
use crate::quant::{
    module_at, AccumulatorAwareQuant, GroupwiseFloatQuant, IntBiasQuant, IntQuant, NoneQuant,
    QuantArgs, QuantGranularity, QuantStrategy, ScalingImpl, ScalingStats, ZeroPointImpl,
};
use crate::quant_tensor::FloatFormat;
use crate::{Error, Tensor};
use approx::assert_abs_diff_eq;
use ndarray::{arr0, arr1, arr2, ArrayD, Axis, IxDyn};
use proptest::prelude::*;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;

fn weight() -> Tensor {
    Tensor::new(
        arr2(&[[0.5, -1.0, 0.25, 0.75], [2.0, -0.5, 1.5, -2.5], [0.1, 0.2, -0.3, 0.4]]).into_dyn(),
        true,
    )
}

fn per_channel_asym() -> IntQuant {
    let granularity = QuantGranularity::PerChannel { axis: 0 };
    IntQuant::new(8)
        .with_signed(false)
        .with_scaling(ScalingImpl::parameter(ScalingStats::MinMax, granularity))
        .with_zero_point(ZeroPointImpl::parameter(granularity))
}

fn registered(strategy: IntQuant) -> QuantWeight {
    let mut w = QuantWeight::new(Box::new(strategy));
    w.register_weight(weight()).unwrap();
    w
}

fn slice_state(w: &mut QuantWeight, path: &[usize]) -> Option<Vec<SubtensorSlice>> {
    module_at(w.proxy_mut().module_mut(), path)
        .and_then(|m| m.as_sliceable())
        .and_then(|s| s.subtensor_slice().map(<[SubtensorSlice]>::to_vec))
}

proptest! {
    #![proptest_config(proptest::test_runner::Config::with_cases(50))]

    /// Full-range slices quantize exactly like no slicing
    #[test]
    fn prop_full_range_slice_matches_unsliced(
        values in prop::collection::vec(-4.0f32..4.0, 12),
        explicit_none in any::<bool>(),
    ) {
        let mut w = QuantWeight::new(Box::new(per_channel_asym()));
        let data = ArrayD::from_shape_vec(IxDyn(&[3, 4]), values).unwrap();
        w.register_weight(Tensor::new(data, false)).unwrap();

        let full = w.quant_weight(QuantWeightArgs::default()).unwrap();
        let slices: Vec<SubtensorSlice> = if explicit_none {
            vec![Some((0, 3)), None]
        } else {
            vec![Some((0, 3)), Some((0, 4))]
        };
        let sliced = w
            .quant_weight(QuantWeightArgs {
                subtensor_slice_list: Some(&slices),
                ..QuantWeightArgs::default()
            })
            .unwrap();
        prop_assert_eq!(full.value().data(), sliced.value().data());
        prop_assert_eq!(full.scale(), sliced.scale());
        prop_assert_eq!(full.zero_point(), sliced.zero_point());
    }
}

#[test]
fn test_sliced_region_uses_matching_parameters() {
    let mut w = registered(IntQuant::int8_weight_per_channel(0));
    let full = w.quant_weight(QuantWeightArgs::default()).unwrap();
    let slices = [Some((1, 3)), Some((0, 2))];
    let part = w
        .quant_weight(QuantWeightArgs {
            subtensor_slice_list: Some(&slices),
            ..QuantWeightArgs::default()
        })
        .unwrap();
    assert_eq!(part.value().shape(), &[2, 2]);
    let full_scale = full.scale().unwrap();
    let part_scale = part.scale().unwrap();
    assert_eq!(part_scale.shape(), &[2, 1]);
    assert_eq!(part_scale[[0, 0]], full_scale[[1, 0]]);
    assert_eq!(part_scale[[1, 0]], full_scale[[2, 0]]);
    assert_eq!(part.value().data()[[0, 1]], full.value().data()[[1, 1]]);
}

#[test]
fn test_slice_state_reset_after_call() {
    let mut w = registered(IntQuant::int8_weight_per_channel(0));
    let slices = [Some((0, 1))];
    w.quant_weight(QuantWeightArgs {
        subtensor_slice_list: Some(&slices),
        ..QuantWeightArgs::default()
    })
    .unwrap();
    assert_eq!(slice_state(&mut w, &[0]), None);

    let out = w.quant_weight(QuantWeightArgs::default()).unwrap();
    assert_eq!(out.value().shape(), &[3, 4]);
    assert_eq!(out.scale().unwrap().shape(), &[3, 1]);
}

#[test]
fn test_slice_state_reset_on_error() {
    let strategy = GroupwiseFloatQuant::new(FloatFormat::e4m3(), 2, 1).with_parameter_scaling();
    let mut w = QuantWeight::new(Box::new(strategy));
    w.register_weight(weight()).unwrap();
    // In bounds for the tensor, but not aligned to the group size
    let slices = [None, Some((1, 3))];
    let err = w
        .quant_weight(QuantWeightArgs {
            subtensor_slice_list: Some(&slices),
            ..QuantWeightArgs::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::InvalidSlice(_)));
    assert_eq!(slice_state(&mut w, &[0]), None);
    assert!(w.quant_weight(QuantWeightArgs::default()).is_ok());
}

#[test]
fn test_invalid_slice_rejected_before_binding() {
    let mut w = registered(IntQuant::int8_weight_per_channel(0));
    let slices = [Some((2, 5))];
    let err = w
        .quant_weight(QuantWeightArgs {
            subtensor_slice_list: Some(&slices),
            ..QuantWeightArgs::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::InvalidSlice(_)));
    assert_eq!(slice_state(&mut w, &[0]), None);
}

#[test]
fn test_discovery_runs_once() {
    let mut w = registered(per_channel_asym());
    assert_eq!(w.discovery_runs(), 0);
    for start in 0..3 {
        let slices = [Some((start, start + 1))];
        w.quant_weight(QuantWeightArgs {
            subtensor_slice_list: Some(&slices),
            ..QuantWeightArgs::default()
        })
        .unwrap();
    }
    assert_eq!(w.discovery_runs(), 1);

    // Re-registration keeps the cache; a new quantizer invalidates it
    w.register_weight(weight()).unwrap();
    assert_eq!(w.discovery_runs(), 1);
    w.set_quantizer(Box::new(IntQuant::int8_weight_per_tensor())).unwrap();
    assert_eq!(w.discovery_runs(), 0);
}

#[test]
fn test_sliced_gradient_reaches_live_weight() {
    let mut w = registered(IntQuant::int8_weight_per_channel(0));
    let slices = [Some((1, 2))];
    let out = w
        .quant_weight(QuantWeightArgs {
            subtensor_slice_list: Some(&slices),
            ..QuantWeightArgs::default()
        })
        .unwrap();
    let mut value = out.into_value();
    backward(&mut value, None);
    let grad = w.weight().unwrap().grad().unwrap();
    assert_eq!(grad.index_axis(Axis(0), 0).sum(), 0.0);
    assert_eq!(grad.index_axis(Axis(0), 1).sum(), 4.0);
}

#[test]
fn test_disabled_quant_uses_shadow_copy() {
    let mut w = registered(IntQuant::int8_weight_per_channel(0));
    w.store_weight_orig();
    let orig = w.weight_orig().unwrap().data().clone();
    w.update_weight(ArrayD::from_elem(IxDyn(&[3, 4]), 9.0)).unwrap();

    w.set_weight_quant_enabled(false);
    let out = w.quant_weight(QuantWeightArgs::default()).unwrap();
    assert!(!out.is_quantized());
    assert_eq!(out.value().data(), &orig);
    assert_eq!(w.quant_weight_scale(None).unwrap(), None);
    assert_eq!(w.int_weight(false, None).unwrap(), None);
    assert_eq!(w.is_quant_weight_signed(), None);

    // Quantization on: the live tensor is used again, clipped by the held scales
    w.set_weight_quant_enabled(true);
    let out = w.quant_weight(QuantWeightArgs::default()).unwrap();
    assert!(out.is_quantized());
    assert_ne!(out.value().data(), &orig);
    assert_abs_diff_eq!(out.value().data()[[1, 0]], 2.5, epsilon = 1e-5);
}

#[test]
fn test_disabled_without_shadow_passes_live_weight() {
    let mut w = QuantWeight::new(Box::new(NoneQuant::new()));
    w.register_weight(weight()).unwrap();
    let out = w.quant_weight(QuantWeightArgs::default()).unwrap();
    assert_eq!(out.value().data(), weight().data());
}

#[test]
fn test_reregistration_reinitialises_strategy() {
    let mut w = registered(IntQuant::int8_weight_per_tensor());
    assert_eq!(w.proxy().init_count(), 1);
    let before = w.quant_weight_scale(None).unwrap().unwrap();

    let bigger = Tensor::new(ArrayD::from_elem(IxDyn(&[2, 2]), 10.0), false)
        .to(Device::Accelerator(0));
    w.register_weight(bigger).unwrap();
    assert_eq!(w.proxy().init_count(), 2);
    assert_eq!(w.device(), Device::Accelerator(0));
    let after = w.quant_weight_scale(None).unwrap().unwrap();
    assert_abs_diff_eq!(before[[]], 2.5 / 127.0, epsilon = 1e-7);
    assert_abs_diff_eq!(after[[]], 10.0 / 127.0, epsilon = 1e-7);
}

#[test]
fn test_missing_weight_is_error() {
    let mut w = QuantWeight::new(Box::new(IntQuant::new(8)));
    assert!(matches!(
        w.quant_weight(QuantWeightArgs::default()).unwrap_err(),
        Error::MissingParameter(_)
    ));
}

#[test]
fn test_weight_read_throughs() {
    let mut w = registered(IntQuant::int8_weight_per_channel(0));
    let out = w.quant_weight(QuantWeightArgs::default()).unwrap();
    assert_eq!(w.quant_weight_scale(None).unwrap().as_ref(), out.scale());
    assert_eq!(w.quant_weight_zero_point(None).unwrap().as_ref(), out.zero_point());
    assert_eq!(w.quant_weight_bit_width(None).unwrap(), Some(8.0));
    assert_eq!(w.quant_weight_shared_bit_width(Some(4.0), None).unwrap(), None);
    assert_eq!(w.is_quant_weight_narrow_range(), Some(true));
    let codes = w.int_weight(true, None).unwrap().unwrap().to_f32();
    assert_abs_diff_eq!(codes[[1, 3]], -127.0);
}

#[test]
fn test_quant_input_metadata_drives_weight() {
    struct NoInput;
    impl QuantInputSource for NoInput {
        fn quant_input_bit_width(&self) -> Option<f32> {
            None
        }
        fn is_quant_input_signed(&self) -> Option<bool> {
            None
        }
    }

    let mut w = QuantWeight::new(Box::new(AccumulatorAwareQuant::new(8, 16)));
    w.register_weight(weight()).unwrap();
    assert!(w.requires_quant_input());
    let err = w.quant_weight_scale(Some(&NoInput)).unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));

    let x = IntQuant::int8_act()
        .forward(&Tensor::from_vec(vec![1.0, -1.0, 0.5, 0.25], false), &QuantArgs::default())
        .unwrap();
    let out = w
        .quant_weight(QuantWeightArgs {
            quant_input: Some(&x),
            ..QuantWeightArgs::default()
        })
        .unwrap();
    assert!(out.is_quantized());
}

/// Log sink for asserting on emitted events
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn capture_warnings<T>(f: impl FnOnce() -> T) -> (T, String) {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buffer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    let out = tracing::subscriber::with_default(subscriber, f);
    let logs = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
    (out, logs)
}

fn bias_layer(cache: bool) -> QuantBias {
    let mut b = QuantBias::new(Box::new(IntBiasQuant::int32()), cache);
    b.register_bias(Some(Tensor::from_vec(vec![0.5, -0.25, 1.0], false))).unwrap();
    b
}

#[test]
fn test_absent_bias_sentinels() {
    let mut b = QuantBias::new(Box::new(IntBiasQuant::int32()), true);
    b.register_bias(None).unwrap();
    assert_eq!(b.is_bias_quant_enabled(), None);
    assert_eq!(b.is_quant_bias_signed(), None);
    assert_eq!(b.is_quant_bias_narrow_range(), None);
    assert!(b.quant_bias().unwrap().is_none());
    assert!(b.int_bias(false).unwrap().is_none());
    assert!(b.quant_bias_scale().unwrap().is_none());
    assert!(b.quant_bias_zero_point().unwrap().is_none());
    assert!(b.quant_bias_bit_width().unwrap().is_none());
    assert!(b.forward_bias(None, None).unwrap().is_none());
    assert!(!b.requires_input_scale());
}

#[test]
fn test_uncached_bias_always_errors() {
    let mut b = bias_layer(false);
    b.set_training(false);
    b.forward_bias(Some(arr0(0.5f32).into_dyn()), None).unwrap();
    for _ in 0..3 {
        assert!(matches!(b.quant_bias_scale().unwrap_err(), Error::NoCachedBias));
        assert!(matches!(b.quant_bias_zero_point().unwrap_err(), Error::NoCachedBias));
        assert!(matches!(b.quant_bias_bit_width().unwrap_err(), Error::NoCachedBias));
        assert!(matches!(b.int_bias(false).unwrap_err(), Error::NoCachedBias));
        assert!(matches!(b.quant_bias().unwrap_err(), Error::NoCachedBias));
    }
}

#[test]
fn test_cached_bias_stable_until_next_pass() {
    let mut b = bias_layer(true);
    assert!(b.quant_bias_scale().is_err());

    b.set_training(false);
    let scale = arr1(&[0.5f32, 0.25, 0.125]).into_dyn();
    b.forward_bias(Some(scale.clone()), None).unwrap();
    for _ in 0..2 {
        assert_eq!(b.quant_bias_scale().unwrap(), Some(scale.clone()));
        assert_eq!(b.quant_bias_bit_width().unwrap(), Some(32.0));
    }
    let codes = b.int_bias(true).unwrap().unwrap().to_f32();
    assert_abs_diff_eq!(codes[[0]], 1.0);
    assert_abs_diff_eq!(codes[[1]], -1.0);
    assert_abs_diff_eq!(codes[[2]], 8.0);

    let next = arr0(0.0625f32).into_dyn();
    b.forward_bias(Some(next.clone()), None).unwrap();
    assert_eq!(b.quant_bias_scale().unwrap(), Some(next));
}

#[test]
fn test_cached_bias_readable_during_training() {
    let mut b = bias_layer(true);
    b.set_training(false);
    b.forward_bias(Some(arr0(0.5f32).into_dyn()), None).unwrap();
    let (_, logs) = capture_warnings(|| b.quant_bias_scale().unwrap());
    assert!(logs.is_empty(), "unexpected warning: {logs}");

    b.set_training(true);
    // Training passes do not refresh the cache
    b.forward_bias(Some(arr0(0.25f32).into_dyn()), None).unwrap();
    let (scale, logs) = capture_warnings(|| b.quant_bias_scale().unwrap());
    assert_eq!(scale, Some(arr0(0.5f32).into_dyn()));
    assert!(logs.contains("WARN"), "{logs}");
    assert!(logs.contains("being used during training"), "{logs}");
}

#[test]
fn test_cached_zero_point_is_not_bit_width() {
    let mut b = bias_layer(true);
    b.set_training(false);
    b.forward_bias(Some(arr0(0.5f32).into_dyn()), None).unwrap();
    let zero_point = b.quant_bias_zero_point().unwrap().unwrap();
    let bit_width = b.quant_bias_bit_width().unwrap().unwrap();
    assert_eq!(zero_point, arr0(0.0f32).into_dyn());
    assert!(zero_point.iter().all(|&z| z != bit_width));
}

#[test]
fn test_self_contained_bias_recomputed() {
    let mut b = QuantBias::new(Box::new(IntQuant::new(8)), false);
    b.register_bias(Some(Tensor::from_vec(vec![1.0, -2.0], false))).unwrap();
    assert_eq!(b.is_bias_quant_enabled(), Some(true));
    let scale = b.quant_bias_scale().unwrap().unwrap();
    assert_abs_diff_eq!(scale[[]], 2.0 / 127.0);
    assert_eq!(b.quant_bias_bit_width().unwrap(), Some(8.0));
    b.update_bias(arr1(&[4.0, 4.0]).into_dyn()).unwrap();
    let scale = b.quant_bias_scale().unwrap().unwrap();
    assert_abs_diff_eq!(scale[[]], 4.0 / 127.0);
}

#[test]
fn test_bias_registration_binds_device() {
    let mut b = QuantBias::new(Box::new(IntQuant::new(8)), false);
    assert_eq!(b.proxy().init_count(), 0);
    b.register_bias(Some(Tensor::zeros(&[2], false).to(Device::Accelerator(2)))).unwrap();
    assert_eq!(b.proxy().init_count(), 1);
    assert_eq!(b.device(), Device::Accelerator(2));
}

#[test]
fn test_weight_update_keeps_shape_and_binding() {
    let mut w = registered(IntQuant::int8_weight_per_channel(0));
    assert_eq!(w.proxy().init_count(), 1);

    assert!(matches!(
        w.update_weight(ArrayD::zeros(IxDyn(&[5, 4]))),
        Err(Error::ShapeMismatch { .. })
    ));
    assert_eq!(w.weight().unwrap().shape(), &[3, 4]);
    assert_eq!(w.proxy().init_count(), 1);
    let out = w.quant_weight(QuantWeightArgs::default()).unwrap();
    assert_eq!(out.value().shape(), &[3, 4]);

    // a new shape re-binds the quantizer
    w.register_weight(Tensor::zeros(&[5, 4], true)).unwrap();
    assert_eq!(w.proxy().init_count(), 2);
    let out = w.quant_weight(QuantWeightArgs::default()).unwrap();
    assert_eq!(out.scale().unwrap().shape(), &[5, 1]);
}

#[test]
fn test_weight_update_in_place() {
    let mut w = registered(IntQuant::int8_weight_per_channel(0));
    let grad_cell = w.weight().unwrap().grad_cell();
    w.update_weight(ArrayD::from_elem(IxDyn(&[3, 4]), 0.5)).unwrap();
    assert!(w.weight().unwrap().data().iter().all(|&v| v == 0.5));
    assert!(std::rc::Rc::ptr_eq(&grad_cell, &w.weight().unwrap().grad_cell()));
    assert_eq!(w.proxy().init_count(), 1);
}

#[test]
fn test_bias_update_rejects_shape_change() {
    let mut b = QuantBias::new(Box::new(IntQuant::new(8)), false);
    assert!(matches!(
        b.update_bias(arr1(&[1.0]).into_dyn()),
        Err(Error::MissingParameter(_))
    ));
    b.register_bias(Some(Tensor::from_vec(vec![1.0, -2.0], false))).unwrap();
    assert!(matches!(
        b.update_bias(arr1(&[1.0, 2.0, 3.0]).into_dyn()),
        Err(Error::ShapeMismatch { .. })
    ));
    assert_eq!(b.proxy().init_count(), 1);
    assert_eq!(b.bias().unwrap().data().as_slice().unwrap(), &[1.0, -2.0]);
}
