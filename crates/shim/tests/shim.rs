//! Integration tests for shims over `graft-diff` models.
//!
//! These tests drive a shim the way an orchestrator does:
//! - Forward/backward through `call`, with nested inputs and outputs
//! - `finish_update` against a shared generic optimizer
//! - Parameter averaging and scoped parameter substitution
//! - Device placement and `to_bytes`/`from_bytes` persistence
//! - Every failure path leaves the model as it was

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};

use graft_core::{use_ops, ArgsKwargs, Array, Device, GpuOps, Id, Layer, Optimizer, ParamKey, Value};
use graft_diff::device::set_visible_accelerators;
use graft_diff::nn::{Forward, IValue, Linear, ReLU, Sequential, StateDict, Tanh};
use graft_diff::optim::OptimizerKind;
use graft_diff::{DiffError, Tensor};
use graft_shim::{diff_shim, DiffShim, Framework, ShimError, ShimLayer, DEFAULT_INIT_STEPS};
use serde_json::json;

// ============================================================================
// Helpers
// ============================================================================

fn mlp(seed: u64) -> DiffShim {
    diff_shim(
        Sequential::new()
            .add(Linear::new(3, 8, seed))
            .add(ReLU)
            .add(Linear::new(8, 2, seed + 1)),
        json!({"widths": [3, 8, 2], "activation": "relu"}),
    )
}

fn snapshot(shim: &DiffShim) -> Vec<(String, Vec<f32>)> {
    shim.model()
        .state_dict()
        .into_iter()
        .map(|(name, t)| (name, t.to_vec()))
        .collect()
}

fn ones_like(t: &Tensor) -> Tensor {
    Tensor::from_vec(t.shape(), vec![1.0; t.numel()]).unwrap()
}

/// One forward/backward/update cycle with an all-ones output gradient.
fn train_step(shim: &mut DiffShim, optimizer: &mut Optimizer, seed: u64) {
    let x = Tensor::randn(vec![4, 3], 1.0, seed);
    let (y, backprop) = shim.call(ArgsKwargs::from_tensors([x]), true).unwrap();
    let dy = ones_like(&y.into_tensor().unwrap());
    backprop(ArgsKwargs::from_tensors([dy])).unwrap();
    shim.finish_update(optimizer).unwrap();
}

fn diff_error(err: &ShimError) -> &DiffError {
    match err {
        ShimError::Framework { source, .. } => source.downcast_ref::<DiffError>().unwrap(),
        other => panic!("expected a framework error, got {other:?}"),
    }
}

fn no_grads(shim: &DiffShim) -> bool {
    shim.model().parameters().iter().all(|p| p.grad().is_none())
}

/// `out = x * w * scale`, `aux = y * w`.
struct TwoHeads {
    w: Tensor,
}

impl Forward for TwoHeads {
    fn forward(
        &self,
        args: &[IValue],
        kwargs: &BTreeMap<String, IValue>,
        _train: bool,
    ) -> graft_diff::Result<IValue> {
        let tensor = |i: usize| {
            args.get(i)
                .and_then(IValue::as_tensor)
                .ok_or_else(|| DiffError::Format(format!("argument {i} must be a tensor")))
        };
        let scale = match kwargs.get("scale") {
            Some(IValue::Double(s)) => *s as f32,
            _ => 1.0,
        };
        let out = tensor(0)?.mul(&self.w)?.scale(scale)?;
        let aux = tensor(1)?.mul(&self.w)?;
        Ok(IValue::Dict(BTreeMap::from([
            ("out".to_string(), IValue::Tensor(out)),
            ("aux".to_string(), IValue::Tensor(aux)),
        ])))
    }

    fn visit_parameters(&self, prefix: &str, f: &mut dyn FnMut(String, &Tensor)) {
        f(format!("{prefix}w"), &self.w);
    }
}

// ============================================================================
// Call / Predict / Backprop
// ============================================================================

#[test]
fn test_backprop_returns_input_gradients() {
    let w = Tensor::from_vec(vec![3], vec![1.0, 2.0, 3.0]).unwrap().requires_grad_(true);
    let mut shim = diff_shim(TwoHeads { w: w.clone() }, json!({"heads": 2}));

    let x = Tensor::from_vec(vec![3], vec![1.0; 3]).unwrap().requires_grad_(true);
    let y = Tensor::from_vec(vec![3], vec![2.0; 3]).unwrap();
    let inputs = ArgsKwargs::from_tensors([x, y]).with_kwarg("scale", Value::Float(2.0));

    let (outputs, backprop) = shim.call(inputs, true).unwrap();
    let Value::Map(heads) = &outputs else {
        panic!("expected named outputs, got {}", outputs.kind());
    };
    assert_eq!(heads["out"].as_tensor().unwrap().to_vec(), vec![2.0, 4.0, 6.0]);
    assert_eq!(heads["aux"].as_tensor().unwrap().to_vec(), vec![2.0, 4.0, 6.0]);

    // Only `out` gets a gradient.
    let seed = ones_like(heads["out"].as_tensor().unwrap());
    let grads = ArgsKwargs::new(
        vec![],
        BTreeMap::from([("out".to_string(), Value::Tensor(seed)), ("aux".to_string(), Value::None)]),
    );
    let d_inputs = backprop(grads).unwrap();

    assert_eq!(d_inputs.args.len(), 2);
    assert_eq!(d_inputs.args[0].as_tensor().unwrap().to_vec(), vec![2.0, 4.0, 6.0]);
    assert!(matches!(d_inputs.args[1], Value::None));
    assert!(matches!(d_inputs.kwargs["scale"], Value::Float(s) if s == 2.0));
    assert_eq!(w.grad().unwrap().to_vec(), vec![2.0, 2.0, 2.0]);
}

#[test]
fn test_gradient_structure_mismatch_is_reported() {
    let mut shim = mlp(1);
    let x = Tensor::randn(vec![2, 3], 1.0, 9);
    let (y, backprop) = shim.call(ArgsKwargs::from_tensors([x]), true).unwrap();
    let dy = ones_like(y.as_tensor().unwrap());

    let err = backprop(ArgsKwargs::from_tensors([dy.clone(), dy])).unwrap_err();
    assert!(err.is_structure_mismatch(), "{err}");
    assert!(no_grads(&shim));
}

#[test]
fn test_inference_backprop_is_a_no_op() {
    let mut shim = mlp(2);
    let before = snapshot(&shim);
    let x = Tensor::randn(vec![2, 3], 1.0, 4);

    let (y, backprop) = shim.call(ArgsKwargs::from_tensors([x]), false).unwrap();
    let dy = ones_like(y.as_tensor().unwrap());
    let d_inputs = backprop(ArgsKwargs::from_tensors([dy])).unwrap();

    assert!(d_inputs.is_empty());
    assert!(no_grads(&shim));
    assert_eq!(snapshot(&shim), before);
}

#[test]
fn test_predict_restores_training_mode() {
    let mut shim = mlp(3);
    shim.model_mut().eval();

    let x = Tensor::randn(vec![2, 3], 1.0, 5);
    let y = shim.predict(&ArgsKwargs::from_tensors([x])).unwrap();
    assert_eq!(y.as_tensor().unwrap().shape(), vec![2, 2]);
    assert!(shim.model().is_training());
}

#[test]
fn test_predict_restores_training_mode_on_error() {
    let mut shim = mlp(3);
    let a = Tensor::randn(vec![2, 3], 1.0, 5);
    let b = Tensor::randn(vec![2, 3], 1.0, 6);

    let err = shim.predict(&ArgsKwargs::from_tensors([a, b])).unwrap_err();
    assert!(matches!(diff_error(&err), DiffError::Format(_)));
    assert!(shim.model().is_training());
}

// ============================================================================
// Optimizer Updates
// ============================================================================

#[test]
fn test_foreign_optimizer_is_built_once() {
    let mut shim = mlp(4);
    let mut optimizer = Optimizer::adam(0.01);
    assert!(shim.foreign_optimizer().is_none());

    train_step(&mut shim, &mut optimizer, 1);
    optimizer.learn_rate = 0.05;
    train_step(&mut shim, &mut optimizer, 2);

    let foreign = shim.foreign_optimizer().unwrap();
    assert_eq!(foreign.step_count(), 2);
    assert_eq!(foreign.kind(), OptimizerKind::AdamW);
    assert!(foreign.param_groups().iter().all(|g| g.options.lr == 0.05));
    assert!(no_grads(&shim));
}

#[test]
fn test_family_change_keeps_existing_optimizer() {
    let mut shim = mlp(4);
    let mut optimizer = Optimizer::adam(0.01);
    train_step(&mut shim, &mut optimizer, 1);

    optimizer.b2 = 0.0;
    optimizer.learn_rate = 0.02;
    train_step(&mut shim, &mut optimizer, 2);

    let foreign = shim.foreign_optimizer().unwrap();
    assert_eq!(foreign.kind(), OptimizerKind::AdamW);
    assert_eq!(foreign.step_count(), 2);
    assert_eq!(foreign.param_groups()[0].options.lr, 0.02);
}

#[test]
fn test_adam_with_coupled_l2() {
    let mut shim = mlp(5);
    let mut optimizer = Optimizer::adam(0.01);
    optimizer.l2 = 0.01;
    optimizer.l2_is_weight_decay = false;
    train_step(&mut shim, &mut optimizer, 1);

    let foreign = shim.foreign_optimizer().unwrap();
    assert_eq!(foreign.kind(), OptimizerKind::Adam);
    let options = &foreign.param_groups()[0].options;
    assert_eq!(options.weight_decay, 0.01);
    assert_eq!(options.betas, (0.9, 0.999));
    assert_eq!(options.eps, 1e-8);
}

#[test]
fn test_adamw_with_decoupled_decay() {
    let mut shim = mlp(5);
    let mut optimizer = Optimizer::adam(0.01);
    optimizer.l2 = 0.01;
    train_step(&mut shim, &mut optimizer, 1);

    let foreign = shim.foreign_optimizer().unwrap();
    assert_eq!(foreign.kind(), OptimizerKind::AdamW);
    assert_eq!(foreign.param_groups()[0].options.weight_decay, 0.01);
}

#[test]
fn test_momentum_sgd_when_b2_is_zero() {
    let mut shim = mlp(6);
    let mut optimizer = Optimizer::sgd(0.1);
    optimizer.b1 = 0.9;
    train_step(&mut shim, &mut optimizer, 1);

    let foreign = shim.foreign_optimizer().unwrap();
    assert_eq!(foreign.kind(), OptimizerKind::Sgd);
    let options = &foreign.param_groups()[0].options;
    assert_eq!(options.momentum, 0.9);
    assert_eq!(options.weight_decay, 0.0);
    assert_eq!(options.lr, 0.1);
}

#[test]
fn test_unsupported_optimizer_builds_nothing() {
    let mut shim = mlp(7);
    let before = snapshot(&shim);
    let mut optimizer = Optimizer::adam(0.01);
    optimizer.b1 = 0.0;

    let err = shim.finish_update(&mut optimizer).unwrap_err();
    assert!(matches!(err, ShimError::UnsupportedOptimizer { b1, b2 } if b1 == 0.0 && b2 == 0.999));
    assert!(shim.foreign_optimizer().is_none());
    assert_eq!(snapshot(&shim), before);
}

#[test]
fn test_gradients_are_clipped_before_step() {
    let mut shim = mlp(8);
    let before = snapshot(&shim);
    let mut optimizer = Optimizer::sgd(1.0);
    optimizer.grad_clip = Some(0.1);

    let x = Tensor::randn(vec![4, 3], 1.0, 3);
    let (y, backprop) = shim.call(ArgsKwargs::from_tensors([x]), true).unwrap();
    let y = y.into_tensor().unwrap();
    let dy = Tensor::from_vec(y.shape(), vec![100.0; y.numel()]).unwrap();
    backprop(ArgsKwargs::from_tensors([dy])).unwrap();
    shim.finish_update(&mut optimizer).unwrap();

    // Plain SGD with lr 1 moves parameters by exactly the clipped gradient.
    let moved: f32 = before
        .iter()
        .zip(snapshot(&shim))
        .flat_map(|((_, a), (_, b))| a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).collect::<Vec<_>>())
        .sum::<f32>()
        .sqrt();
    assert!(moved > 0.0);
    assert!(moved <= 0.1 + 1e-4, "moved {moved}");
}

#[test]
fn test_non_finite_gradients_fail_without_update() {
    let mut shim = mlp(9);
    let before = snapshot(&shim);
    let mut optimizer = Optimizer::adam(0.01);

    let x = Tensor::randn(vec![2, 3], 1.0, 3);
    let (y, backprop) = shim.call(ArgsKwargs::from_tensors([x]), true).unwrap();
    let y = y.into_tensor().unwrap();
    let dy = Tensor::from_vec(y.shape(), vec![f32::NAN; y.numel()]).unwrap();
    backprop(ArgsKwargs::from_tensors([dy])).unwrap();

    let err = shim.finish_update(&mut optimizer).unwrap_err();
    assert!(matches!(diff_error(&err), DiffError::NonFinite { .. }));
    assert_eq!(snapshot(&shim), before);
    assert!(optimizer.averages.as_ref().unwrap().is_empty());
}

// ============================================================================
// Parameter Averaging
// ============================================================================

#[test]
fn test_first_average_is_exact_copy() {
    let shim = mlp(10);
    let mut optimizer = Optimizer::adam(0.01);
    shim.update_averages(&mut optimizer).unwrap();

    let averages = optimizer.averages.as_ref().unwrap();
    assert_eq!(averages.len(), 4);
    for (name, values) in snapshot(&shim) {
        let key = shim.param_key(name.as_str());
        assert_eq!(averages[&key].data, values, "{name}");
        assert_eq!(optimizer.nr_update[&key], DEFAULT_INIT_STEPS);
    }
}

#[test]
fn test_second_average_lands_between() {
    let mut shim = mlp(11);
    let mut optimizer = Optimizer::adam(0.01);
    shim.update_averages(&mut optimizer).unwrap();
    let first = snapshot(&shim);

    let shifted: StateDict = shim
        .model()
        .state_dict()
        .into_iter()
        .map(|(name, t)| {
            let data = t.to_vec().into_iter().map(|v| v + 1.0).collect();
            (name, Tensor::from_vec(t.shape(), data).unwrap())
        })
        .collect();
    shim.model_mut().load_state_dict(&shifted, true).unwrap();
    shim.update_averages(&mut optimizer).unwrap();

    let averages = optimizer.averages.as_ref().unwrap();
    for (name, old) in first {
        let key = shim.param_key(name.as_str());
        assert_eq!(optimizer.nr_update[&key], 2);
        for (avg, old) in averages[&key].data.iter().zip(old) {
            assert!(*avg > old && *avg < old + 1.0, "{name}: {avg} not in ({old}, {})", old + 1.0);
        }
    }
}

#[test]
fn test_init_steps_sets_starting_count() {
    let shim = mlp(12);
    let mut optimizer = Optimizer::adam(0.01);
    shim.update_averages_with(&mut optimizer, 5).unwrap();
    shim.update_averages(&mut optimizer).unwrap();

    let key = shim.param_key("0.weight");
    assert_eq!(optimizer.nr_update[&key], 6);
}

#[test]
fn test_averaging_disabled() {
    let mut shim = mlp(13);
    let mut optimizer = Optimizer::sgd(0.1);
    optimizer.averages = None;
    train_step(&mut shim, &mut optimizer, 1);
    assert!(optimizer.averages.is_none());
    assert!(optimizer.nr_update.is_empty());
}

#[test]
fn test_shims_share_one_optimizer() {
    let mut a = mlp(14);
    let mut b = mlp(14);
    let mut optimizer = Optimizer::adam(0.01);
    train_step(&mut a, &mut optimizer, 1);
    train_step(&mut b, &mut optimizer, 1);

    let averages = optimizer.averages.as_ref().unwrap();
    assert_eq!(averages.len(), 8);
    assert!(averages.contains_key(&a.param_key("0.weight")));
    assert!(averages.contains_key(&b.param_key("0.weight")));
}

// ============================================================================
// Scoped Parameters
// ============================================================================

fn filled(shim: &DiffShim, value: f32) -> HashMap<ParamKey, Array> {
    shim.model()
        .state_dict()
        .into_iter()
        .map(|(name, t)| (shim.param_key(name), Array::full(t.shape(), value)))
        .collect()
}

#[test]
fn test_use_params_substitutes_and_restores() {
    let mut shim = mlp(15);
    let before = snapshot(&shim);
    let params = filled(&shim, 0.5);

    let seen = shim
        .use_params(&params, |inner| {
            let x = Tensor::from_vec(vec![1, 3], vec![1.0; 3]).unwrap();
            let y = inner.predict(&ArgsKwargs::from_tensors([x])).unwrap();
            (snapshot(inner), y.into_tensor().unwrap().to_vec())
        })
        .unwrap();

    assert!(seen.0.iter().all(|(_, values)| values.iter().all(|v| *v == 0.5)));
    // Every unit is 0.5 * 3 + 0.5 = 2, the output is 0.5 * 8 * 2 + 0.5.
    assert_eq!(seen.1, vec![8.5, 8.5]);
    assert_eq!(snapshot(&shim), before);
}

#[test]
fn test_use_params_restores_after_panic() {
    let mut shim = mlp(16);
    let before = snapshot(&shim);
    let params = filled(&shim, -1.0);

    let result = catch_unwind(AssertUnwindSafe(|| {
        shim.use_params(&params, |_| -> usize { panic!("evaluation failed") }).ok();
    }));
    assert!(result.is_err());
    assert_eq!(snapshot(&shim), before);
}

#[test]
fn test_use_params_ignores_other_owners() {
    let mut shim = mlp(17);
    let before = snapshot(&shim);
    let stranger = Id::next();
    let params: HashMap<ParamKey, Array> = shim
        .model()
        .state_dict()
        .into_iter()
        .map(|(name, t)| (ParamKey::new(stranger, name), Array::full(t.shape(), 3.0)))
        .collect();

    let inside = shim.use_params(&params, |inner| snapshot(inner)).unwrap();
    assert_eq!(inside, before);
}

#[test]
fn test_use_params_partial_substitution() {
    let mut shim = mlp(18);
    let before = snapshot(&shim);
    let params = HashMap::from([(shim.param_key("2.bias"), Array::full(vec![2], 7.0))]);

    let inside = shim.use_params(&params, |inner| snapshot(inner)).unwrap();
    for ((name, live), (_, seen)) in before.iter().zip(&inside) {
        if name == "2.bias" {
            assert_eq!(seen, &vec![7.0, 7.0]);
        } else {
            assert_eq!(seen, live);
        }
    }
    assert_eq!(snapshot(&shim), before);
}

#[test]
fn test_use_params_with_averages() {
    let mut shim = mlp(19);
    let mut optimizer = Optimizer::adam(0.05);
    for seed in 0..3 {
        train_step(&mut shim, &mut optimizer, seed);
    }
    let live = snapshot(&shim);
    let averages = optimizer.averages.clone().unwrap();

    let averaged = shim.use_params(&averages, |inner| snapshot(inner)).unwrap();
    assert_ne!(averaged, live);
    assert_eq!(snapshot(&shim), live);
}

#[test]
fn test_layer_use_params() {
    let mut layer = ShimLayer::new(mlp(20));
    let params = filled(layer.shim(), 0.0);
    let x = Array::randn_seeded(vec![2, 3], 1.0, 3);

    let y = layer.use_params(&params, |l| l.predict(x.clone()).unwrap()).unwrap();
    assert_eq!(y, Array::zeros(vec![2, 2]));
    assert_ne!(layer.predict(x).unwrap(), Array::zeros(vec![2, 2]));
}

// ============================================================================
// Devices
// ============================================================================

#[test]
fn test_to_device_unavailable() {
    set_visible_accelerators(0);
    let mut shim = mlp(21);
    let err = shim.to_device(Device::Gpu(0)).unwrap_err();
    assert!(matches!(diff_error(&err), DiffError::DeviceUnavailable { visible: 0, .. }));
    assert_eq!(shim.model().device(), graft_diff::Device::Cpu);
}

#[test]
fn test_to_device_moves_parameters() {
    set_visible_accelerators(2);
    let mut shim = mlp(22);
    shim.to_device(Device::Gpu(1)).unwrap();
    for param in shim.model().parameters() {
        assert_eq!(graft_shim::Diff::device(&param), Device::Gpu(1));
    }

    shim.to_device(Device::Cpu).unwrap();
    assert_eq!(shim.model().device(), graft_diff::Device::Cpu);
}

// ============================================================================
// Serialization
// ============================================================================

#[test]
fn test_round_trip_after_training() {
    let mut trained = mlp(23);
    let mut optimizer = Optimizer::adam(0.01);
    train_step(&mut trained, &mut optimizer, 1);
    train_step(&mut trained, &mut optimizer, 2);
    let bytes = trained.to_bytes().unwrap();

    let mut fresh = diff_shim(
        Sequential::new()
            .add(Linear::new(3, 8, 99))
            .add(ReLU)
            .add(Linear::new(8, 2, 100)),
        json!(null),
    );
    fresh.from_bytes(&bytes).unwrap();

    assert_eq!(fresh.config(), trained.config());
    let bits = |s: &DiffShim| -> Vec<Vec<u32>> {
        snapshot(s).into_iter().map(|(_, v)| v.iter().map(|x| x.to_bits()).collect()).collect()
    };
    assert_eq!(bits(&fresh), bits(&trained));
    assert_eq!(fresh.to_bytes().unwrap(), bytes);
}

#[test]
fn test_to_bytes_is_deterministic() {
    let shim = mlp(24);
    assert_eq!(shim.to_bytes().unwrap(), shim.to_bytes().unwrap());
}

#[test]
fn test_from_bytes_rejects_other_architecture() {
    let source = diff_shim(
        Sequential::new().add(Linear::new(3, 4, 1)).add(Tanh).add(Linear::new(4, 2, 2)),
        json!({"widths": [3, 4, 2]}),
    );
    let mut target = mlp(25);
    let before = snapshot(&target);

    let Err(err) = target.from_bytes(&source.to_bytes().unwrap()) else {
        panic!("loaded mismatched parameters");
    };
    assert!(matches!(diff_error(&err), DiffError::ShapeMismatch { .. }));
    assert_eq!(snapshot(&target), before);
    assert_eq!(target.config()["activation"], "relu");
}

#[test]
fn test_from_bytes_rejects_malformed_envelope() {
    let mut shim = mlp(26);
    let before = snapshot(&shim);

    let Err(err) = shim.from_bytes(b"definitely not msgpack") else {
        panic!("decoded garbage");
    };
    assert!(matches!(err, ShimError::Decode(_)), "{err}");

    let no_state = rmp_serde::to_vec_named(&json!({"config": {"widths": [1]}})).unwrap();
    let Err(err) = shim.from_bytes(&no_state) else {
        panic!("decoded an envelope without state");
    };
    assert!(matches!(err, ShimError::MissingField("state")), "{err}");

    assert_eq!(snapshot(&shim), before);
    assert_eq!(shim.config()["widths"], json!([3, 8, 2]));
}

#[test]
fn test_from_bytes_rejects_corrupt_state() {
    let mut shim = mlp(27);
    let before = snapshot(&shim);

    #[derive(serde::Serialize)]
    struct Corrupt<'a> {
        config: serde_json::Value,
        #[serde(with = "serde_bytes")]
        state: &'a [u8],
    }
    let bytes = rmp_serde::to_vec_named(&Corrupt {
        config: json!({}),
        state: b"GRAFTDIF but truncated",
    })
    .unwrap();

    let Err(err) = shim.from_bytes(&bytes) else {
        panic!("loaded a corrupt state blob");
    };
    assert!(matches!(err, ShimError::Framework { .. }), "{err}");
    assert_eq!(snapshot(&shim), before);
    assert_eq!(shim.config()["activation"], "relu");
}

/// A one-tensor state blob with a hand-written index entry.
fn state_blob(shape: &[u64], offset: u64, len: u64) -> Vec<u8> {
    let name = b"0.weight";
    let mut index = Vec::new();
    index.extend_from_slice(&1u64.to_le_bytes());
    index.extend_from_slice(&(name.len() as u64).to_le_bytes());
    index.extend_from_slice(name);
    index.extend_from_slice(&(shape.len() as u64).to_le_bytes());
    for d in shape {
        index.extend_from_slice(&d.to_le_bytes());
    }
    index.push(0);
    index.extend_from_slice(&offset.to_le_bytes());
    index.extend_from_slice(&len.to_le_bytes());

    let mut blob = b"GRAFTDIF".to_vec();
    blob.extend_from_slice(&1u32.to_le_bytes());
    blob.extend_from_slice(&(index.len() as u64).to_le_bytes());
    blob.extend_from_slice(&index);
    blob.extend_from_slice(&[0u8; 8]);
    blob
}

#[test]
fn test_from_bytes_rejects_out_of_range_index() {
    let mut shim = mlp(30);
    let before = snapshot(&shim);

    for blob in [
        state_blob(&[2], u64::MAX / 2, 2),
        state_blob(&[1 << 32, 1 << 32, 0], 0, 0),
        state_blob(&[3], 0, 2),
    ] {
        let bytes = graft_shim::envelope::encode(&json!({}), &blob).unwrap();
        let Err(err) = shim.from_bytes(&bytes) else {
            panic!("loaded a state blob with a bad index");
        };
        assert!(matches!(diff_error(&err), DiffError::Format(_)), "{err}");
    }
    assert_eq!(snapshot(&shim), before);
}

#[test]
fn test_from_bytes_on_accelerator_backend() {
    set_visible_accelerators(1);
    let source = mlp(28);
    let bytes = source.to_bytes().unwrap();

    let mut target = mlp(29);
    {
        let _ops = use_ops(GpuOps::new(0));
        target.from_bytes(&bytes).unwrap();
    }
    assert_eq!(target.model().device(), graft_diff::Device::Accelerator(0));
    assert_eq!(snapshot(&target), snapshot(&source));
}

#[test]
fn test_from_bytes_on_accelerator_backend_without_device() {
    set_visible_accelerators(0);
    let bytes = mlp(30).to_bytes().unwrap();
    let mut target = mlp(31);
    let before = snapshot(&target);

    let _ops = use_ops(GpuOps::new(0));
    let Err(err) = target.from_bytes(&bytes) else {
        panic!("loaded onto a missing accelerator");
    };
    assert!(matches!(diff_error(&err), DiffError::DeviceUnavailable { .. }));
    assert_eq!(snapshot(&target), before);
}

// ============================================================================
// Other Frameworks
// ============================================================================

#[cfg(not(feature = "tch"))]
#[test]
fn test_libtorch_unavailable_without_feature() {
    let result = graft_shim::load_script_module("model.pt", json!({}));
    assert!(matches!(result, Err(ShimError::FrameworkUnavailable("libtorch"))));
}
