//! Patched forward pass against the unpatched model.
//!
//! With every gate on, the patched pass must reproduce the model's answer
//! logits exactly; with every gate off, it must not depend on the tokens
//! beyond position 0.

use candle_core::{DType, IndexOp, Tensor};
use ruvector_edge_prune::{
    last_token_mask, ActivationCache, CircuitTransformer, EdgeLayout, EdgePatcher, Error,
    ExecContext, PruningConfig, TransformerConfig,
};

const BATCH: usize = 3;
const SEQ: usize = 6;

fn toy_model(seed: u64) -> (CircuitTransformer, ExecContext) {
    let mut ctx = ExecContext::cpu(seed);
    let model = CircuitTransformer::random(TransformerConfig::toy(), 0.1, &mut ctx).unwrap();
    (model, ctx)
}

fn tokens(rows: &[[u32; SEQ]]) -> Tensor {
    let flat: Vec<u32> = rows.iter().flatten().copied().collect();
    Tensor::from_vec(flat, (rows.len(), SEQ), &candle_core::Device::Cpu).unwrap()
}

fn batch_a() -> Tensor {
    tokens(&[[1, 2, 3, 4, 5, 6], [7, 1, 7, 1, 7, 1], [0, 9, 8, 7, 6, 5]])
}

/// Logits `(n_samples, BATCH, V)` of a patched pass with constant gates.
fn patched_logits(
    model: &CircuitTransformer,
    patcher: &EdgePatcher,
    tokens: &Tensor,
    gate_value: f32,
    n_samples: usize,
) -> ruvector_edge_prune::Result<Tensor> {
    let n = patcher.layout().n_edges();
    let gates = Tensor::full(gate_value, (n_samples * BATCH, n), &candle_core::Device::Cpu)?;
    let answer = last_token_mask(&[SEQ - 1; BATCH], SEQ, DType::F32, model.device())?;
    let mut cache = ActivationCache::new();
    let repeated = tokens.repeat((n_samples, 1))?;
    let mut tap = patcher.tap(&mut cache, &gates, &answer);
    model.forward_with(&repeated, &mut tap)
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

fn check_all_on_reproduces_model(compressed: bool) {
    let (model, _ctx) = toy_model(11);
    let geometry = model.config().geometry();
    let mut cfg = PruningConfig::toy(geometry);
    cfg.cache_compressed_attn = compressed;
    let patcher = EdgePatcher::new(&model, EdgeLayout::new(geometry), &cfg).unwrap();

    let tokens = batch_a();
    let full = model.forward(&tokens).unwrap();
    let expected = full.i((.., SEQ - 1, ..)).unwrap();

    let patched = patched_logits(&model, &patcher, &tokens, 1.0, 2).unwrap();
    assert_eq!(patched.dims(), &[2, BATCH, model.config().d_vocab]);
    for sample in 0..2 {
        let got = patched.i(sample).unwrap();
        let diff = max_abs_diff(&got, &expected);
        assert!(diff < 1e-4, "sample {sample}: max diff {diff}");
    }
}

#[test]
fn test_all_gates_on_matches_model_compressed() {
    check_all_on_reproduces_model(true);
}

#[test]
fn test_all_gates_on_matches_model_uncompressed() {
    check_all_on_reproduces_model(false);
}

#[test]
fn test_compressed_and_uncompressed_agree_under_partial_gates() {
    let (model, _ctx) = toy_model(5);
    let geometry = model.config().geometry();
    let tokens = batch_a();

    let mut outputs = Vec::new();
    for compressed in [true, false] {
        let mut cfg = PruningConfig::toy(geometry);
        cfg.cache_compressed_attn = compressed;
        let patcher = EdgePatcher::new(&model, EdgeLayout::new(geometry), &cfg).unwrap();
        outputs.push(patched_logits(&model, &patcher, &tokens, 0.5, 1).unwrap());
    }
    let diff = max_abs_diff(&outputs[0], &outputs[1]);
    assert!(diff < 1e-4, "max diff {diff}");
}

/// Random modal values in `[-1, 1)` for either cache mode.
fn random_modes(model: &CircuitTransformer, ctx: &mut ExecContext, compressed: bool) -> (Tensor, Tensor) {
    let mc = model.config();
    let width = if compressed { mc.d_head } else { mc.d_model };
    let attn = ctx.uniform(&[mc.n_layers, mc.n_heads, width]).unwrap().affine(2.0, -1.0).unwrap();
    let mlp = ctx.uniform(&[mc.n_layers + 1, mc.d_model]).unwrap().affine(2.0, -1.0).unwrap();
    (attn, mlp)
}

#[test]
fn test_all_gates_off_ignores_tokens_after_first() {
    let (model, mut ctx) = toy_model(3);
    let geometry = model.config().geometry();
    let a = batch_a();
    // Same first token per row, everything after it different.
    let b = tokens(&[[1, 9, 9, 9, 9, 9], [7, 2, 3, 4, 5, 6], [0, 0, 0, 1, 1, 1]]);

    for compressed in [true, false] {
        let mut cfg = PruningConfig::toy(geometry);
        cfg.cache_compressed_attn = compressed;
        let (attn, mlp) = random_modes(&model, &mut ctx, compressed);
        let patcher =
            EdgePatcher::with_modes(&model, EdgeLayout::new(geometry), &cfg, &attn, &mlp).unwrap();

        let out_a = patched_logits(&model, &patcher, &a, 0.0, 1).unwrap();
        let out_b = patched_logits(&model, &patcher, &b, 0.0, 1).unwrap();
        let diff = max_abs_diff(&out_a, &out_b);
        assert!(diff < 1e-5, "compressed={compressed}: max diff {diff}");

        // The ablated output is carried by the modal values.
        let (attn2, mlp2) = random_modes(&model, &mut ctx, compressed);
        let other =
            EdgePatcher::with_modes(&model, EdgeLayout::new(geometry), &cfg, &attn2, &mlp2).unwrap();
        let out_other = patched_logits(&model, &other, &a, 0.0, 1).unwrap();
        assert!(max_abs_diff(&out_a, &out_other) > 1e-3, "compressed={compressed}");

        let on = patched_logits(&model, &patcher, &a, 1.0, 1).unwrap();
        assert!(max_abs_diff(&out_a, &on) > 1e-3, "compressed={compressed}");
    }
}

#[test]
fn test_mismatched_gate_rows_is_shape_mismatch() {
    let (model, _ctx) = toy_model(1);
    let geometry = model.config().geometry();
    let cfg = PruningConfig::toy(geometry);
    let patcher = EdgePatcher::new(&model, EdgeLayout::new(geometry), &cfg).unwrap();

    let tokens = batch_a();
    let n = patcher.layout().n_edges();
    let gates = Tensor::ones((BATCH + 1, n), DType::F32, &candle_core::Device::Cpu).unwrap();
    let answer = last_token_mask(&[SEQ - 1; BATCH], SEQ, DType::F32, model.device()).unwrap();
    let mut cache = ActivationCache::new();
    let mut tap = patcher.tap(&mut cache, &gates, &answer);
    let err = model.forward_with(&tokens, &mut tap).unwrap_err();
    match err {
        Error::ShapeMismatch { site, shapes, .. } => {
            assert!(site.starts_with("attn 0"), "site {site}");
            assert!(shapes.contains("gates=[4,"), "shapes {shapes}");
        }
        other => panic!("expected a shape mismatch, got {other:?}"),
    }
}

#[test]
fn test_wrong_edge_count_is_rejected() {
    let (model, _ctx) = toy_model(1);
    let geometry = model.config().geometry();
    let cfg = PruningConfig::toy(geometry);
    let patcher = EdgePatcher::new(&model, EdgeLayout::new(geometry), &cfg).unwrap();

    let n = patcher.layout().n_edges();
    let gates = Tensor::ones((BATCH, n - 1), DType::F32, &candle_core::Device::Cpu).unwrap();
    let answer = last_token_mask(&[SEQ - 1; BATCH], SEQ, DType::F32, model.device()).unwrap();
    let mut cache = ActivationCache::new();
    let mut tap = patcher.tap(&mut cache, &gates, &answer);
    let err = model.forward_with(&batch_a(), &mut tap).unwrap_err();
    match err {
        Error::ShapeMismatch { site, shapes, source } => {
            assert!(site.starts_with("attn 0"), "site {site}");
            assert!(shapes.contains(&format!("gates=[{BATCH}, {}]", n - 1)), "shapes {shapes}");
            assert!(shapes.contains("w_o="), "shapes {shapes}");
            assert!(source.to_string().contains("edges"), "{source}");
        }
        other => panic!("expected a shape mismatch, got {other:?}"),
    }
}

#[test]
fn test_mean_ablation_modes_fit_patcher() {
    let (model, _ctx) = toy_model(2);
    let geometry = model.config().geometry();
    for compressed in [true, false] {
        let mut cfg = PruningConfig::toy(geometry);
        cfg.cache_compressed_attn = compressed;
        let (attn, mlp) = EdgePatcher::estimate_modes(&model, &batch_a(), compressed).unwrap();
        let patcher =
            EdgePatcher::with_modes(&model, EdgeLayout::new(geometry), &cfg, &attn, &mlp).unwrap();
        let out = patched_logits(&model, &patcher, &batch_a(), 0.0, 1).unwrap();
        assert!(out
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
            .iter()
            .all(|v| v.is_finite()));
    }
}
