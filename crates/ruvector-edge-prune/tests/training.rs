//! End-to-end training runs on the toy model.

use std::path::Path;

use ruvector_edge_prune::prelude::*;
use ruvector_edge_prune::{MultiComponentMaskSampler, RunDirectory, SingleComponentMaskSampler};

const SEQ: usize = 6;

fn toy_model() -> CircuitTransformer {
    let mut ctx = ExecContext::cpu(42);
    CircuitTransformer::random(TransformerConfig::toy(), 0.1, &mut ctx).unwrap()
}

fn toy_config(model: &CircuitTransformer, folder: &Path) -> PruningConfig {
    let mut cfg = PruningConfig::toy(model.config().geometry());
    cfg.folder = folder.to_path_buf();
    cfg
}

fn task(model: &CircuitTransformer, cfg: &PruningConfig) -> SyntheticTask {
    SyntheticTask::new(cfg.batch_size, SEQ, model.config().d_vocab, 7, model.device().clone())
        .unwrap()
}

fn hard_concrete_trainer<'m>(
    model: &'m CircuitTransformer,
    cfg: PruningConfig,
) -> CircuitTrainer<'m, HardConcreteSampler> {
    let ctx = ExecContext::cpu(3);
    let layout = EdgeLayout::new(model.config().geometry());
    let sampler = HardConcreteSampler::new(layout.clone(), &cfg, &ctx).unwrap();
    let patcher = EdgePatcher::new(model, layout, &cfg).unwrap();
    CircuitTrainer::new(model, sampler, patcher, cfg, ctx).unwrap()
}

fn mean(values: &[f32]) -> f32 {
    values.iter().sum::<f32>() / values.len() as f32
}

#[test]
fn test_zero_penalty_keeps_edges() {
    let dir = tempfile::tempdir().unwrap();
    let model = toy_model();
    let mut cfg = toy_config(&model, dir.path());
    cfg.lamb = 0.0;
    cfg.init_location = 0.0;
    cfg.max_steps = 50;
    let mut tasks = task(&model, &cfg);

    let mut trainer = hard_concrete_trainer(&model, cfg);
    let before = trainer.sampler().gate_probabilities().unwrap();
    let summary = trainer.train(&mut tasks).unwrap();
    assert_eq!(summary.steps, 50);
    assert!(!summary.halted_early);
    assert!(summary.final_kl.unwrap().is_finite());

    // Without a penalty the only pressure is fidelity: KL falls and the
    // mask opens up on average.
    let kl = trainer.log().series("kl_loss").unwrap();
    let early = kl[..5].iter().sum::<f64>() / 5.0;
    let late = kl[40..].iter().sum::<f64>() / 10.0;
    assert!(late < early, "kl {early} -> {late}");

    let after = trainer.sampler().gate_probabilities().unwrap();
    assert!(mean(&after) > mean(&before), "mean gate probability {} -> {}", mean(&before), mean(&after));
}

#[test]
fn test_zero_penalty_from_default_prior_stays_faithful() {
    let dir = tempfile::tempdir().unwrap();
    let model = toy_model();
    let mut cfg = toy_config(&model, dir.path());
    cfg.lamb = 0.0;
    cfg.max_steps = 30;
    let mut tasks = task(&model, &cfg);

    let mut trainer = hard_concrete_trainer(&model, cfg);
    trainer.train(&mut tasks).unwrap();
    let kl = trainer.log().series("kl_loss").unwrap();
    let late = kl[20..].iter().sum::<f64>() / 10.0;
    assert!(late < 0.01, "late kl {late}");
    assert!(mean(&trainer.sampler().gate_probabilities().unwrap()) > 0.9);
}

#[test]
fn test_high_penalty_prunes_edges() {
    let dir = tempfile::tempdir().unwrap();
    let model = toy_model();
    let mut cfg = toy_config(&model, dir.path());
    cfg.lamb = 100.0;
    cfg.lr = 0.2;
    cfg.max_steps = 50;
    let mut tasks = task(&model, &cfg);

    let mut trainer = hard_concrete_trainer(&model, cfg);
    trainer.train(&mut tasks).unwrap();

    let probs = trainer.sampler().gate_probabilities().unwrap();
    assert!(mean(&probs) < 0.1, "mean gate probability {}", mean(&probs));
    let circuit = trainer.sampler().circuit(0.5).unwrap();
    assert!(circuit.len() < trainer.patcher().layout().n_edges() / 4);

    // Complexity column tracks the penalty going down.
    let series = trainer.log().series("complexity_loss").unwrap();
    assert!(series.last().unwrap() < series.first().unwrap());
}

#[test]
fn test_train_step_reports() {
    let dir = tempfile::tempdir().unwrap();
    let model = toy_model();
    let cfg = toy_config(&model, dir.path());
    let mut tasks = task(&model, &cfg);
    let n_rows = cfg.total_samples();

    let mut trainer = hard_concrete_trainer(&model, cfg);
    let batch = tasks.next_batch().unwrap();
    let report = trainer.train_step(&batch).unwrap();
    assert!(report.finite);
    assert!(report.kl >= -1e-6);
    assert!(report.loss >= report.kl);
    assert_eq!(report.kl_values.len(), n_rows);
    assert!(report.step_size > 0.0);
    assert_eq!(trainer.log().t(), 1);
    assert_eq!(trainer.step_log().t(), 1);
}

#[test]
fn test_forward_rejects_wrong_batch_size() {
    let dir = tempfile::tempdir().unwrap();
    let model = toy_model();
    let cfg = toy_config(&model, dir.path());
    let mut other = SyntheticTask::new(cfg.batch_size + 1, SEQ, 24, 1, model.device().clone()).unwrap();

    let mut trainer = hard_concrete_trainer(&model, cfg);
    let err = trainer.forward(&other.next_batch().unwrap()).unwrap_err();
    assert!(matches!(err, Error::BadInput(_)));
}

#[test]
fn test_pause_log_skips_entries() {
    let dir = tempfile::tempdir().unwrap();
    let model = toy_model();
    let cfg = toy_config(&model, dir.path());
    let mut tasks = task(&model, &cfg);

    let mut trainer = hard_concrete_trainer(&model, cfg);
    trainer.set_pause_log(true);
    trainer.forward(&tasks.next_batch().unwrap()).unwrap();
    assert_eq!(trainer.log().t(), 0);
}

#[test]
fn test_resume_continues_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let model = toy_model();
    let mut cfg = toy_config(&model, dir.path());
    cfg.resume = true;
    cfg.max_steps = 20;

    let first_params = {
        let mut tasks = task(&model, &cfg);
        let mut trainer = hard_concrete_trainer(&model, cfg.clone());
        trainer.train(&mut tasks).unwrap();
        trainer.sampler().params().to_rows().unwrap()
    };
    let run = RunDirectory::open(dir.path());
    assert!(run.exists(""));
    assert!(run.exists("-20"));
    assert!(!run.exists("-final"));

    cfg.max_steps = 30;
    let mut tasks = task(&model, &cfg);
    let mut trainer = hard_concrete_trainer(&model, cfg);
    assert_eq!(trainer.log().t(), 20);
    assert_eq!(trainer.sampler().params().to_rows().unwrap(), first_params);

    let summary = trainer.train(&mut tasks).unwrap();
    assert_eq!(summary.steps, 30);
    assert_eq!(trainer.log().series("kl_loss").unwrap().len(), 30);
}

#[test]
fn test_corrupt_checkpoint_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let model = toy_model();
    let mut cfg = toy_config(&model, dir.path());
    cfg.resume = true;
    std::fs::write(dir.path().join("snapshot.safetensors"), b"not a tensor file").unwrap();
    std::fs::write(dir.path().join("metadata.json"), b"{}").unwrap();

    let trainer = hard_concrete_trainer(&model, cfg);
    assert_eq!(trainer.log().t(), 0);
}

#[test]
fn test_pretrained_warm_start() {
    let source = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let model = toy_model();

    let mut cfg = toy_config(&model, source.path());
    cfg.max_steps = 10;
    let trained = {
        let mut tasks = task(&model, &cfg);
        let mut trainer = hard_concrete_trainer(&model, cfg.clone());
        trainer.train(&mut tasks).unwrap();
        trainer.sampler().params().to_rows().unwrap()
    };

    cfg.folder = target.path().to_path_buf();
    cfg.pretrained = Some(source.path().to_path_buf());
    let trainer = hard_concrete_trainer(&model, cfg.clone());
    assert_eq!(trainer.sampler().params().to_rows().unwrap(), trained);
    // Warm start copies parameters, not the log.
    assert_eq!(trainer.log().t(), 0);

    cfg.pretrained = Some(target.path().join("missing"));
    let ctx = ExecContext::cpu(0);
    let layout = EdgeLayout::new(model.config().geometry());
    let sampler = HardConcreteSampler::new(layout.clone(), &cfg, &ctx).unwrap();
    let patcher = EdgePatcher::new(&model, layout, &cfg).unwrap();
    assert!(CircuitTrainer::new(&model, sampler, patcher, cfg, ctx).is_err());
}

#[test]
fn test_constant_mask_baseline() {
    let dir = tempfile::tempdir().unwrap();
    let model = toy_model();
    let cfg = toy_config(&model, dir.path());
    let mut tasks = task(&model, &cfg);
    let ctx = ExecContext::cpu(0);
    let layout = EdgeLayout::new(model.config().geometry());

    let ones = vec![1.0; layout.n_edges()];
    let sampler = ConstantMaskSampler::broadcast(&layout, &ones, cfg.total_samples(), &ctx).unwrap();
    let patcher = EdgePatcher::new(&model, layout, &cfg).unwrap();
    let mut trainer = CircuitTrainer::new(&model, sampler, patcher, cfg, ctx).unwrap();

    // The unpruned graph reproduces the model, so the KL vanishes.
    let out = trainer.forward(&tasks.next_batch().unwrap()).unwrap();
    assert!(out.kl.abs() < 1e-4, "kl {}", out.kl);
    assert!(out.mask.loss.is_none());
}

#[test]
fn test_parallel_inference_matches_separate_reference() {
    let dir = tempfile::tempdir().unwrap();
    let model = toy_model();
    let mut tasks = task(&model, &toy_config(&model, dir.path()));
    let batch = tasks.next_batch().unwrap();
    let layout = EdgeLayout::new(model.config().geometry());
    let half: Vec<f32> = (0..layout.n_edges()).map(|i| if i % 3 == 0 { 0.0 } else { 0.7 }).collect();

    let mut kls = Vec::new();
    for parallel in [false, true] {
        let mut cfg = toy_config(&model, dir.path());
        cfg.parallel_inference = parallel;
        let ctx = ExecContext::cpu(0);
        let sampler = ConstantMaskSampler::broadcast(&layout, &half, cfg.total_samples(), &ctx).unwrap();
        let patcher = EdgePatcher::new(&model, layout.clone(), &cfg).unwrap();
        let mut trainer = CircuitTrainer::new(&model, sampler, patcher, cfg.clone(), ctx).unwrap();
        let out = trainer.forward(&batch).unwrap();
        assert_eq!(out.kl_losses.dims(), &[cfg.n_samples, cfg.batch_size]);
        assert!(out.kl > 1e-4);
        kls.push(out.kl_losses.flatten_all().unwrap().to_vec1::<f32>().unwrap());
    }
    for (a, b) in kls[0].iter().zip(&kls[1]) {
        assert!((a - b).abs() < 1e-4, "{a} vs {b}");
    }
}

#[test]
fn test_component_baselines_run() {
    let dir = tempfile::tempdir().unwrap();
    let model = toy_model();
    let geometry = model.config().geometry();
    let layout = EdgeLayout::new(geometry);

    let mut cfg = toy_config(&model, dir.path());
    cfg.n_samples = geometry.total_heads();
    let mut tasks = task(&model, &cfg);
    let ctx = ExecContext::cpu(0);
    let sampler = SingleComponentMaskSampler::new(&layout, &cfg, &ctx).unwrap();
    let patcher = EdgePatcher::new(&model, layout.clone(), &cfg).unwrap();
    let mut trainer = CircuitTrainer::new(&model, sampler, patcher, cfg, ctx).unwrap();
    let report = trainer.train_step(&tasks.next_batch().unwrap()).unwrap();
    assert!(report.kl.is_finite());

    let cfg = toy_config(&model, dir.path());
    let ctx = ExecContext::cpu(1);
    let sampler =
        MultiComponentMaskSampler::new(layout.clone(), &cfg, MultiComponentMaskSampler::DEFAULT_PROP, &ctx)
            .unwrap();
    let patcher = EdgePatcher::new(&model, layout, &cfg).unwrap();
    let mut trainer = CircuitTrainer::new(&model, sampler, patcher, cfg, ctx).unwrap();
    let report = trainer.train_step(&tasks.next_batch().unwrap()).unwrap();
    assert!(report.kl.is_finite());
}
