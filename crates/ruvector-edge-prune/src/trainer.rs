//! Circuit trainer.
//!
//! Drives one pruning run: per step it samples a mask, runs the patched
//! forward pass over `n_samples` copies of the batch and an unpatched
//! reference pass (or, with `parallel_inference`, one extra all-on copy of
//! the batch in the same pass), computes the KL divergence between the two answer
//! distributions, adds the sampler's regularisation loss and updates the
//! mask parameters and modal values with separate optimizers.
//!
//! Every `record_every` steps the trainer writes diagnostics, saves a
//! checkpoint and runs the early-termination check.

use std::collections::HashMap;
use std::time::Instant;

use candle_core::{DType, Tensor, Var, D};
use candle_nn::ops::log_softmax;

use crate::artifacts::{write_json, Histogram};
use crate::cache::ActivationCache;
use crate::checkpoint::{Checkpoint, CheckpointMeta, RunDirectory};
use crate::config::PruningConfig;
use crate::context::ExecContext;
use crate::data::TaskBatch;
use crate::early_term::{EarlyTermination, KL_COLUMN};
use crate::error::{Error, Result};
use crate::log::TrainingLog;
use crate::model::CircuitTransformer;
use crate::optim::AdamW;
use crate::patcher::{last_token_mask, EdgePatcher, ReferenceTap};
use crate::sampler::{MaskLoss, MaskSource};

const SAMPLING_STATE: &str = "optim.sampling";
const MODAL_STATE: &str = "optim.modal";

/// Tensors of one forward pass.
#[derive(Debug)]
pub struct StepOutput {
    /// KL plus regularisation, attached to the autodiff graph
    pub loss: Tensor,
    /// KL divergence per sample and example, `(n_samples, batch)`
    pub kl_losses: Tensor,
    /// Mean KL divergence
    pub kl: f64,
    /// Sampler loss and metrics
    pub mask: MaskLoss,
}

/// Host-side summary of one optimisation step.
#[derive(Debug, Clone)]
pub struct StepReport {
    /// Mean KL divergence
    pub kl: f64,
    /// Total loss
    pub loss: f64,
    /// L1 change of the mask locations
    pub step_size: f64,
    /// Mean L2 change of the modal value rows
    pub mode_step_size: f64,
    /// Per-sample KL values
    pub kl_values: Vec<f32>,
    /// Whether every mask parameter is finite after the update
    pub finite: bool,
}

/// Outcome of [`CircuitTrainer::train`].
#[derive(Debug, Clone)]
pub struct TrainSummary {
    /// Logged steps at exit
    pub steps: usize,
    /// Whether early termination fired
    pub halted_early: bool,
    /// Last logged KL
    pub final_kl: Option<f64>,
}

fn scalar(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}

fn l1_distance(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs() as f64).sum()
}

/// Host copy of the location column of a sampler's parameters. Read
/// eagerly: optimizer updates write through to the parameter storage.
fn locations<S: MaskSource>(sampler: &S) -> Result<Option<Vec<f32>>> {
    match sampler.sampling_params() {
        Some(params) => Ok(Some(
            params.narrow(1, 0, 1)?.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?,
        )),
        None => Ok(None),
    }
}

fn mean_row_distance(a: &[Vec<f32>], b: &[Vec<f32>]) -> f64 {
    if a.is_empty() {
        return 0.0;
    }
    let total: f64 = a
        .iter()
        .zip(b)
        .map(|(ra, rb)| {
            ra.iter()
                .zip(rb)
                .map(|(x, y)| ((x - y) as f64).powi(2))
                .sum::<f64>()
                .sqrt()
        })
        .sum();
    total / a.len() as f64
}

/// Trains a mask over the edges of a frozen model.
pub struct CircuitTrainer<'m, S: MaskSource> {
    model: &'m CircuitTransformer,
    cfg: PruningConfig,
    ctx: ExecContext,
    sampler: S,
    patcher: EdgePatcher,
    cache: ActivationCache,
    log: TrainingLog,
    step_log: TrainingLog,
    sampling_optim: AdamW,
    modal_optim: AdamW,
    early_term: EarlyTermination,
    run_dir: RunDirectory,
    pause_log: bool,
}

impl<'m, S: MaskSource> CircuitTrainer<'m, S> {
    /// Build a trainer, resuming from `cfg.folder` or warm-starting from
    /// `cfg.pretrained` when configured.
    pub fn new(
        model: &'m CircuitTransformer,
        sampler: S,
        patcher: EdgePatcher,
        cfg: PruningConfig,
        ctx: ExecContext,
    ) -> Result<Self> {
        cfg.validate()?;
        let geometry = model.config().geometry();
        if cfg.geometry != geometry || patcher.layout().geometry() != geometry {
            return Err(Error::BadConfig(format!(
                "config {:?} / patcher {:?} do not match model {geometry:?}",
                cfg.geometry,
                patcher.layout().geometry()
            )));
        }

        let mut columns = vec![KL_COLUMN];
        columns.extend_from_slice(sampler.log_columns());
        let sampling_optim = AdamW::with_lr(sampler.named_vars(), cfg.lr)?;
        let modal_optim = AdamW::with_lr(patcher.named_vars(), cfg.lr_modes)?;

        let mut trainer = Self {
            model,
            ctx,
            sampler,
            patcher,
            cache: ActivationCache::new(),
            log: TrainingLog::new(&columns),
            step_log: TrainingLog::new(&["step_size", "mode_step_size"]),
            sampling_optim,
            modal_optim,
            early_term: EarlyTermination::new(cfg.early_term.clone()),
            run_dir: RunDirectory::open(&cfg.folder),
            pause_log: false,
            cfg,
        };
        trainer.initialize()?;
        Ok(trainer)
    }

    /// Mask sampler
    pub fn sampler(&self) -> &S {
        &self.sampler
    }

    /// Mutable mask sampler
    pub fn sampler_mut(&mut self) -> &mut S {
        &mut self.sampler
    }

    /// Edge patcher
    pub fn patcher(&self) -> &EdgePatcher {
        &self.patcher
    }

    /// Loss and sampler metrics log
    pub fn log(&self) -> &TrainingLog {
        &self.log
    }

    /// Step-size log
    pub fn step_log(&self) -> &TrainingLog {
        &self.step_log
    }

    /// Run configuration
    pub fn config(&self) -> &PruningConfig {
        &self.cfg
    }

    /// Run directory
    pub fn run_dir(&self) -> &RunDirectory {
        &self.run_dir
    }

    /// Stop (or resume) appending forward-pass metrics to the log.
    pub fn set_pause_log(&mut self, pause: bool) {
        self.pause_log = pause;
    }

    /// One patched + reference forward pass.
    pub fn forward(&mut self, batch: &TaskBatch) -> Result<StepOutput> {
        let bsz = batch.batch_size();
        if bsz != self.cfg.batch_size {
            return Err(Error::BadInput(format!(
                "batch of {bsz} examples, configured for {}",
                self.cfg.batch_size
            )));
        }
        self.cache.clear();

        if self.sampler.use_temperature() {
            self.sampler.set_temp_c(self.cfg.temp_schedule.at(self.log.t()));
        }
        let mask = self.sampler.forward(&mut self.ctx)?;
        let gates = self
            .sampler
            .sampled_mask()
            .ok_or(Error::MissingMask("sampler produced no mask"))?;
        let expected = [self.cfg.total_samples(), self.patcher.layout().n_edges()];
        if gates.dims() != expected {
            return Err(Error::BadInput(format!(
                "sampled mask has shape {:?}, expected {expected:?}",
                gates.dims()
            )));
        }

        let answer_mask = last_token_mask(
            &batch.answer_positions,
            batch.seq_len()?,
            self.model.dtype(),
            self.model.device(),
        )?;
        let (pruned, reference) = if self.cfg.parallel_inference {
            // Slice 0 runs with every gate on, which reproduces the model.
            let n_edges = self.patcher.layout().n_edges();
            let on = Tensor::ones((bsz, n_edges), gates.dtype(), gates.device())?;
            let gates = Tensor::cat(&[&on, gates], 0)?;
            let repeated = batch.tokens.repeat((self.cfg.n_samples + 1, 1))?;
            let out = {
                let mut tap = self.patcher.tap(&mut self.cache, &gates, &answer_mask);
                self.model.forward_with(&repeated, &mut tap)?
            };
            let reference = out.narrow(0, 0, 1)?.detach();
            (out.narrow(0, 1, self.cfg.n_samples)?, reference)
        } else {
            let repeated = batch.tokens.repeat((self.cfg.n_samples, 1))?;
            let pruned = {
                let mut tap = self.patcher.tap(&mut self.cache, gates, &answer_mask);
                self.model.forward_with(&repeated, &mut tap)?
            };
            let reference = self
                .model
                .forward_with(&batch.tokens, &mut ReferenceTap::new(&answer_mask))?
                .detach();
            (pruned, reference)
        };

        let ref_logp = log_softmax(&reference, D::Minus1)?;
        let pruned_logp = log_softmax(&pruned, D::Minus1)?;
        let kl_losses = ref_logp
            .exp()?
            .broadcast_mul(&ref_logp.broadcast_sub(&pruned_logp)?)?
            .sum(D::Minus1)?;
        let kl_mean = kl_losses.mean_all()?;
        let kl = scalar(&kl_mean)?;
        let loss = match &mask.loss {
            Some(l) => (&kl_mean + l)?,
            None => kl_mean,
        };

        if !self.pause_log {
            let mut entry = vec![(KL_COLUMN, kl)];
            entry.extend(mask.details.iter().copied());
            self.log.add_entry(&entry);
        }

        Ok(StepOutput {
            loss,
            kl_losses,
            kl,
            mask,
        })
    }

    /// Forward, backward and one update of both optimizers.
    pub fn train_step(&mut self, batch: &TaskBatch) -> Result<StepReport> {
        let started = Instant::now();
        let out = self.forward(batch)?;
        let forward_ms = started.elapsed().as_secs_f64() * 1e3;

        let grads = out.loss.backward()?;
        let backward_ms = started.elapsed().as_secs_f64() * 1e3 - forward_ms;

        let prev_locations = locations(&self.sampler)?;
        let prev_modes = self.patcher.mode_rows()?;
        self.sampling_optim.step(&grads)?;
        self.modal_optim.step(&grads)?;
        let finite = self.sampler.fix_nans()?;
        if !finite {
            tracing::warn!(step = self.log.t(), "mask parameters remain non-finite after repair");
        }

        let step_size = match (prev_locations, locations(&self.sampler)?) {
            (Some(a), Some(b)) => l1_distance(&a, &b),
            _ => 0.0,
        };
        let mode_step_size = mean_row_distance(&prev_modes, &self.patcher.mode_rows()?);
        self.step_log
            .add_entry(&[("step_size", step_size), ("mode_step_size", mode_step_size)]);

        tracing::debug!(
            step = self.log.t(),
            kl = out.kl,
            forward_ms,
            backward_ms,
            total_ms = started.elapsed().as_secs_f64() * 1e3,
            "train step"
        );

        Ok(StepReport {
            kl: out.kl,
            loss: scalar(&out.loss)?,
            step_size,
            mode_step_size,
            kl_values: out.kl_losses.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?,
            finite,
        })
    }

    /// Train until `max_steps` logged steps or early termination.
    pub fn train<I>(&mut self, batches: I) -> Result<TrainSummary>
    where
        I: IntoIterator<Item = Result<TaskBatch>>,
    {
        let mut batches = batches.into_iter();
        self.pause_log = false;
        let span = tracing::info_span!("train", lamb = self.cfg.lamb, folder = %self.cfg.folder.display());
        let _guard = span.enter();
        let mut halted_early = false;

        tracing::info!(
            start = self.log.t(),
            max_steps = self.cfg.max_steps,
            edges = self.patcher.layout().n_edges(),
            lr = self.sampling_optim.learning_rate(),
            lr_modes = self.modal_optim.learning_rate(),
            parallel = self.cfg.parallel_inference,
            "starting edge pruning"
        );

        while self.log.t() < self.cfg.max_steps {
            let batch = batches
                .next()
                .ok_or_else(|| Error::BadInput("batch iterator exhausted".to_string()))??;
            let report = self.train_step(&batch)?;
            let step = self.log.t();
            if step % self.cfg.record_every != 0 {
                continue;
            }

            tracing::info!(
                step,
                kl = report.kl,
                loss = report.loss,
                complexity = self.log.last("complexity_loss").unwrap_or(f64::NAN),
                step_size = report.step_size,
                "recorded step"
            );
            if self.cfg.write_artifacts {
                self.write_artifacts(step, &report)?;
            }

            self.early_term.check(&mut self.log);
            self.snapshot("")?;
            if step % (self.cfg.record_every * self.cfg.checkpoint_every) == 0 {
                self.snapshot(&format!("-{step}"))?;
            }
            if self.early_term.should_stop(&self.log) {
                tracing::info!(step, count = self.log.early_term_count, "early termination");
                self.snapshot("-final")?;
                halted_early = true;
                break;
            }
        }

        Ok(TrainSummary {
            steps: self.log.t(),
            halted_early,
            final_kl: self.log.last(KL_COLUMN),
        })
    }

    fn write_artifacts(&self, step: usize, report: &StepReport) -> Result<()> {
        let dir = self.run_dir.root().join("artifacts");
        std::fs::create_dir_all(&dir)?;
        write_json(
            dir.join(format!("kl-{step}.json")),
            &Histogram::from_values(&report.kl_values, 50),
        )?;
        self.sampler.record_state(step, &dir)
    }

    fn named_vars(&self) -> Vec<(String, Var)> {
        let mut vars = self.sampler.named_vars();
        vars.extend(self.patcher.named_vars());
        vars
    }

    /// Save the current state under `suffix` in the run directory.
    pub fn snapshot(&self, suffix: &str) -> Result<()> {
        let mut tensors: HashMap<String, Tensor> = self
            .named_vars()
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().clone()))
            .collect();
        tensors.extend(self.sampling_optim.state_tensors(SAMPLING_STATE));
        tensors.extend(self.modal_optim.state_tensors(MODAL_STATE));
        let meta = CheckpointMeta::new(
            self.log.clone(),
            self.step_log.clone(),
            self.sampling_optim.step_count(),
            self.modal_optim.step_count(),
        );
        self.run_dir.save(suffix, &tensors, &meta)
    }

    fn initialize(&mut self) -> Result<()> {
        if self.cfg.resume {
            match self.run_dir.load("", self.model.device()) {
                Ok(Some(ckpt)) => match self.restore(&ckpt, true) {
                    Ok(()) => {
                        tracing::info!(step = self.log.t(), "resumed from checkpoint");
                        return Ok(());
                    }
                    Err(e) => tracing::warn!(error = %e, "checkpoint incompatible, starting fresh"),
                },
                Ok(None) => tracing::debug!("no checkpoint found, starting fresh"),
                Err(e) => tracing::warn!(error = %e, "checkpoint unreadable, starting fresh"),
            }
        }

        if let Some(dir) = self.cfg.pretrained.clone() {
            let ckpt = RunDirectory::open(&dir)
                .load("", self.model.device())?
                .ok_or_else(|| Error::Checkpoint(format!("no checkpoint in {}", dir.display())))?;
            self.restore(&ckpt, false)?;
            tracing::info!(from = %dir.display(), "warm-started mask and modal values");
        }
        Ok(())
    }

    /// Apply a checkpoint. Everything is validated before anything is
    /// written, so a failed restore leaves the trainer untouched.
    fn restore(&mut self, ckpt: &Checkpoint, full: bool) -> Result<()> {
        let vars = self.named_vars();
        let mut plan = Vec::with_capacity(vars.len());
        for (name, var) in &vars {
            let t = ckpt
                .tensors
                .get(name)
                .ok_or_else(|| Error::Checkpoint(format!("missing tensor {name}")))?;
            if t.dims() != var.dims() {
                return Err(Error::Checkpoint(format!(
                    "{name} has shape {:?}, expected {:?}",
                    t.dims(),
                    var.dims()
                )));
            }
            plan.push((var, t.to_dtype(var.dtype())?));
        }
        if full {
            self.sampling_optim.check_state(SAMPLING_STATE, &ckpt.tensors)?;
            self.modal_optim.check_state(MODAL_STATE, &ckpt.tensors)?;
        }

        for (var, t) in plan {
            var.set(&t)?;
        }
        if full {
            let meta = &ckpt.meta;
            self.sampling_optim
                .load_state(SAMPLING_STATE, &ckpt.tensors, meta.sampling_optim_step)?;
            self.modal_optim
                .load_state(MODAL_STATE, &ckpt.tensors, meta.modal_optim_step)?;
            self.log = meta.log.clone();
            self.step_log = meta.step_log.clone();
        }
        Ok(())
    }
}
