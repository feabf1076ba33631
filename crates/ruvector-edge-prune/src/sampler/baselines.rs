//! Fixed and subset-sampled masks for ablation baselines.
//!
//! None of these samplers contribute a regularisation loss or trainable
//! parameters to the sampling optimizer. Gradients with respect to the
//! attribution weights or the component perturbation are read directly from
//! the [`GradStore`] of a backward pass.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use rand::seq::index::sample;
use rand::Rng;

use super::{MaskLoss, MaskSource};
use crate::config::PruningConfig;
use crate::context::ExecContext;
use crate::edges::EdgeLayout;
use crate::error::{Error, Result};

/// Externally supplied mask, returned unchanged on every pass.
#[derive(Debug, Default)]
pub struct ConstantMaskSampler {
    mask: Option<Tensor>,
}

impl ConstantMaskSampler {
    /// Sampler with no mask yet; [`set_mask`](Self::set_mask) before use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sampler holding `mask` (`(n_samples * batch, N)`).
    pub fn with_mask(mask: Tensor) -> Self {
        Self { mask: Some(mask) }
    }

    /// Same per-edge values for every row.
    pub fn broadcast(layout: &EdgeLayout, values: &[f32], rows: usize, ctx: &ExecContext) -> Result<Self> {
        if values.len() != layout.n_edges() {
            return Err(Error::BadInput(format!(
                "{} edge values for a table of {} edges",
                values.len(),
                layout.n_edges()
            )));
        }
        let row = ctx.tensor_from_vec(values.to_vec(), &[1, values.len()])?;
        Ok(Self::with_mask(row.repeat((rows, 1))?))
    }

    /// Replace the mask
    pub fn set_mask(&mut self, mask: Tensor) {
        self.mask = Some(mask);
    }
}

impl MaskSource for ConstantMaskSampler {
    fn forward(&mut self, _ctx: &mut ExecContext) -> Result<MaskLoss> {
        if self.mask.is_none() {
            return Err(Error::MissingMask("constant sampler has no mask set"));
        }
        Ok(MaskLoss::none())
    }

    fn sampled_mask(&self) -> Option<&Tensor> {
        self.mask.as_ref()
    }
}

/// All-ones weight per edge; the loss gradient with respect to it is the
/// first-order attribution score of each edge.
#[derive(Debug)]
pub struct AttributionPatchingMaskSampler {
    weights: Var,
    total_samples: usize,
    sampled: Option<Tensor>,
}

impl AttributionPatchingMaskSampler {
    /// Ones over the edge table of `cfg`.
    pub fn new(layout: &EdgeLayout, cfg: &PruningConfig, ctx: &ExecContext) -> Result<Self> {
        Ok(Self {
            weights: Var::from_tensor(&ctx.ones(&[layout.n_edges()])?)?,
            total_samples: cfg.total_samples(),
            sampled: None,
        })
    }

    /// The per-edge weight variable
    pub fn weights(&self) -> &Var {
        &self.weights
    }

    /// `∂loss/∂weight` per edge, if the weights took part in the backward pass.
    pub fn attribution_scores(&self, grads: &GradStore) -> Option<Tensor> {
        grads.get(self.weights.as_tensor()).cloned()
    }
}

impl MaskSource for AttributionPatchingMaskSampler {
    fn forward(&mut self, _ctx: &mut ExecContext) -> Result<MaskLoss> {
        let n = self.weights.dim(0)?;
        let mask = self
            .weights
            .as_tensor()
            .unsqueeze(0)?
            .broadcast_as((self.total_samples, n))?;
        self.sampled = Some(mask);
        Ok(MaskLoss::none())
    }

    fn sampled_mask(&self) -> Option<&Tensor> {
        self.sampled.as_ref()
    }
}

/// Sample `k` ablates exactly attention head `k`; every other edge stays on.
///
/// Rows are sample-major, so `n_samples` must equal the total head count.
#[derive(Debug)]
pub struct SingleComponentMaskSampler {
    mask: Tensor,
}

impl SingleComponentMaskSampler {
    /// Build the fixed mask for `cfg`.
    pub fn new(layout: &EdgeLayout, cfg: &PruningConfig, ctx: &ExecContext) -> Result<Self> {
        let total_heads = layout.geometry().total_heads();
        if cfg.n_samples != total_heads {
            return Err(Error::BadConfig(format!(
                "single-component ablation needs n_samples = {total_heads} (one per head), got {}",
                cfg.n_samples
            )));
        }
        let bsz = cfg.batch_size;
        let rows = total_heads * bsz;
        let data: Vec<f32> = (0..rows)
            .flat_map(|r| (0..total_heads).map(move |k| if k == r / bsz { 0.0 } else { 1.0 }))
            .collect();
        let heads = ctx.tensor_from_vec(data, &[rows, total_heads])?;
        Ok(Self {
            mask: layout.lift_component_gates(&heads)?,
        })
    }
}

impl MaskSource for SingleComponentMaskSampler {
    fn forward(&mut self, _ctx: &mut ExecContext) -> Result<MaskLoss> {
        Ok(MaskLoss::none())
    }

    fn sampled_mask(&self) -> Option<&Tensor> {
        Some(&self.mask)
    }
}

/// Each pass picks `ceil(prop * total_heads)` random heads per row and
/// replaces their gate with uniform noise, then adds a zero-initialised
/// per-head perturbation whose gradient measures head sensitivity.
#[derive(Debug)]
pub struct MultiComponentMaskSampler {
    layout: EdgeLayout,
    perturbation: Var,
    prop_sample: f64,
    total_samples: usize,
    sampled: Option<Tensor>,
}

impl MultiComponentMaskSampler {
    /// Default fraction of heads perturbed per row
    pub const DEFAULT_PROP: f64 = 0.1;

    /// Build with a sampling proportion in `(0, 1]`.
    pub fn new(layout: EdgeLayout, cfg: &PruningConfig, prop_sample: f64, ctx: &ExecContext) -> Result<Self> {
        if !(prop_sample > 0.0 && prop_sample <= 1.0) {
            return Err(Error::BadConfig(format!(
                "prop_sample must lie in (0, 1], got {prop_sample}"
            )));
        }
        let total_heads = layout.geometry().total_heads();
        Ok(Self {
            layout,
            perturbation: Var::from_tensor(&ctx.zeros(&[total_heads])?)?,
            prop_sample,
            total_samples: cfg.total_samples(),
            sampled: None,
        })
    }

    /// Heads touched per row
    pub fn heads_per_sample(&self) -> usize {
        let total = self.layout.geometry().total_heads() as f64;
        ((self.prop_sample * total).ceil() as usize).max(1)
    }

    /// Per-head perturbation variable
    pub fn perturbation(&self) -> &Var {
        &self.perturbation
    }

    /// `∂loss/∂perturbation` per head.
    pub fn sensitivity(&self, grads: &GradStore) -> Option<Tensor> {
        grads.get(self.perturbation.as_tensor()).cloned()
    }
}

impl MaskSource for MultiComponentMaskSampler {
    fn forward(&mut self, ctx: &mut ExecContext) -> Result<MaskLoss> {
        let total_heads = self.layout.geometry().total_heads();
        let k = self.heads_per_sample();
        let rows = self.total_samples;

        let mut data = vec![1f32; rows * total_heads];
        let rng = ctx.rng();
        for r in 0..rows {
            for head in sample(rng, total_heads, k) {
                data[r * total_heads + head] = rng.gen::<f32>();
            }
        }
        let fixed = ctx.tensor_from_vec(data, &[rows, total_heads])?;
        let heads = fixed.broadcast_add(&self.perturbation.as_tensor().unsqueeze(0)?)?;
        self.sampled = Some(self.layout.lift_component_gates(&heads)?);
        Ok(MaskLoss::none())
    }

    fn sampled_mask(&self) -> Option<&Tensor> {
        self.sampled.as_ref()
    }
}
