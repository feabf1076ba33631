//! Mask samplers.
//!
//! A mask source produces the per-edge gate tensor `(n_samples * batch, N)`
//! consumed by the edge patcher, plus an optional regularisation loss.
//!
//! - [`HardConcreteSampler`] learns a stochastic hard-concrete gate per edge.
//! - [`ConstantMaskSampler`], [`AttributionPatchingMaskSampler`],
//!   [`SingleComponentMaskSampler`] and [`MultiComponentMaskSampler`] are
//!   fixed or subset-sampled baselines for ablation studies.

mod baselines;
mod hard_concrete;

use std::path::Path;

use candle_core::{Tensor, Var};

use crate::context::ExecContext;
use crate::error::Result;

pub use baselines::{
    AttributionPatchingMaskSampler, ConstantMaskSampler, MultiComponentMaskSampler,
    SingleComponentMaskSampler,
};
pub use hard_concrete::{hard_concrete, sigmoid, HardConcreteSampler, MaskParameters};

/// Loss and metrics returned by one sampler step.
#[derive(Debug, Clone, Default)]
pub struct MaskLoss {
    /// Differentiable regularisation loss (absent for fixed baselines)
    pub loss: Option<Tensor>,
    /// Scalar metrics keyed by log column
    pub details: Vec<(&'static str, f64)>,
}

impl MaskLoss {
    /// No loss, no metrics
    pub fn none() -> Self {
        Self::default()
    }

    /// Metric value by column name
    pub fn detail(&self, name: &str) -> Option<f64> {
        self.details.iter().find(|(k, _)| *k == name).map(|(_, v)| *v)
    }
}

/// Common contract of every mask sampler.
pub trait MaskSource {
    /// Produce the mask for the next forward pass and its regularisation loss.
    fn forward(&mut self, ctx: &mut ExecContext) -> Result<MaskLoss>;

    /// Gate tensor `(n_samples * batch, N)` of the most recent [`forward`](Self::forward).
    fn sampled_mask(&self) -> Option<&Tensor>;

    /// Write diagnostic artifacts for a recorded step.
    fn record_state(&self, _step: usize, _dir: &Path) -> Result<()> {
        Ok(())
    }

    /// Metric columns this sampler contributes to the training log.
    fn log_columns(&self) -> &'static [&'static str] {
        &[]
    }

    /// Whether the temperature coefficient schedule applies.
    fn use_temperature(&self) -> bool {
        false
    }

    /// Set the temperature-regularisation coefficient.
    fn set_temp_c(&mut self, _temp_c: f64) {}

    /// Parameters optimized by the sampling optimizer, with checkpoint names.
    fn named_vars(&self) -> Vec<(String, Var)> {
        Vec::new()
    }

    /// Learned `(N, 2)` location/sharpness parameters in edge-table order,
    /// for samplers that have them.
    fn sampling_params(&self) -> Option<Tensor> {
        None
    }

    /// Repair non-finite parameters; returns whether all are finite afterwards.
    fn fix_nans(&mut self) -> Result<bool> {
        Ok(true)
    }
}
