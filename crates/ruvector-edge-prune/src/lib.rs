//! # Edge Prune
//!
//! Differentiable edge pruning for transformer circuit discovery.
//!
//! Given a frozen transformer and a task, the crate learns a stochastic
//! binary gate on every edge of the model's computational graph: every
//! (upstream component → downstream component input) pair, where the
//! components are the embedding, each attention head and each MLP. A
//! pruned edge is replaced by a learned modal (ablation) value. Training
//! minimises the KL divergence between the pruned and the original
//! model's answer distribution plus a sparsity penalty, so the surviving
//! edges form a small circuit that reproduces the model's behaviour.
//!
//! ## Core Concepts
//!
//! 1. **Edge table** ([`EdgeLayout`]) - fixed indexed layout of every causal edge
//! 2. **Mask sampler** ([`HardConcreteSampler`]) - hard-concrete gate per edge with a
//!    closed-form sparsity penalty; fixed-mask baselines share the [`MaskSource`] contract
//! 3. **Edge patcher** ([`EdgePatcher`]) - rebuilds every component input from
//!    cached upstream outputs, gates and modal values
//! 4. **Trainer** ([`CircuitTrainer`]) - KL objective, optimizers, checkpoints and
//!    convergence-based early termination
//!
//! ## Example
//!
//! ```rust,no_run
//! use ruvector_edge_prune::prelude::*;
//!
//! # fn main() -> ruvector_edge_prune::Result<()> {
//! let mut ctx = ExecContext::cpu(0);
//! let model = CircuitTransformer::random(TransformerConfig::toy(), 0.02, &mut ctx)?;
//! let geometry = model.config().geometry();
//! let layout = EdgeLayout::new(geometry);
//!
//! let cfg = PruningConfig::toy(geometry);
//! let sampler = HardConcreteSampler::new(layout.clone(), &cfg, &ctx)?;
//! let patcher = EdgePatcher::new(&model, layout, &cfg)?;
//! let task = SyntheticTask::new(cfg.batch_size, 8, model.config().d_vocab, 1, ctx.device.clone())?;
//!
//! let mut trainer = CircuitTrainer::new(&model, sampler, patcher, cfg, ctx)?;
//! let summary = trainer.train(task)?;
//! let circuit = trainer.sampler().circuit(0.5)?;
//! println!("{} steps, {} edges kept", summary.steps, circuit.len());
//! # Ok(())
//! # }
//! ```

pub mod artifacts;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod data;
pub mod early_term;
pub mod edges;
pub mod error;
pub mod log;
pub mod model;
pub mod optim;
pub mod patcher;
pub mod sampler;
pub mod trainer;

// Re-exports for convenient access
pub use cache::ActivationCache;
pub use checkpoint::{Checkpoint, CheckpointMeta, RunDirectory};
pub use config::{
    EarlyTermConfig, ModalGradientPolicy, PruningConfig, TempSchedule, ABLATION_THRESHOLD,
    DEFAULT_SHARPNESS,
};
pub use context::ExecContext;
pub use data::{SyntheticTask, TaskBatch};
pub use early_term::{EarlyTermination, Verdict};
pub use edges::{
    AttnStream, Destination, Edge, EdgeKind, EdgeLayout, EdgeType, MaskGroup, ModelGeometry,
    Source,
};
pub use error::{Error, Result};
pub use log::{TrainingLog, Trend};
pub use model::{CircuitTransformer, ForwardTap, NoTap, TransformerConfig};
pub use optim::AdamW;
pub use patcher::{last_token_mask, EdgePatcher, PatchTap, ReferenceTap};
pub use sampler::{
    AttributionPatchingMaskSampler, ConstantMaskSampler, HardConcreteSampler, MaskLoss,
    MaskParameters, MaskSource, MultiComponentMaskSampler, SingleComponentMaskSampler,
};
pub use trainer::{CircuitTrainer, StepOutput, StepReport, TrainSummary};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        CircuitTrainer, CircuitTransformer, ConstantMaskSampler, EdgeLayout, EdgePatcher, Error,
        ExecContext, HardConcreteSampler, MaskSource, ModalGradientPolicy, ModelGeometry,
        PruningConfig, Result, SyntheticTask, TaskBatch, TempSchedule, TransformerConfig,
    };
}

/// Supported model configurations
pub mod configs {
    use super::TransformerConfig;

    /// Toy configuration for tests and smoke runs
    /// - Layers: 2
    /// - Heads: 2
    /// - Hidden size: 16
    pub fn toy() -> TransformerConfig {
        TransformerConfig::toy()
    }

    /// GPT-2 small geometry
    /// - Layers: 12
    /// - Heads: 12
    /// - Hidden size: 768
    pub fn gpt2_small() -> TransformerConfig {
        TransformerConfig::gpt2_small()
    }
}
