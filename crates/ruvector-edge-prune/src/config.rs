//! Configuration types for edge pruning runs.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::edges::ModelGeometry;
use crate::error::{Error, Result};

/// Default sharpness used both as the initial prior and as the NaN repair value.
pub const DEFAULT_SHARPNESS: f64 = 2.0 / 3.0;

/// Gates below this value count as ablated for the modal gradient policy.
pub const ABLATION_THRESHOLD: f64 = 1e-3;

/// Which samples let the modal (ablation) value receive gradient.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModalGradientPolicy {
    /// Gradient flows only where the gate is below [`ABLATION_THRESHOLD`]
    #[default]
    AblatedOnly,
    /// Gradient flows wherever the modal value contributes
    Always,
    /// Modal values are never updated through the patched pass
    Never,
}

/// Schedule for the temperature-regularisation coefficient `temp_c`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TempSchedule {
    /// Fixed coefficient
    Constant(f64),
    /// Zero until `start_step`, then grows by `slope` per step up to `max`
    LinearRamp {
        /// First step with a non-zero coefficient
        start_step: usize,
        /// Increase per step
        slope: f64,
        /// Ceiling
        max: f64,
    },
}

impl Default for TempSchedule {
    fn default() -> Self {
        TempSchedule::LinearRamp {
            start_step: 300,
            slope: 0.01,
            max: 10.0,
        }
    }
}

impl TempSchedule {
    /// Coefficient at a given log step
    pub fn at(&self, step: usize) -> f64 {
        match *self {
            TempSchedule::Constant(c) => c,
            TempSchedule::LinearRamp {
                start_step,
                slope,
                max,
            } => {
                if step < start_step {
                    0.0
                } else {
                    ((step - start_step) as f64 * slope).min(max)
                }
            }
        }
    }
}

/// Early-termination thresholds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EarlyTermConfig {
    /// Minimum logged steps before the check is active
    pub min_steps: usize,
    /// Number of trailing log entries used for the trend regression
    pub window: usize,
    /// Maximum |relative change| of the KL series over the window
    pub kl_flat: f64,
    /// Maximum relative decline of the complexity series over the window
    pub complexity_decline: f64,
    /// Mean temperature must be below this
    pub temp_ceiling: f64,
    /// Counter value that halts training
    pub threshold: usize,
    /// Counter decrement on a non-converged check
    pub decrement: usize,
}

impl Default for EarlyTermConfig {
    fn default() -> Self {
        Self {
            min_steps: 500,
            window: 100,
            kl_flat: 0.01,
            complexity_decline: 0.03,
            temp_ceiling: 1e-2,
            threshold: 10,
            decrement: 2,
        }
    }
}

/// Hyperparameters of one pruning run.
///
/// Geometry fields are copied from the model; everything else is a
/// training knob.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PruningConfig {
    /// Model depth and width
    pub geometry: ModelGeometry,

    /// Examples per task batch
    pub batch_size: usize,

    /// Stochastic mask samples per example
    pub n_samples: usize,

    /// Sparsity penalty weight (lambda)
    pub lamb: f64,

    /// Report the complexity metric as a mean instead of a sum
    pub complexity_mean: bool,

    /// Learning rate for mask parameters
    pub lr: f64,

    /// Learning rate for modal values
    pub lr_modes: f64,

    /// Hard-concrete stretch interval `(l, r)` with `l < 0 < 1 < r`
    pub hard_concrete_endpoints: (f64, f64),

    /// Initial location prior
    pub init_location: f64,

    /// Initial sharpness prior
    pub init_sharpness: f64,

    /// Temperature-regularisation schedule
    pub temp_schedule: TempSchedule,

    /// Cache per-head `z` and re-project through `W_O` (false: cache projected outputs)
    pub cache_compressed_attn: bool,

    /// Modal value gradient policy
    pub modal_gradient: ModalGradientPolicy,

    /// Fold the reference pass into the patched batch as an extra all-on slice
    #[serde(default)]
    pub parallel_inference: bool,

    /// Steps between recorded snapshots / early-termination checks
    pub record_every: usize,

    /// Recorded steps between step-suffixed checkpoints
    pub checkpoint_every: usize,

    /// Hard cap on training steps
    pub max_steps: usize,

    /// Early-termination thresholds
    pub early_term: EarlyTermConfig,

    /// Run directory for checkpoints and diagnostics
    pub folder: PathBuf,

    /// Resume from checkpoints found in `folder`
    pub resume: bool,

    /// Warm-start mask/modal parameters from another run directory
    pub pretrained: Option<PathBuf>,

    /// Write histogram artifacts when recording
    pub write_artifacts: bool,
}

impl PruningConfig {
    /// Defaults for a model geometry.
    pub fn for_geometry(geometry: ModelGeometry) -> Self {
        Self {
            geometry,
            batch_size: 10,
            n_samples: 12,
            lamb: 100.0,
            complexity_mean: false,
            lr: 0.1,
            lr_modes: 1e-3,
            hard_concrete_endpoints: (-0.1, 1.1),
            init_location: 3.0,
            init_sharpness: DEFAULT_SHARPNESS,
            temp_schedule: TempSchedule::default(),
            cache_compressed_attn: true,
            modal_gradient: ModalGradientPolicy::AblatedOnly,
            parallel_inference: false,
            record_every: 100,
            checkpoint_every: 5,
            max_steps: 3000,
            early_term: EarlyTermConfig::default(),
            folder: PathBuf::from("pruning_edges"),
            resume: true,
            pretrained: None,
            write_artifacts: true,
        }
    }

    /// Small, fast settings for toy models and tests.
    pub fn toy(geometry: ModelGeometry) -> Self {
        Self {
            batch_size: 4,
            n_samples: 3,
            record_every: 10,
            checkpoint_every: 2,
            max_steps: 50,
            temp_schedule: TempSchedule::Constant(0.0),
            write_artifacts: false,
            resume: false,
            ..Self::for_geometry(geometry)
        }
    }

    /// Rows in the patched pass (`n_samples * batch_size`)
    #[inline]
    pub fn total_samples(&self) -> usize {
        self.n_samples * self.batch_size
    }

    /// `ln(-l / r)` term of the closed-form gate-on probability
    #[inline]
    pub fn log_ratio(&self) -> f64 {
        let (l, r) = self.hard_concrete_endpoints;
        (-l / r).ln()
    }

    /// Load a config from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: &str| Err(Error::BadConfig(msg.to_string()));

        if self.geometry.n_layers == 0 || self.geometry.n_heads == 0 {
            return bad("geometry must have at least one layer and one head");
        }
        if self.batch_size == 0 {
            return bad("batch_size must be positive");
        }
        if self.n_samples == 0 {
            return bad("n_samples must be positive");
        }
        let (l, r) = self.hard_concrete_endpoints;
        if !(l < 0.0 && r > 1.0) {
            return bad("hard_concrete_endpoints must satisfy l < 0 < 1 < r");
        }
        if self.lamb < 0.0 {
            return bad("lamb must be non-negative");
        }
        if self.lr <= 0.0 || self.lr_modes <= 0.0 {
            return bad("learning rates must be positive");
        }
        if self.record_every == 0 || self.checkpoint_every == 0 {
            return bad("record_every and checkpoint_every must be positive");
        }
        if self.early_term.window < 2 {
            return bad("early_term.window must be at least 2");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let cfg = PruningConfig::for_geometry(ModelGeometry::new(12, 12));
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.total_samples(), 120);
        assert!(PruningConfig::toy(ModelGeometry::new(2, 2)).validate().is_ok());
    }

    #[test]
    fn test_invalid_configs() {
        let mut cfg = PruningConfig::toy(ModelGeometry::new(2, 2));
        cfg.hard_concrete_endpoints = (0.0, 1.0);
        assert!(cfg.validate().is_err());

        let mut cfg = PruningConfig::toy(ModelGeometry::new(2, 2));
        cfg.n_samples = 0;
        assert!(cfg.validate().is_err());

        let cfg = PruningConfig::toy(ModelGeometry::new(0, 2));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_temp_schedule() {
        let s = TempSchedule::LinearRamp {
            start_step: 10,
            slope: 0.5,
            max: 2.0,
        };
        assert_eq!(s.at(0), 0.0);
        assert_eq!(s.at(12), 1.0);
        assert_eq!(s.at(100), 2.0);
        assert_eq!(TempSchedule::Constant(0.3).at(7), 0.3);
    }

    #[test]
    fn test_json_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        let cfg = PruningConfig::toy(ModelGeometry::new(2, 2));
        std::fs::write(&path, serde_json::to_string_pretty(&cfg).unwrap()).unwrap();
        let loaded = PruningConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded.geometry, cfg.geometry);
        assert_eq!(loaded.temp_schedule, cfg.temp_schedule);
    }

    #[test]
    fn test_parallel_inference_defaults_off() {
        let mut value = serde_json::to_value(PruningConfig::toy(ModelGeometry::new(2, 2))).unwrap();
        value.as_object_mut().unwrap().remove("parallel_inference");
        let cfg: PruningConfig = serde_json::from_value(value).unwrap();
        assert!(!cfg.parallel_inference);
    }
}
