//! Convergence-based early termination.
//!
//! Training halts once the KL series is flat, the complexity series has
//! stopped declining and the temperature has collapsed, consistently. Each
//! converged check increments a counter stored in the training log; each
//! non-converged check decrements it (floored at zero). Training stops when
//! the counter reaches the configured threshold.

use crate::config::EarlyTermConfig;
use crate::log::TrainingLog;

/// Column holding the KL divergence
pub const KL_COLUMN: &str = "kl_loss";
/// Column holding the complexity metric
pub const COMPLEXITY_COLUMN: &str = "complexity_loss";
/// Column holding the mean temperature
pub const TEMP_COLUMN: &str = "temp";

/// Outcome of one check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Too few logged steps
    Warmup,
    /// Every criterion held; counter incremented
    Converged,
    /// At least one criterion failed; counter decremented
    Moving,
}

/// Early-termination policy over a [`TrainingLog`].
#[derive(Clone, Debug, Default)]
pub struct EarlyTermination {
    cfg: EarlyTermConfig,
}

impl EarlyTermination {
    /// Policy with the given thresholds
    pub fn new(cfg: EarlyTermConfig) -> Self {
        Self { cfg }
    }

    /// Thresholds in use
    pub fn config(&self) -> &EarlyTermConfig {
        &self.cfg
    }

    /// Evaluate the criteria on the tail of `log` and update its counter.
    pub fn check(&self, log: &mut TrainingLog) -> Verdict {
        if log.t() < self.cfg.min_steps {
            return Verdict::Warmup;
        }
        let window = self.cfg.window;
        let kl = log.stat_sig_growth(KL_COLUMN, window);
        let complexity = log.stat_sig_growth(COMPLEXITY_COLUMN, window);
        let temp = log.last(TEMP_COLUMN);
        let kl_flat = kl.as_ref().is_some_and(|t| t.decline.abs() < self.cfg.kl_flat);
        let complexity_settled = complexity
            .as_ref()
            .is_some_and(|t| t.decline < self.cfg.complexity_decline);
        let cold = temp.is_some_and(|t| t < self.cfg.temp_ceiling);

        tracing::debug!(
            step = log.t(),
            kl_decline = kl.as_ref().map_or(f64::NAN, |t| t.decline),
            kl_t_stat = kl.as_ref().map_or(f64::NAN, |t| t.t_stat),
            complexity_decline = complexity.as_ref().map_or(f64::NAN, |t| t.decline),
            complexity_t_stat = complexity.as_ref().map_or(f64::NAN, |t| t.t_stat),
            temp = temp.unwrap_or(f64::NAN),
            count = log.early_term_count,
            "early termination check"
        );

        if kl_flat && complexity_settled && cold {
            log.early_term_count += 1;
            Verdict::Converged
        } else {
            log.early_term_count = log.early_term_count.saturating_sub(self.cfg.decrement);
            Verdict::Moving
        }
    }

    /// Whether the counter in `log` has reached the halting threshold.
    pub fn should_stop(&self, log: &TrainingLog) -> bool {
        log.early_term_count >= self.cfg.threshold
    }
}
