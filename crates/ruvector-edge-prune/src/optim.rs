//! AdamW over candle variables with checkpointable moment state.
//!
//! Non-finite gradient entries are replaced by zero before every update so
//! one degenerate sample cannot poison the parameters.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
pub use candle_nn::ParamsAdamW;

use crate::error::{Error, Result};

struct Slot {
    name: String,
    var: Var,
    m: Tensor,
    v: Tensor,
}

/// AdamW with bias correction and decoupled weight decay.
pub struct AdamW {
    slots: Vec<Slot>,
    params: ParamsAdamW,
    step: usize,
}

impl std::fmt::Debug for AdamW {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdamW")
            .field("vars", &self.slots.iter().map(|s| s.name.as_str()).collect::<Vec<_>>())
            .field("params", &self.params)
            .field("step", &self.step)
            .finish()
    }
}

/// Replace NaN and ±inf entries with zero.
pub fn sanitize(g: &Tensor) -> Result<Tensor> {
    let finite = g.abs()?.le(f32::MAX as f64)?;
    Ok(finite.where_cond(g, &g.zeros_like()?)?)
}

impl AdamW {
    /// Optimizer over named variables.
    pub fn new(vars: Vec<(String, Var)>, params: ParamsAdamW) -> Result<Self> {
        let slots = vars
            .into_iter()
            .map(|(name, var)| {
                let m = var.zeros_like()?;
                let v = var.zeros_like()?;
                Ok(Slot { name, var, m, v })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            slots,
            params,
            step: 0,
        })
    }

    /// Plain Adam (no weight decay) at a learning rate.
    pub fn with_lr(vars: Vec<(String, Var)>, lr: f64) -> Result<Self> {
        Self::new(
            vars,
            ParamsAdamW {
                lr,
                weight_decay: 0.0,
                ..ParamsAdamW::default()
            },
        )
    }

    /// Updates applied so far
    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Current learning rate
    pub fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    /// Apply one update from `grads`. Variables without a gradient keep
    /// their value and moments.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step += 1;
        let p = &self.params;
        let t = self.step as i32;
        let scale_m = 1.0 / (1.0 - p.beta1.powi(t));
        let scale_v = 1.0 / (1.0 - p.beta2.powi(t));

        for slot in self.slots.iter_mut() {
            let Some(g) = grads.get(slot.var.as_tensor()) else {
                continue;
            };
            let g = sanitize(&g.detach())?;
            let theta = slot.var.as_tensor().detach();

            let m = ((&slot.m * p.beta1)? + (&g * (1.0 - p.beta1))?)?;
            let v = ((&slot.v * p.beta2)? + (g.sqr()? * (1.0 - p.beta2))?)?;
            let m_hat = (&m * scale_m)?;
            let v_hat = (&v * scale_v)?;
            let decayed = (&theta * (1.0 - p.lr * p.weight_decay))?;
            let update = (m_hat / (v_hat.sqrt()? + p.eps)?)?;
            let next = (decayed - (update * p.lr)?)?;

            slot.var.set(&next)?;
            slot.m = m;
            slot.v = v;
        }
        Ok(())
    }

    /// Moment tensors keyed `{prefix}.{var}.m` / `{prefix}.{var}.v`.
    pub fn state_tensors(&self, prefix: &str) -> Vec<(String, Tensor)> {
        self.slots
            .iter()
            .flat_map(|s| {
                [
                    (format!("{prefix}.{}.m", s.name), s.m.clone()),
                    (format!("{prefix}.{}.v", s.name), s.v.clone()),
                ]
            })
            .collect()
    }

    /// Validate saved moments against the current variables without applying them.
    pub fn check_state(&self, prefix: &str, tensors: &HashMap<String, Tensor>) -> Result<()> {
        for s in &self.slots {
            for key in [format!("{prefix}.{}.m", s.name), format!("{prefix}.{}.v", s.name)] {
                let t = tensors
                    .get(&key)
                    .ok_or_else(|| Error::Checkpoint(format!("missing optimizer state {key}")))?;
                if t.dims() != s.var.dims() {
                    return Err(Error::Checkpoint(format!(
                        "optimizer state {key} has shape {:?}, expected {:?}",
                        t.dims(),
                        s.var.dims()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Restore moments and the step counter. Call [`check_state`](Self::check_state) first.
    pub fn load_state(&mut self, prefix: &str, tensors: &HashMap<String, Tensor>, step: usize) -> Result<()> {
        self.check_state(prefix, tensors)?;
        for s in self.slots.iter_mut() {
            let dtype = s.var.dtype();
            let device = s.var.device().clone();
            for (key, dst) in [("m", &mut s.m), ("v", &mut s.v)] {
                let name = format!("{prefix}.{}.{key}", s.name);
                if let Some(t) = tensors.get(&name) {
                    *dst = t.to_dtype(dtype)?.to_device(&device)?;
                }
            }
        }
        self.step = step;
        Ok(())
    }
}
