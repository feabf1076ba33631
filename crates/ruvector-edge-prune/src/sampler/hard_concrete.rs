//! Stochastic hard-concrete mask sampler.
//!
//! Each edge owns a location `α` and a sharpness `β`. A gate is drawn as
//!
//! ```text
//! s = sigmoid((logit(u) + α) / (relu(β) + 0.001)),  u ~ U(0, 1)
//! z = clamp(s * (r - l) + l, 0, 1)
//! ```
//!
//! Stretching to `(l, r)` with `l < 0 < 1 < r` puts finite probability
//! mass on exactly 0 and exactly 1 while keeping the gate differentiable
//! in `α` and `β` inside the interval.

use std::path::Path;

use candle_core::{DType, Tensor, Var};
use serde::Serialize;

use super::{MaskLoss, MaskSource};
use crate::artifacts::{write_json, Histogram, Scatter};
use crate::config::{PruningConfig, DEFAULT_SHARPNESS};
use crate::context::ExecContext;
use crate::edges::{Edge, EdgeLayout};
use crate::error::{Error, Result};

const DENOM_FLOOR: f64 = 1e-3;
const LOGIT_EPS: f64 = 1e-3;
const HIST_BINS: usize = 50;

/// Numerically stable logistic function.
///
/// Written through `tanh` so both value and gradient stay finite for any
/// input magnitude.
pub fn sigmoid(x: &Tensor) -> Result<Tensor> {
    Ok(((x * 0.5)?.tanh()? * 0.5)?.affine(1.0, 0.5)?)
}

/// Draw hard-concrete gates.
///
/// `unif` is `(batch, N)` noise in `[0, 1)`, `params` is `(N, 2)` holding
/// `[location, sharpness]` per edge. Returns `(batch, N)` gates in `[0, 1]`.
pub fn hard_concrete(unif: &Tensor, params: &Tensor, endpoints: (f64, f64)) -> Result<Tensor> {
    let (l, r) = endpoints;
    let location = params.narrow(1, 0, 1)?.squeeze(1)?;
    let sharpness = params.narrow(1, 1, 1)?.squeeze(1)?;

    let logit = ((unif + LOGIT_EPS)?.log()? - unif.affine(-1.0, 1.0)?.log()?)?;
    let denom = (sharpness.relu()? + DENOM_FLOOR)?;
    let s = sigmoid(&logit.broadcast_add(&location)?.broadcast_div(&denom)?)?;
    Ok(s.affine(r - l, l)?.clamp(0f32, 1f32)?)
}

/// Learnable `(N, 2)` location/sharpness table.
#[derive(Debug, Clone)]
pub struct MaskParameters {
    layout: EdgeLayout,
    params: Var,
}

impl MaskParameters {
    /// Uniform prior: every edge starts at `(init_location, init_sharpness)`.
    pub fn prior(layout: EdgeLayout, location: f64, sharpness: f64, ctx: &ExecContext) -> Result<Self> {
        let n = layout.n_edges();
        let data: Vec<f32> = (0..n)
            .flat_map(|_| [location as f32, sharpness as f32])
            .collect();
        let t = ctx.tensor_from_vec(data, &[n, 2])?;
        Ok(Self {
            layout,
            params: Var::from_tensor(&t)?,
        })
    }

    /// Wrap an existing `(N, 2)` tensor.
    pub fn from_tensor(layout: EdgeLayout, t: &Tensor) -> Result<Self> {
        let expected = [layout.n_edges(), 2];
        if t.dims() != expected {
            return Err(Error::BadInput(format!(
                "mask parameters have shape {:?}, expected {expected:?}",
                t.dims()
            )));
        }
        Ok(Self {
            layout,
            params: Var::from_tensor(t)?,
        })
    }

    /// Edge table
    pub fn layout(&self) -> &EdgeLayout {
        &self.layout
    }

    /// The trainable variable
    pub fn var(&self) -> &Var {
        &self.params
    }

    /// Location column `(N,)`
    pub fn location(&self) -> Result<Tensor> {
        Ok(self.params.as_tensor().narrow(1, 0, 1)?.squeeze(1)?)
    }

    /// Sharpness column `(N,)`
    pub fn sharpness(&self) -> Result<Tensor> {
        Ok(self.params.as_tensor().narrow(1, 1, 1)?.squeeze(1)?)
    }

    /// Host copy as rows of `[location, sharpness]`
    pub fn to_rows(&self) -> Result<Vec<Vec<f32>>> {
        Ok(self.params.as_tensor().to_dtype(DType::F32)?.to_vec2()?)
    }
}

#[derive(Serialize)]
struct SamplerSnapshot {
    step: usize,
    sampled_gates: Histogram,
    location: Histogram,
    sharpness: Histogram,
    gate_probability: Histogram,
    location_vs_sharpness: Scatter,
}

/// Hard-concrete sampler over the full edge table.
#[derive(Debug)]
pub struct HardConcreteSampler {
    params: MaskParameters,
    endpoints: (f64, f64),
    log_ratio: f64,
    lamb: f64,
    complexity_mean: bool,
    total_samples: usize,
    temp_c: f64,
    fixed: Option<Tensor>,
    sampled: Option<Tensor>,
}

impl HardConcreteSampler {
    const COLUMNS: &'static [&'static str] = &["complexity_loss", "temp", "temp_cond", "temp_count", "temp_reg"];

    /// Sampler initialised from the configured prior.
    pub fn new(layout: EdgeLayout, cfg: &PruningConfig, ctx: &ExecContext) -> Result<Self> {
        let params = MaskParameters::prior(layout, cfg.init_location, cfg.init_sharpness, ctx)?;
        Self::with_params(params, cfg)
    }

    /// Sampler around existing parameters.
    pub fn with_params(params: MaskParameters, cfg: &PruningConfig) -> Result<Self> {
        if params.layout().geometry() != cfg.geometry {
            return Err(Error::BadConfig(format!(
                "mask geometry {:?} does not match config geometry {:?}",
                params.layout().geometry(),
                cfg.geometry
            )));
        }
        Ok(Self {
            params,
            endpoints: cfg.hard_concrete_endpoints,
            log_ratio: cfg.log_ratio(),
            lamb: cfg.lamb,
            complexity_mean: cfg.complexity_mean,
            total_samples: cfg.total_samples(),
            temp_c: 0.0,
            fixed: None,
            sampled: None,
        })
    }

    /// Mask parameters
    pub fn params(&self) -> &MaskParameters {
        &self.params
    }

    /// The `(N, 2)` parameter tensor, attached to the autodiff graph.
    pub fn get_sampling_params(&self) -> Tensor {
        self.params.var().as_tensor().clone()
    }

    /// Current temperature-regularisation coefficient
    pub fn temp_c(&self) -> f64 {
        self.temp_c
    }

    /// Pin the mask to fixed gates, skipping sampling. `None` resumes
    /// stochastic sampling.
    pub fn pin(&mut self, gates: Option<Tensor>) -> Result<()> {
        if let Some(gates) = &gates {
            let expected = [self.total_samples, self.params.layout().n_edges()];
            if gates.dims() != expected {
                return Err(Error::BadInput(format!(
                    "pinned mask has shape {:?}, expected {expected:?}",
                    gates.dims()
                )));
            }
        }
        self.fixed = gates;
        Ok(())
    }

    /// Draw a fresh `(n_samples * batch, N)` gate tensor.
    pub fn sample_mask(&mut self, ctx: &mut ExecContext) -> Result<&Tensor> {
        let gates = match &self.fixed {
            Some(fixed) => fixed.clone(),
            None => {
                let unif = ctx.uniform(&[self.total_samples, self.params.layout().n_edges()])?;
                hard_concrete(&unif, self.params.var().as_tensor(), self.endpoints)?
            }
        };
        Ok(&*self.sampled.insert(gates))
    }

    /// Closed-form probability that each gate is non-zero, `(N,)`.
    pub fn complexity(&self) -> Result<Tensor> {
        let location = self.params.location()?;
        let sharpness = self.params.sharpness()?;
        sigmoid(&(location - (sharpness.relu()? * self.log_ratio)?)?)
    }

    /// Host copy of [`complexity`](Self::complexity)
    pub fn gate_probabilities(&self) -> Result<Vec<f32>> {
        Ok(self.complexity()?.to_dtype(DType::F32)?.to_vec1()?)
    }

    /// Sparsity plus temperature loss and its metrics.
    pub fn get_mask_loss(&self) -> Result<MaskLoss> {
        let complexity = self.complexity()?;
        let sharpness = self.params.sharpness()?;
        let temperature = sharpness.sqr()?;

        let complexity_sum = complexity.sum_all()?;
        let temp_sum = temperature.sum_all()?;
        let loss = ((&complexity_sum * self.lamb)? + (&temp_sum * self.temp_c)?)?;

        let n = self.params.layout().n_edges() as f64;
        let complexity_sum = complexity_sum.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        let complexity_metric = if self.complexity_mean {
            complexity_sum / n
        } else {
            complexity_sum
        };

        let sharp: Vec<f32> = sharpness.to_dtype(DType::F32)?.to_vec1()?;
        let avg_temp = sharp.iter().map(|&b| b.max(0.0) as f64).sum::<f64>() / n;
        // mean excess over 1 among edges hotter than 1; 1.0 when there are none
        let hot: Vec<f64> = sharp.iter().filter(|&&b| b > 1.0).map(|&b| b as f64 - 1.0).collect();
        let temp_cond = if hot.is_empty() {
            1.0
        } else {
            hot.iter().sum::<f64>() / hot.len() as f64 + 1.0
        };
        let temp_count = sharp
            .iter()
            .map(|&b| {
                let b = b.max(0.0) as f64;
                2.0 / (1.0 + (-b).exp()) - 1.0
            })
            .sum::<f64>()
            / n;

        tracing::debug!(
            complexity = complexity_metric,
            avg_temp,
            temp_cond,
            temp_c = self.temp_c,
            "mask loss"
        );

        Ok(MaskLoss {
            loss: Some(loss),
            details: vec![
                ("complexity_loss", complexity_metric),
                ("temp", avg_temp),
                ("temp_cond", temp_cond),
                ("temp_count", temp_count),
                ("temp_reg", self.temp_c),
            ],
        })
    }

    /// Edges whose gate-on probability exceeds `threshold`.
    pub fn circuit(&self, threshold: f32) -> Result<Vec<Edge>> {
        let probs = self.gate_probabilities()?;
        Ok(self
            .params
            .layout()
            .edges()
            .into_iter()
            .zip(probs)
            .filter(|(_, p)| *p > threshold)
            .map(|(e, _)| e)
            .collect())
    }
}

impl MaskSource for HardConcreteSampler {
    fn forward(&mut self, ctx: &mut ExecContext) -> Result<MaskLoss> {
        self.sample_mask(ctx)?;
        self.get_mask_loss()
    }

    fn sampled_mask(&self) -> Option<&Tensor> {
        self.sampled.as_ref()
    }

    fn record_state(&self, step: usize, dir: &Path) -> Result<()> {
        let rows = self.params.to_rows()?;
        let location: Vec<f32> = rows.iter().map(|r| r[0]).collect();
        let sharpness: Vec<f32> = rows.iter().map(|r| r[1]).collect();
        let sampled: Vec<f32> = match &self.sampled {
            Some(t) => t.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?,
            None => Vec::new(),
        };
        let snapshot = SamplerSnapshot {
            step,
            sampled_gates: Histogram::from_values(&sampled, HIST_BINS),
            location: Histogram::from_values(&location, HIST_BINS),
            sharpness: Histogram::from_values(&sharpness, HIST_BINS),
            gate_probability: Histogram::from_values(&self.gate_probabilities()?, HIST_BINS),
            location_vs_sharpness: Scatter {
                x: location,
                y: sharpness,
            },
        };
        write_json(dir.join(format!("mask-{step}.json")), &snapshot)
    }

    fn log_columns(&self) -> &'static [&'static str] {
        Self::COLUMNS
    }

    fn use_temperature(&self) -> bool {
        true
    }

    fn set_temp_c(&mut self, temp_c: f64) {
        self.temp_c = temp_c;
    }

    fn named_vars(&self) -> Vec<(String, Var)> {
        vec![("mask.params".to_string(), self.params.var().clone())]
    }

    fn sampling_params(&self) -> Option<Tensor> {
        Some(self.get_sampling_params())
    }

    fn fix_nans(&mut self) -> Result<bool> {
        let mut rows = self.params.to_rows()?;
        let mut repaired = 0usize;
        for row in rows.iter_mut() {
            if !row[1].is_finite() {
                row[1] = DEFAULT_SHARPNESS as f32;
                repaired += 1;
            }
        }
        if repaired > 0 {
            tracing::warn!(repaired, "reset non-finite sharpness values");
            let var = self.params.var();
            let n = rows.len();
            let flat: Vec<f32> = rows.iter().flatten().copied().collect();
            let t = Tensor::from_vec(flat, (n, 2), var.device())?.to_dtype(var.dtype())?;
            var.set(&t)?;
        }
        Ok(rows.iter().flatten().all(|v| v.is_finite()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edges::ModelGeometry;
    use approx::assert_relative_eq;
    use candle_core::Device;

    fn sampler(location: f64, sharpness: f64) -> (HardConcreteSampler, ExecContext) {
        let geometry = ModelGeometry::new(2, 2);
        let mut cfg = PruningConfig::toy(geometry);
        cfg.init_location = location;
        cfg.init_sharpness = sharpness;
        let ctx = ExecContext::cpu(11);
        let s = HardConcreteSampler::new(EdgeLayout::new(geometry), &cfg, &ctx).unwrap();
        (s, ctx)
    }

    #[test]
    fn test_sigmoid_is_finite_at_extremes() {
        let x = Tensor::new(&[-1e4f32, -3.0, 0.0, 3.0, 1e4], &Device::Cpu).unwrap();
        let y: Vec<f32> = sigmoid(&x).unwrap().to_vec1().unwrap();
        assert_relative_eq!(y[0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(y[2], 0.5, epsilon = 1e-6);
        assert_relative_eq!(y[3], 1.0 / (1.0 + (-3f32).exp()), epsilon = 1e-5);
        assert_relative_eq!(y[4], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_gates_in_unit_interval() {
        let (mut s, mut ctx) = sampler(0.0, DEFAULT_SHARPNESS);
        let gates: Vec<Vec<f32>> = s.sample_mask(&mut ctx).unwrap().to_vec2().unwrap();
        assert_eq!(gates.len(), 12);
        assert!(gates.iter().flatten().all(|g| (0.0..=1.0).contains(g)));
    }

    #[test]
    fn test_gates_become_hard_as_sharpness_vanishes() {
        let (mut s, mut ctx) = sampler(0.0, 1e-6);
        let gates: Vec<Vec<f32>> = s.sample_mask(&mut ctx).unwrap().to_vec2().unwrap();
        let total = gates.iter().flatten().count();
        let soft = gates.iter().flatten().filter(|&&g| g > 0.0 && g < 1.0).count();
        assert!((soft as f64) < 0.01 * total as f64, "{soft} of {total} soft");
    }

    #[test]
    fn test_complexity_monotone_in_location() {
        let geometry = ModelGeometry::new(1, 1);
        let cfg = PruningConfig::toy(geometry);
        let layout = EdgeLayout::new(geometry);
        let n = layout.n_edges();
        let data: Vec<f32> = (0..n).flat_map(|i| [i as f32 - 2.0, 0.5]).collect();
        let t = Tensor::from_vec(data, (n, 2), &Device::Cpu).unwrap();
        let s = HardConcreteSampler::with_params(MaskParameters::from_tensor(layout, &t).unwrap(), &cfg)
            .unwrap();
        let p = s.gate_probabilities().unwrap();
        assert!(p.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_fix_nans_idempotent() {
        let (mut s, _) = sampler(1.0, 0.5);
        let n = s.params().layout().n_edges();
        let mut data: Vec<f32> = (0..n).flat_map(|_| [1.0, 0.5]).collect();
        data[1] = f32::NAN;
        data[5] = f32::INFINITY;
        let t = Tensor::from_vec(data, (n, 2), &Device::Cpu).unwrap();
        s.params().var().set(&t).unwrap();

        assert!(s.fix_nans().unwrap());
        let once = s.params().to_rows().unwrap();
        assert!(s.fix_nans().unwrap());
        let twice = s.params().to_rows().unwrap();
        assert_eq!(once, twice);
        assert_relative_eq!(once[0][1], DEFAULT_SHARPNESS as f32);
    }

    #[test]
    fn test_temperature_metrics() {
        let (s, _) = sampler(1.0, 0.0);
        let loss = s.get_mask_loss().unwrap();
        assert_eq!(loss.detail("temp"), Some(0.0));
        assert_eq!(loss.detail("temp_cond"), Some(1.0));
        assert_eq!(loss.detail("temp_count"), Some(0.0));

        let (s, _) = sampler(1.0, 1.5);
        let loss = s.get_mask_loss().unwrap();
        assert_relative_eq!(loss.detail("temp").unwrap(), 1.5, epsilon = 1e-6);
        assert_relative_eq!(loss.detail("temp_cond").unwrap(), 1.5, epsilon = 1e-6);
        let expected = 2.0 / (1.0 + (-1.5f64).exp()) - 1.0;
        assert_relative_eq!(loss.detail("temp_count").unwrap(), expected, epsilon = 1e-6);
    }

    #[test]
    fn test_mask_loss_gradient_pushes_location_down() {
        let (s, _) = sampler(0.0, DEFAULT_SHARPNESS);
        let loss = s.get_mask_loss().unwrap().loss.unwrap();
        let grads = loss.backward().unwrap();
        let g: Vec<Vec<f32>> = grads
            .get(s.params().var().as_tensor())
            .unwrap()
            .to_vec2()
            .unwrap();
        assert!(g.iter().all(|row| row[0] > 0.0));
    }

    #[test]
    fn test_pin_overrides_sampling() {
        let (mut s, mut ctx) = sampler(0.0, DEFAULT_SHARPNESS);
        let n = s.params().layout().n_edges();
        let ones = Tensor::ones((12, n), DType::F32, &Device::Cpu).unwrap();
        s.pin(Some(ones)).unwrap();
        let gates: Vec<Vec<f32>> = s.sample_mask(&mut ctx).unwrap().to_vec2().unwrap();
        assert!(gates.iter().flatten().all(|&g| g == 1.0));
        assert!(s
            .pin(Some(Tensor::ones((2, n), DType::F32, &Device::Cpu).unwrap()))
            .is_err());

        s.pin(None).unwrap();
        let gates: Vec<Vec<f32>> = s.sample_mask(&mut ctx).unwrap().to_vec2().unwrap();
        assert!(gates.iter().flatten().any(|&g| g < 1.0));
    }

    #[test]
    fn test_sampling_params_follow_edge_table() {
        let geometry = ModelGeometry::new(2, 2);
        let cfg = PruningConfig::toy(geometry);
        let layout = EdgeLayout::new(geometry);
        let edges = layout.edges();
        let n = layout.n_edges();
        let data: Vec<f32> = (0..n).flat_map(|i| [i as f32, 0.5]).collect();
        let t = Tensor::from_vec(data, (n, 2), &Device::Cpu).unwrap();
        let s = HardConcreteSampler::with_params(MaskParameters::from_tensor(layout, &t).unwrap(), &cfg)
            .unwrap();

        let params = s.get_sampling_params();
        assert_eq!(params.dims(), &[n, 2]);
        let rows: Vec<Vec<f32>> = params.to_vec2().unwrap();
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row[0], i as f32);
        }
        let again: Vec<Vec<f32>> = s.get_sampling_params().to_vec2().unwrap();
        assert_eq!(rows, again);

        // A single strong edge lands on the matching entry of the edge table.
        let k = n / 2;
        let data: Vec<f32> = (0..n)
            .flat_map(|i| [if i == k { 5.0 } else { -5.0 }, 0.5])
            .collect();
        s.params().var().set(&Tensor::from_vec(data, (n, 2), &Device::Cpu).unwrap()).unwrap();
        assert_eq!(s.circuit(0.5).unwrap(), vec![edges[k]]);
        assert_eq!(s.sampling_params().unwrap().dims(), &[n, 2]);
    }

    #[test]
    fn test_stretch_maps_unit_interval_onto_endpoints() {
        let unif = Tensor::new(&[[0.5f32, 0.5, 0.5]], &Device::Cpu).unwrap();
        let params = Tensor::new(&[[0.0f32, 1.0], [50.0, 1.0], [-50.0, 1.0]], &Device::Cpu).unwrap();
        let z: Vec<Vec<f32>> = hard_concrete(&unif, &params, (-0.1, 1.1)).unwrap().to_vec2().unwrap();

        let x = ((0.5f64 + LOGIT_EPS).ln() - 0.5f64.ln()) / (1.0 + DENOM_FLOOR);
        let s = 1.0 / (1.0 + (-x).exp());
        assert_relative_eq!(z[0][0] as f64, s * 1.2 - 0.1, epsilon = 1e-5);
        assert_eq!(z[0][1], 1.0);
        assert_eq!(z[0][2], 0.0);
    }

    #[test]
    fn test_record_state_writes_summary() {
        let (mut s, mut ctx) = sampler(0.5, DEFAULT_SHARPNESS);
        s.sample_mask(&mut ctx).unwrap();
        let dir = tempfile::tempdir().unwrap();
        s.record_state(40, dir.path()).unwrap();

        let text = std::fs::read_to_string(dir.path().join("mask-40.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        let n = s.params().layout().n_edges();
        assert_eq!(json["step"], 40);
        assert_eq!(json["location_vs_sharpness"]["x"].as_array().unwrap().len(), n);
        assert_eq!(json["sampled_gates"]["skipped"], 0);
    }
}
