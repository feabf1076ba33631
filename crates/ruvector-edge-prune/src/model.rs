//! Frozen GPT-2 style transformer with explicit patch points.
//!
//! The forward pass calls a [`ForwardTap`] at every point where a component
//! produces an output or consumes an input. A tap can record the value,
//! replace it, or do nothing; the call sites are fixed, so the set of
//! intercepted points is checked at compile time.
//!
//! Attention inputs are split per head and per stream (q/k/v): each head may
//! read a different residual reconstruction. The unpatched pass simply
//! broadcasts the residual stream to every head.
//!
//! All weights are detached constants. Gradients flow through the forward
//! pass to whatever the tap injects, never into the model.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor, D};
use candle_nn::VarBuilder;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::context::ExecContext;
use crate::edges::{AttnStream, ModelGeometry};
use crate::error::{Error, Result};

/// Transformer shape configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransformerConfig {
    /// Number of blocks
    pub n_layers: usize,
    /// Heads per block
    pub n_heads: usize,
    /// Residual width
    pub d_model: usize,
    /// Per-head width
    pub d_head: usize,
    /// MLP hidden width
    pub d_mlp: usize,
    /// Vocabulary size
    pub d_vocab: usize,
    /// Maximum context length
    pub n_ctx: usize,
    /// LayerNorm epsilon
    pub ln_eps: f64,
}

impl TransformerConfig {
    /// Two layers, two heads, tiny widths.
    pub fn toy() -> Self {
        Self {
            n_layers: 2,
            n_heads: 2,
            d_model: 16,
            d_head: 8,
            d_mlp: 32,
            d_vocab: 24,
            n_ctx: 16,
            ln_eps: 1e-5,
        }
    }

    /// GPT-2 small shapes.
    pub fn gpt2_small() -> Self {
        Self {
            n_layers: 12,
            n_heads: 12,
            d_model: 768,
            d_head: 64,
            d_mlp: 3072,
            d_vocab: 50257,
            n_ctx: 1024,
            ln_eps: 1e-5,
        }
    }

    /// Depth and width as seen by the edge table
    #[inline]
    pub fn geometry(&self) -> ModelGeometry {
        ModelGeometry::new(self.n_layers, self.n_heads)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.n_layers == 0 || self.n_heads == 0 {
            return Err(Error::BadConfig("model needs layers and heads".into()));
        }
        if self.d_model == 0 || self.d_head == 0 || self.d_mlp == 0 || self.d_vocab == 0 {
            return Err(Error::BadConfig("model widths must be positive".into()));
        }
        if self.n_ctx == 0 {
            return Err(Error::BadConfig("n_ctx must be positive".into()));
        }
        Ok(())
    }
}

/// Interception points of [`CircuitTransformer::forward_with`].
///
/// Every method defaults to a pass-through, so a tap only overrides the
/// points it cares about.
pub trait ForwardTap {
    /// Token + position embedding, shape `(B, S, D)`.
    fn embed(&mut self, resid: Tensor) -> Result<Tensor> {
        Ok(resid)
    }

    /// Per-head input of one attention stream.
    ///
    /// `resid` is the residual stream `(B, S, D)`; the result must be
    /// `(B, S, H, D)`.
    fn attn_input(
        &mut self,
        _layer: usize,
        _stream: AttnStream,
        resid: &Tensor,
        n_heads: usize,
    ) -> Result<Tensor> {
        broadcast_heads(resid, n_heads)
    }

    /// Per-head attention mixture `z`, shape `(B, S, H, Dh)`.
    fn attn_z(&mut self, _layer: usize, z: Tensor) -> Result<Tensor> {
        Ok(z)
    }

    /// MLP input, shape `(B, S, D)`.
    fn mlp_input(&mut self, _layer: usize, resid: &Tensor) -> Result<Tensor> {
        Ok(resid.clone())
    }

    /// MLP output, shape `(B, S, D)`.
    fn mlp_output(&mut self, _layer: usize, out: Tensor) -> Result<Tensor> {
        Ok(out)
    }

    /// Residual stream after the last block; any leading shape is allowed
    /// as long as the last dimension stays `D`.
    fn final_residual(&mut self, resid: Tensor) -> Result<Tensor> {
        Ok(resid)
    }
}

/// Tap that intercepts nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTap;

impl ForwardTap for NoTap {}

/// Broadcast `(B, S, D)` to `(B, S, H, D)`.
pub fn broadcast_heads(resid: &Tensor, n_heads: usize) -> Result<Tensor> {
    let (b, s, d) = resid.dims3()?;
    Ok(resid.unsqueeze(2)?.broadcast_as((b, s, n_heads, d))?)
}

#[derive(Debug)]
struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    fn load(vb: &VarBuilder, d: usize, eps: f64) -> Result<Self> {
        Ok(Self {
            weight: vb.get(d, "w")?.detach(),
            bias: vb.get(d, "b")?.detach(),
            eps,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        Ok(normed.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)?)
    }
}

#[derive(Debug)]
struct Block {
    ln1: LayerNorm,
    w_q: Tensor,
    b_q: Tensor,
    w_k: Tensor,
    b_k: Tensor,
    w_v: Tensor,
    b_v: Tensor,
    w_o: Tensor,
    b_o: Tensor,
    ln2: LayerNorm,
    w_in: Tensor,
    b_in: Tensor,
    w_out: Tensor,
    b_out: Tensor,
    scale: f64,
}

impl Block {
    fn load(vb: VarBuilder, cfg: &TransformerConfig) -> Result<Self> {
        let (h, d, dh, dm) = (cfg.n_heads, cfg.d_model, cfg.d_head, cfg.d_mlp);
        let attn = vb.pp("attn");
        let mlp = vb.pp("mlp");
        let get = |vb: &VarBuilder, shape: &[usize], name: &str| -> Result<Tensor> {
            Ok(vb.get(shape, name)?.detach())
        };
        Ok(Self {
            ln1: LayerNorm::load(&vb.pp("ln1"), d, cfg.ln_eps)?,
            w_q: get(&attn, &[h, d, dh], "W_Q")?,
            b_q: get(&attn, &[h, dh], "b_Q")?,
            w_k: get(&attn, &[h, d, dh], "W_K")?,
            b_k: get(&attn, &[h, dh], "b_K")?,
            w_v: get(&attn, &[h, d, dh], "W_V")?,
            b_v: get(&attn, &[h, dh], "b_V")?,
            w_o: get(&attn, &[h, dh, d], "W_O")?,
            b_o: get(&attn, &[d], "b_O")?,
            ln2: LayerNorm::load(&vb.pp("ln2"), d, cfg.ln_eps)?,
            w_in: get(&mlp, &[d, dm], "W_in")?,
            b_in: get(&mlp, &[dm], "b_in")?,
            w_out: get(&mlp, &[dm, d], "W_out")?,
            b_out: get(&mlp, &[d], "b_out")?,
            scale: 1.0 / (dh as f64).sqrt(),
        })
    }

    /// `(B, S, H, D)` → `(B, H, S, Dh)`
    fn project_in(&self, x: &Tensor, w: &Tensor, b: &Tensor) -> Result<Tensor> {
        let x = self.ln1.forward(x)?.transpose(1, 2)?.contiguous()?;
        Ok(x.broadcast_matmul(&w.unsqueeze(0)?)?
            .broadcast_add(&b.unsqueeze(1)?)?)
    }

    /// Returns `z` as `(B, S, H, Dh)`.
    fn attention(&self, q_in: &Tensor, k_in: &Tensor, v_in: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let q = self.project_in(q_in, &self.w_q, &self.b_q)?;
        let k = self.project_in(k_in, &self.w_k, &self.b_k)?;
        let v = self.project_in(v_in, &self.w_v, &self.b_v)?;

        let scores = (q.matmul(&k.t()?.contiguous()?)? * self.scale)?.broadcast_add(mask)?;
        let pattern = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let z = pattern.matmul(&v)?;
        Ok(z.transpose(1, 2)?.contiguous()?)
    }

    /// `(B, S, H, Dh)` → `(B, S, D)`
    fn project_out(&self, z: &Tensor) -> Result<Tensor> {
        let (b, s, h, dh) = z.dims4()?;
        let d = self.w_o.dim(2)?;
        let w = self.w_o.reshape((h * dh, d))?;
        Ok(z.reshape((b, s, h * dh))?
            .broadcast_matmul(&w)?
            .broadcast_add(&self.b_o)?)
    }

    fn mlp(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.ln2.forward(x)?;
        let hidden = x.broadcast_matmul(&self.w_in)?.broadcast_add(&self.b_in)?.gelu()?;
        Ok(hidden.broadcast_matmul(&self.w_out)?.broadcast_add(&self.b_out)?)
    }
}

/// Frozen pretrained transformer.
#[derive(Debug)]
pub struct CircuitTransformer {
    cfg: TransformerConfig,
    w_e: Tensor,
    w_pos: Tensor,
    blocks: Vec<Block>,
    ln_final: LayerNorm,
    w_u: Tensor,
    b_u: Tensor,
}

impl CircuitTransformer {
    /// Build from a var builder using TransformerLens-style tensor names
    /// (`embed.W_E`, `blocks.{i}.attn.W_Q`, `unembed.W_U`, ...).
    pub fn from_var_builder(cfg: TransformerConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let blocks = (0..cfg.n_layers)
            .map(|i| Block::load(vb.pp(format!("blocks.{i}")), &cfg))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            w_e: vb.get((cfg.d_vocab, cfg.d_model), "embed.W_E")?.detach(),
            w_pos: vb.get((cfg.n_ctx, cfg.d_model), "pos_embed.W_pos")?.detach(),
            ln_final: LayerNorm::load(&vb.pp("ln_final"), cfg.d_model, cfg.ln_eps)?,
            w_u: vb.get((cfg.d_model, cfg.d_vocab), "unembed.W_U")?.detach(),
            b_u: vb.get(cfg.d_vocab, "unembed.b_U")?.detach(),
            blocks,
            cfg,
        })
    }

    /// Load weights from safetensors files.
    pub fn load_safetensors<P: AsRef<Path>>(
        cfg: TransformerConfig,
        paths: &[P],
        ctx: &ExecContext,
    ) -> Result<Self> {
        let paths: Vec<&Path> = paths.iter().map(|p| p.as_ref()).collect();
        // SAFETY: the files are only read, and must not be modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&paths, ctx.dtype, &ctx.device) }
            .map_err(|e| Error::BadWeights(format!("{paths:?}: {e}")))?;
        Self::from_var_builder(cfg, vb).map_err(|e| match e {
            Error::Candle(e) => Error::BadWeights(e.to_string()),
            other => other,
        })
    }

    /// Randomly initialised model (normal weights, zero biases, unit norms).
    pub fn random(cfg: TransformerConfig, init_std: f64, ctx: &mut ExecContext) -> Result<Self> {
        let tensors = random_tensors(&cfg, init_std, ctx)?;
        let vb = VarBuilder::from_tensors(tensors, ctx.dtype, &ctx.device);
        Self::from_var_builder(cfg, vb)
    }

    /// Model configuration
    pub fn config(&self) -> &TransformerConfig {
        &self.cfg
    }

    /// Device of the weights
    pub fn device(&self) -> &Device {
        self.w_e.device()
    }

    /// Dtype of the weights
    pub fn dtype(&self) -> DType {
        self.w_e.dtype()
    }

    /// Stacked attention output projections, `(L, H, Dh, D)`
    pub fn w_o_stack(&self) -> Result<Tensor> {
        let ws: Vec<&Tensor> = self.blocks.iter().map(|b| &b.w_o).collect();
        Ok(Tensor::stack(&ws, 0)?)
    }

    /// Stacked attention output biases, `(L, D)`
    pub fn b_o_stack(&self) -> Result<Tensor> {
        let bs: Vec<&Tensor> = self.blocks.iter().map(|b| &b.b_o).collect();
        Ok(Tensor::stack(&bs, 0)?)
    }

    fn causal_mask(&self, s: usize) -> Result<Tensor> {
        let data: Vec<f32> = (0..s)
            .flat_map(|i| (0..s).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
            .collect();
        Ok(Tensor::from_vec(data, (s, s), self.device())?.to_dtype(self.dtype())?)
    }

    /// Unpatched forward pass, logits `(B, S, V)`.
    pub fn forward(&self, tokens: &Tensor) -> Result<Tensor> {
        self.forward_with(tokens, &mut NoTap)
    }

    /// Forward pass with every patch point routed through `tap`.
    ///
    /// `tokens` is `(B, S)` of `u32`. The returned logits keep whatever
    /// leading shape the tap gives the final residual.
    pub fn forward_with<T: ForwardTap>(&self, tokens: &Tensor, tap: &mut T) -> Result<Tensor> {
        let (b, s) = tokens.dims2()?;
        if s == 0 || s > self.cfg.n_ctx {
            return Err(Error::BadInput(format!(
                "sequence length {s} outside 1..={}",
                self.cfg.n_ctx
            )));
        }
        let (h, d) = (self.cfg.n_heads, self.cfg.d_model);

        let tok = self
            .w_e
            .index_select(&tokens.flatten_all()?, 0)?
            .reshape((b, s, d))?;
        let pos = self.w_pos.narrow(0, 0, s)?;
        let mut resid = tap.embed(tok.broadcast_add(&pos)?)?;
        let mask = self.causal_mask(s)?;

        for (layer, block) in self.blocks.iter().enumerate() {
            let q_in = tap.attn_input(layer, AttnStream::Query, &resid, h)?;
            let k_in = tap.attn_input(layer, AttnStream::Key, &resid, h)?;
            let v_in = tap.attn_input(layer, AttnStream::Value, &resid, h)?;
            let z = block.attention(&q_in, &k_in, &v_in, &mask)?;
            let z = tap.attn_z(layer, z)?;
            let resid_mid = (&resid + block.project_out(&z)?)?;

            let mlp_in = tap.mlp_input(layer, &resid_mid)?;
            let mlp_out = tap.mlp_output(layer, block.mlp(&mlp_in)?)?;
            resid = (resid_mid + mlp_out)?;
        }

        let resid = tap.final_residual(resid)?;
        let x = self.ln_final.forward(&resid)?;
        Ok(x.broadcast_matmul(&self.w_u)?.broadcast_add(&self.b_u)?)
    }
}

/// Random weights under TransformerLens names, ready for a var builder or
/// `candle_core::safetensors::save`.
pub fn random_tensors(
    cfg: &TransformerConfig,
    init_std: f64,
    ctx: &mut ExecContext,
) -> Result<HashMap<String, Tensor>> {
    cfg.validate()?;
    let normal = Normal::new(0.0f32, init_std as f32)
        .map_err(|e| Error::BadConfig(format!("init_std: {e}")))?;
    let (h, d, dh, dm, v) = (cfg.n_heads, cfg.d_model, cfg.d_head, cfg.d_mlp, cfg.d_vocab);

    let mut out = HashMap::new();
    let put_normal = |out: &mut HashMap<String, Tensor>, ctx: &mut ExecContext, name: String, dims: &[usize]| -> Result<()> {
        let n: usize = dims.iter().product();
        let data: Vec<f32> = (0..n).map(|_| normal.sample(ctx.rng())).collect();
        out.insert(name, ctx.tensor_from_vec(data, dims)?);
        Ok(())
    };

    put_normal(&mut out, ctx, "embed.W_E".into(), &[v, d])?;
    put_normal(&mut out, ctx, "pos_embed.W_pos".into(), &[cfg.n_ctx, d])?;
    put_normal(&mut out, ctx, "unembed.W_U".into(), &[d, v])?;
    out.insert("unembed.b_U".into(), ctx.zeros(&[v])?);
    out.insert("ln_final.w".into(), ctx.ones(&[d])?);
    out.insert("ln_final.b".into(), ctx.zeros(&[d])?);

    for i in 0..cfg.n_layers {
        let p = |n: &str| format!("blocks.{i}.{n}");
        for ln in ["ln1", "ln2"] {
            out.insert(p(&format!("{ln}.w")), ctx.ones(&[d])?);
            out.insert(p(&format!("{ln}.b")), ctx.zeros(&[d])?);
        }
        for w in ["W_Q", "W_K", "W_V"] {
            put_normal(&mut out, ctx, p(&format!("attn.{w}")), &[h, d, dh])?;
        }
        for bias in ["b_Q", "b_K", "b_V"] {
            out.insert(p(&format!("attn.{bias}")), ctx.zeros(&[h, dh])?);
        }
        put_normal(&mut out, ctx, p("attn.W_O"), &[h, dh, d])?;
        put_normal(&mut out, ctx, p("attn.b_O"), &[d])?;
        put_normal(&mut out, ctx, p("mlp.W_in"), &[d, dm])?;
        out.insert(p("mlp.b_in"), ctx.zeros(&[dm])?);
        put_normal(&mut out, ctx, p("mlp.W_out"), &[dm, d])?;
        out.insert(p("mlp.b_out"), ctx.zeros(&[d])?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy() -> (CircuitTransformer, ExecContext) {
        let mut ctx = ExecContext::cpu(3);
        let model = CircuitTransformer::random(TransformerConfig::toy(), 0.2, &mut ctx).unwrap();
        (model, ctx)
    }

    #[test]
    fn test_forward_shapes() {
        let (model, _) = toy();
        let tokens = Tensor::new(&[[1u32, 2, 3, 4], [5, 6, 7, 8]], model.device()).unwrap();
        let logits = model.forward(&tokens).unwrap();
        assert_eq!(logits.dims(), &[2, 4, 24]);
        assert_eq!(model.w_o_stack().unwrap().dims(), &[2, 2, 8, 16]);
        assert_eq!(model.b_o_stack().unwrap().dims(), &[2, 16]);
    }

    #[test]
    fn test_causality() {
        let (model, _) = toy();
        let a = Tensor::new(&[[1u32, 2, 3, 4]], model.device()).unwrap();
        let b = Tensor::new(&[[1u32, 2, 9, 9]], model.device()).unwrap();
        let la: Vec<f32> = model.forward(&a).unwrap().get(0).unwrap().get(1).unwrap().to_vec1().unwrap();
        let lb: Vec<f32> = model.forward(&b).unwrap().get(0).unwrap().get(1).unwrap().to_vec1().unwrap();
        for (x, y) in la.iter().zip(&lb) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_rejects_long_sequences() {
        let (model, _) = toy();
        let tokens = Tensor::zeros((1, 17), DType::U32, model.device()).unwrap();
        assert!(matches!(model.forward(&tokens), Err(Error::BadInput(_))));
    }

    #[test]
    fn test_incomplete_weights_are_rejected() {
        let mut ctx = ExecContext::cpu(11);
        let cfg = TransformerConfig::toy();
        let mut tensors = random_tensors(&cfg, 0.1, &mut ctx).unwrap();
        let name = tensors.keys().find(|k| k.ends_with("W_O")).cloned().unwrap();
        tensors.remove(&name);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let err = CircuitTransformer::load_safetensors(cfg.clone(), &[&path], &ctx).unwrap_err();
        assert!(matches!(err, Error::BadWeights(_)), "{err:?}");
        assert!(err.is_config_error());

        let missing = dir.path().join("missing.safetensors");
        let err = CircuitTransformer::load_safetensors(cfg, &[&missing], &ctx).unwrap_err();
        assert!(matches!(err, Error::BadWeights(_)), "{err:?}");
    }

    #[test]
    fn test_safetensors_roundtrip() {
        let mut ctx = ExecContext::cpu(11);
        let cfg = TransformerConfig::toy();
        let tensors = random_tensors(&cfg, 0.1, &mut ctx).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let a = CircuitTransformer::from_var_builder(
            cfg.clone(),
            VarBuilder::from_tensors(tensors, DType::F32, &Device::Cpu),
        )
        .unwrap();
        let b = CircuitTransformer::load_safetensors(cfg, &[&path], &ctx).unwrap();

        let tokens = Tensor::new(&[[3u32, 1, 4, 1, 5]], &Device::Cpu).unwrap();
        let diff = (a.forward(&tokens).unwrap() - b.forward(&tokens).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }
}
