//! Per-pass activation cache.
//!
//! Holds the outputs of every upstream component seen so far in the current
//! forward pass: the mlp-like list (embedding, then each MLP) and the
//! attention list (per-head outputs of each attention block). The trainer
//! owns the cache and clears it before every pass; the edge patcher borrows
//! it exclusively for the duration of that pass.

use candle_core::Tensor;

use crate::error::{Error, Result};

/// Component outputs produced so far in one forward pass.
#[derive(Debug, Default, Clone)]
pub struct ActivationCache {
    mlp: Vec<Tensor>,
    attn: Vec<Tensor>,
}

impl ActivationCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all cached activations
    pub fn clear(&mut self) {
        self.mlp.clear();
        self.attn.clear();
    }

    /// Append an embedding or MLP output `(B, S, D)`
    pub fn push_mlp(&mut self, t: Tensor) {
        self.mlp.push(t);
    }

    /// Append per-head attention outputs `(B, S, H, X)`
    pub fn push_attn(&mut self, t: Tensor) {
        self.attn.push(t);
    }

    /// Number of mlp-like entries
    #[inline]
    pub fn mlp_len(&self) -> usize {
        self.mlp.len()
    }

    /// Number of attention entries
    #[inline]
    pub fn attn_len(&self) -> usize {
        self.attn.len()
    }

    /// Shapes of every entry, for diagnostics
    pub fn shapes(&self) -> (Vec<Vec<usize>>, Vec<Vec<usize>>) {
        (
            self.mlp.iter().map(|t| t.dims().to_vec()).collect(),
            self.attn.iter().map(|t| t.dims().to_vec()).collect(),
        )
    }

    /// The first `n` mlp-like entries stacked on dim 2: `(B, S, n, D)`.
    pub fn stack_mlp(&self, n: usize) -> Result<Tensor> {
        Self::stack(&self.mlp, n, "mlp")
    }

    /// The first `n` attention entries stacked on dim 2: `(B, S, n, H, X)`.
    pub fn stack_attn(&self, n: usize) -> Result<Tensor> {
        Self::stack(&self.attn, n, "attention")
    }

    fn stack(list: &[Tensor], n: usize, what: &str) -> Result<Tensor> {
        if list.len() < n || n == 0 {
            return Err(Error::Candle(candle_core::Error::Msg(format!(
                "need {n} cached {what} outputs, have {}",
                list.len()
            ))));
        }
        Ok(Tensor::stack(&list[..n], 2)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_stack_and_clear() {
        let mut cache = ActivationCache::new();
        for _ in 0..3 {
            cache.push_mlp(Tensor::zeros((2, 5, 4), DType::F32, &Device::Cpu).unwrap());
        }
        cache.push_attn(Tensor::zeros((2, 5, 3, 4), DType::F32, &Device::Cpu).unwrap());

        assert_eq!(cache.stack_mlp(2).unwrap().dims(), &[2, 5, 2, 4]);
        assert_eq!(cache.stack_attn(1).unwrap().dims(), &[2, 5, 1, 3, 4]);
        assert!(cache.stack_attn(2).is_err());

        cache.clear();
        assert_eq!((cache.mlp_len(), cache.attn_len()), (0, 0));
        assert!(cache.stack_mlp(1).is_err());
    }
}
