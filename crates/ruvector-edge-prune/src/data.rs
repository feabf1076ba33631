//! Task batches.
//!
//! The trainer consumes an iterator of [`TaskBatch`]: token ids plus the
//! position whose next-token distribution is scored. [`SyntheticTask`] is a
//! seeded generator of repeated-sequence prompts used for smoke runs and
//! tests.

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};

/// One batch of prompts.
#[derive(Debug, Clone)]
pub struct TaskBatch {
    /// Token ids `(batch, seq_len)` of dtype `u32`
    pub tokens: Tensor,
    /// Answer position per example
    pub answer_positions: Vec<usize>,
}

impl TaskBatch {
    /// Validate and wrap a batch.
    pub fn new(tokens: Tensor, answer_positions: Vec<usize>) -> Result<Self> {
        let (b, s) = tokens.dims2()?;
        if answer_positions.len() != b {
            return Err(Error::BadInput(format!(
                "{} answer positions for a batch of {b}",
                answer_positions.len()
            )));
        }
        if let Some(p) = answer_positions.iter().find(|&&p| p >= s) {
            return Err(Error::BadInput(format!(
                "answer position {p} outside sequence of length {s}"
            )));
        }
        Ok(Self {
            tokens,
            answer_positions,
        })
    }

    /// Examples in the batch
    pub fn batch_size(&self) -> usize {
        self.answer_positions.len()
    }

    /// Tokens per example
    pub fn seq_len(&self) -> Result<usize> {
        Ok(self.tokens.dim(1)?)
    }
}

/// Endless seeded stream of repeated-token prompts.
///
/// Each prompt is a random prefix repeated twice; the answer position is
/// the last token, whose correct continuation is predictable from the first
/// repetition (an induction-style task).
#[derive(Debug, Clone)]
pub struct SyntheticTask {
    rng: StdRng,
    batch_size: usize,
    seq_len: usize,
    vocab: u32,
    device: Device,
}

impl SyntheticTask {
    /// Generator of `(batch_size, seq_len)` batches over `vocab` tokens.
    pub fn new(batch_size: usize, seq_len: usize, vocab: usize, seed: u64, device: Device) -> Result<Self> {
        if batch_size == 0 || seq_len < 2 || vocab < 2 {
            return Err(Error::BadConfig(format!(
                "synthetic task needs batch >= 1, seq_len >= 2, vocab >= 2 (got {batch_size}, {seq_len}, {vocab})"
            )));
        }
        Ok(Self {
            rng: StdRng::seed_from_u64(seed),
            batch_size,
            seq_len,
            vocab: vocab as u32,
            device,
        })
    }

    /// Draw the next batch.
    pub fn next_batch(&mut self) -> Result<TaskBatch> {
        let (b, s) = (self.batch_size, self.seq_len);
        let half = s.div_ceil(2);
        let mut data = Vec::with_capacity(b * s);
        for _ in 0..b {
            let prefix: Vec<u32> = (0..half).map(|_| self.rng.gen_range(0..self.vocab)).collect();
            data.extend((0..s).map(|i| prefix[i % half]));
        }
        let tokens = Tensor::from_vec(data, (b, s), &self.device)?;
        TaskBatch::new(tokens, vec![s - 1; b])
    }
}

impl Iterator for SyntheticTask {
    type Item = Result<TaskBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_batches() {
        let mut task = SyntheticTask::new(3, 6, 10, 1, Device::Cpu).unwrap();
        let batch = task.next().unwrap().unwrap();
        assert_eq!(batch.tokens.dims(), &[3, 6]);
        assert_eq!(batch.answer_positions, vec![5; 3]);
        let rows: Vec<Vec<u32>> = batch.tokens.to_vec2().unwrap();
        for row in rows {
            assert_eq!(row[..3], row[3..]);
            assert!(row.iter().all(|&t| t < 10));
        }
    }

    #[test]
    fn test_batch_validation() {
        let tokens = Tensor::zeros((2, 4), candle_core::DType::U32, &Device::Cpu).unwrap();
        assert!(TaskBatch::new(tokens.clone(), vec![3]).is_err());
        assert!(TaskBatch::new(tokens.clone(), vec![3, 4]).is_err());
        assert!(TaskBatch::new(tokens, vec![0, 3]).is_ok());
    }
}
