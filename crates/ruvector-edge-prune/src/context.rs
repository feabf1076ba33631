//! Explicit execution context.
//!
//! Every component that allocates tensors or draws random numbers takes an
//! [`ExecContext`] at construction time instead of reading ambient global
//! state. The context carries the device, the numeric precision and the
//! random generator used for mask noise and weight initialisation.

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::Result;

/// Device, precision and random generator shared by one pruning run.
#[derive(Debug, Clone)]
pub struct ExecContext {
    /// Device every tensor of the run lives on
    pub device: Device,
    /// Floating point precision for activations and parameters
    pub dtype: DType,
    rng: StdRng,
}

impl ExecContext {
    /// Create a context on an explicit device.
    pub fn new(device: Device, dtype: DType, seed: u64) -> Self {
        Self {
            device,
            dtype,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// CPU, f32, seeded.
    pub fn cpu(seed: u64) -> Self {
        Self::new(Device::Cpu, DType::F32, seed)
    }

    /// Mutable access to the random generator.
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Uniform `[0, 1)` noise tensor of the given shape.
    ///
    /// Noise is drawn on the host from the context generator so a fixed seed
    /// reproduces the same masks on any device.
    pub fn uniform(&mut self, dims: &[usize]) -> Result<Tensor> {
        let n: usize = dims.iter().product();
        let data: Vec<f32> = (0..n).map(|_| self.rng.gen::<f32>()).collect();
        self.tensor_from_vec(data, dims)
    }

    /// Build a tensor in the context dtype from host f32 data.
    pub fn tensor_from_vec(&self, data: Vec<f32>, dims: &[usize]) -> Result<Tensor> {
        let t = Tensor::from_vec(data, dims, &self.device)?;
        Ok(t.to_dtype(self.dtype)?)
    }

    /// Zeros in the context dtype.
    pub fn zeros(&self, dims: &[usize]) -> Result<Tensor> {
        Ok(Tensor::zeros(dims, self.dtype, &self.device)?)
    }

    /// Ones in the context dtype.
    pub fn ones(&self, dims: &[usize]) -> Result<Tensor> {
        Ok(Tensor::ones(dims, self.dtype, &self.device)?)
    }
}
