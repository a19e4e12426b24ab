//! SwiGLU feed-forward network.

use candle_core::{Result, Tensor};
#[cfg(test)]
use candle_core::DType;
use candle_nn::VarBuilder;

use crate::layers::LinearTrain;

/// w_down(silu(w_gate(x)) * w_up(x))
pub struct FeedForwardTrain {
    pub w_gate: LinearTrain,
    pub w_up: LinearTrain,
    pub w_down: LinearTrain,
}

impl FeedForwardTrain {
    pub fn new(dim: usize, ffn_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            w_gate: LinearTrain::new(dim, ffn_dim, vb.pp("w_gate"))?,
            w_up: LinearTrain::new(dim, ffn_dim, vb.pp("w_up"))?,
            w_down: LinearTrain::new(ffn_dim, dim, vb.pp("w_down"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.w_gate.forward(x)?)?;
        let up = self.w_up.forward(x)?;
        self.w_down.forward(&(gate * up)?)
    }
}
