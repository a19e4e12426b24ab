//! Pre-norm transformer block.

#[cfg(test)]
use candle_core::DType;
use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use crate::attention::CausalSelfAttention;
use crate::config::ModelConfig;
use crate::ffn::FeedForwardTrain;
use crate::layers::RMSNormTrain;

/// x + attn(norm(x)), then x + ffn(norm(x)).
pub struct TransformerBlockTrain {
    pub norm_attn: RMSNormTrain,
    pub attention: CausalSelfAttention,
    pub norm_ffn: RMSNormTrain,
    pub ffn: FeedForwardTrain,
}

impl TransformerBlockTrain {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm_attn: RMSNormTrain::new(config.dim, config.norm_eps, vb.pp("norm_attn"))?,
            attention: CausalSelfAttention::new(
                config.dim,
                config.n_heads,
                config.n_kv_heads,
                vb.pp("attn"),
            )?,
            norm_ffn: RMSNormTrain::new(config.dim, config.norm_eps, vb.pp("norm_ffn"))?,
            ffn: FeedForwardTrain::new(config.dim, config.ffn_dim(), vb.pp("ffn"))?,
        })
    }

    /// x [batch, seq, dim] -> [batch, seq, dim]
    pub fn forward(&self, x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let h = self.attention.forward(&self.norm_attn.forward(x)?, cos, sin)?;
        let x = (x + h)?;
        let h = self.ffn.forward(&self.norm_ffn.forward(&x)?)?;
        x + h
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::precompute_rope_freqs;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn test_block_preserves_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cfg = ModelConfig::tiny();
        let block = TransformerBlockTrain::new(&cfg, vb.pp("block"))?;

        let (cos, sin) =
            precompute_rope_freqs(cfg.head_dim(), cfg.max_seq_len, cfg.rope_theta, &device)?;
        let x = Tensor::randn(0.0f32, 1.0, (2, 5, cfg.dim), &device)?;
        let y = block.forward(&x, &cos.narrow(0, 0, 5)?, &sin.narrow(0, 0, 5)?)?;
        assert_eq!(y.dims(), &[2, 5, cfg.dim]);
        Ok(())
    }
}
