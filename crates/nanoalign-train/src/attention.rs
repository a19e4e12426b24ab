//! Multi-head causal self-attention with RoPE and grouped KV heads.

use candle_core::{Device, Result, Tensor, D};
#[cfg(test)]
use candle_core::DType;
use candle_nn::VarBuilder;

use crate::layers::LinearTrain;

/// Precompute RoPE cos/sin tables, each `[max_seq_len, head_dim / 2]`.
pub fn precompute_rope_freqs(
    head_dim: usize,
    max_seq_len: usize,
    theta: f32,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let half_dim = head_dim / 2;
    let freqs: Vec<f32> = (0..half_dim)
        .map(|i| 1.0 / theta.powf(2.0 * i as f32 / head_dim as f32))
        .collect();
    let freqs = Tensor::from_vec(freqs, (1, half_dim), device)?;
    let positions: Vec<f32> = (0..max_seq_len).map(|p| p as f32).collect();
    let positions = Tensor::from_vec(positions, (max_seq_len, 1), device)?;
    let angles = positions.matmul(&freqs)?;
    Ok((angles.cos()?, angles.sin()?))
}

/// Rotate the two halves of the last dim. x: [batch, heads, seq, head_dim].
fn apply_rotary(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let half = x.dim(D::Minus1)? / 2;
    let x0 = x.narrow(D::Minus1, 0, half)?;
    let x1 = x.narrow(D::Minus1, half, half)?;

    let cos = cos.unsqueeze(0)?.unsqueeze(0)?;
    let sin = sin.unsqueeze(0)?.unsqueeze(0)?;

    let r0 = (x0.broadcast_mul(&cos)? - x1.broadcast_mul(&sin)?)?;
    let r1 = (x0.broadcast_mul(&sin)? + x1.broadcast_mul(&cos)?)?;
    Tensor::cat(&[&r0, &r1], D::Minus1)
}

/// Upper triangle -inf, diagonal and below 0.
pub(crate) fn causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Tensor::from_vec(mask, (seq_len, seq_len), device)
}

pub struct CausalSelfAttention {
    pub wq: LinearTrain,
    pub wk: LinearTrain,
    pub wv: LinearTrain,
    pub wo: LinearTrain,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
}

impl CausalSelfAttention {
    pub fn new(dim: usize, n_heads: usize, n_kv_heads: usize, vb: VarBuilder) -> Result<Self> {
        let head_dim = dim / n_heads;
        Ok(Self {
            wq: LinearTrain::new(dim, n_heads * head_dim, vb.pp("wq"))?,
            wk: LinearTrain::new(dim, n_kv_heads * head_dim, vb.pp("wk"))?,
            wv: LinearTrain::new(dim, n_kv_heads * head_dim, vb.pp("wv"))?,
            wo: LinearTrain::new(n_heads * head_dim, dim, vb.pp("wo"))?,
            n_heads,
            n_kv_heads,
            head_dim,
        })
    }

    /// x [batch, seq, dim] -> [batch, seq, dim]. cos/sin are already sliced to `seq`.
    pub fn forward(&self, x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _dim) = x.dims3()?;

        let q = self
            .wq
            .forward(x)?
            .reshape((batch, seq_len, self.n_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .wk
            .forward(x)?
            .reshape((batch, seq_len, self.n_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .wv
            .forward(x)?
            .reshape((batch, seq_len, self.n_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let q = apply_rotary(&q, cos, sin)?;
        let k = apply_rotary(&k, cos, sin)?;

        let (k, v) = if self.n_kv_heads < self.n_heads {
            let n_rep = self.n_heads / self.n_kv_heads;
            (k.repeat(&[1, n_rep, 1, 1])?, v.repeat(&[1, n_rep, 1, 1])?)
        } else {
            (k, v)
        };

        let scale = (self.head_dim as f64).sqrt();
        let scores = (q.contiguous()?.matmul(&k.transpose(2, 3)?.contiguous()?)? / scale)?;
        let mask = causal_mask(seq_len, scores.device())?;
        let scores = scores.broadcast_add(&mask)?;

        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let out = weights.matmul(&v.contiguous()?)?;
        let out = out
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.n_heads * self.head_dim))?;
        self.wo.forward(&out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    #[test]
    fn test_attention_output_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = CausalSelfAttention::new(64, 4, 2, vb.pp("attn"))?;

        let (cos, sin) = precompute_rope_freqs(16, 32, 10000.0, &device)?;
        let x = Tensor::randn(0.0f32, 1.0, (2, 8, 64), &device)?;
        let y = attn.forward(&x, &cos.narrow(0, 0, 8)?, &sin.narrow(0, 0, 8)?)?;
        assert_eq!(y.dims(), &[2, 8, 64]);
        Ok(())
    }

    #[test]
    fn test_causal_mask() -> Result<()> {
        let vals = causal_mask(4, &Device::Cpu)?.to_vec2::<f32>()?;
        assert_eq!(vals[0][0], 0.0);
        assert_eq!(vals[2][1], 0.0);
        assert!(vals[0][1].is_infinite() && vals[0][1] < 0.0);
        assert!(vals[2][3].is_infinite());
        Ok(())
    }

    #[test]
    fn test_rope_preserves_norm() -> Result<()> {
        let device = Device::Cpu;
        let (cos, sin) = precompute_rope_freqs(16, 8, 10000.0, &device)?;
        let q = Tensor::randn(0.0f32, 1.0, (1, 4, 8, 16), &device)?;
        let q_rot = apply_rotary(&q, &cos, &sin)?;

        let orig = q.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?;
        let rot = q_rot.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?;
        assert!((orig - rot).abs() / orig < 0.01, "{} vs {}", orig, rot);
        Ok(())
    }

    #[test]
    fn test_future_tokens_do_not_leak() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = CausalSelfAttention::new(32, 4, 4, vb.pp("attn"))?;
        let (cos, sin) = precompute_rope_freqs(8, 8, 10000.0, &device)?;

        let x = Tensor::randn(0.0f32, 1.0, (1, 6, 32), &device)?;
        let full = attn.forward(&x, &cos.narrow(0, 0, 6)?, &sin.narrow(0, 0, 6)?)?;
        let prefix = attn.forward(
            &x.narrow(1, 0, 3)?,
            &cos.narrow(0, 0, 3)?,
            &sin.narrow(0, 0, 3)?,
        )?;

        let diff = (full.narrow(1, 0, 3)? - prefix)?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-5, "prefix output changed by {}", diff);
        Ok(())
    }
}
