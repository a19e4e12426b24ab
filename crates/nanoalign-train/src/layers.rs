//! Trainable layers: bias-free linear projection and RMSNorm.

use candle_core::{Result, Tensor};
#[cfg(test)]
use candle_core::DType;
use candle_nn::VarBuilder;

/// Bias-free linear layer, GPT-2 style N(0, 0.02) init.
pub struct LinearTrain {
    weight: Tensor, // [out_features, in_features]
    pub in_features: usize,
    pub out_features: usize,
}

impl LinearTrain {
    pub fn new(in_f: usize, out_f: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_f, in_f),
            "weight",
            candle_nn::Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        Ok(Self {
            weight,
            in_features: in_f,
            out_features: out_f,
        })
    }

    /// x [.., in] -> [.., out]; 3D input is flattened for the matmul.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let w = self.weight.t()?;
        let x_dims = x.dims().to_vec();
        if x_dims.len() == 3 {
            let (b, m, k) = (x_dims[0], x_dims[1], x_dims[2]);
            x.reshape((b * m, k))?.matmul(&w)?.reshape((b, m, ()))
        } else {
            x.matmul(&w)
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

/// RMSNorm for training (differentiable).
pub struct RMSNormTrain {
    weight: Tensor, // [dim]
    eps: f64,
    pub dim: usize,
}

impl RMSNormTrain {
    pub fn new(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(dim, "weight", candle_nn::Init::Const(1.0))?;
        Ok(Self { weight, eps, dim })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let last_dim = x.dims().len() - 1;
        let variance = x.sqr()?.mean_keepdim(last_dim)?;
        let denominator = (variance + self.eps)?.sqrt()?;
        x.broadcast_div(&denominator)?.broadcast_mul(&self.weight)
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn test_linear_forward_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = LinearTrain::new(64, 32, vb.pp("test"))?;

        let x = Tensor::randn(0.0f32, 1.0, (2, 8, 64), &device)?;
        assert_eq!(layer.forward(&x)?.dims(), &[2, 8, 32]);

        let x2 = Tensor::randn(0.0f32, 1.0, (5, 64), &device)?;
        assert_eq!(layer.forward(&x2)?.dims(), &[5, 32]);
        Ok(())
    }

    #[test]
    fn test_linear_gradient_flows() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = LinearTrain::new(16, 8, vb.pp("test"))?;

        let x = Tensor::randn(0.0f32, 1.0, (1, 1, 16), &device)?;
        let loss = layer.forward(&x)?.sum_all()?;
        let grads = loss.backward()?;

        let grad = grads.get(layer.weight()).expect("weight should have gradient");
        let gn = grad.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?;
        assert!(gn > 0.0);
        Ok(())
    }

    #[test]
    fn test_rmsnorm_output_normalized() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = RMSNormTrain::new(64, 1e-6, vb.pp("test"))?;

        let x = Tensor::randn(0.0f32, 1.0, (2, 4, 64), &device)?;
        let y = norm.forward(&x)?;

        let rms = y.sqr()?.mean_keepdim(2)?.sqrt()?;
        for v in rms.flatten_all()?.to_vec1::<f32>()? {
            assert!((v - 1.0).abs() < 0.1, "RMS should be ~1.0, got {}", v);
        }
        Ok(())
    }
}
