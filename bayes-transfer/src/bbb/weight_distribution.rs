use std::cell::RefCell;

use candle_core::{DType, Device, Shape, Tensor};
use candle_nn::{Init, VarBuilder};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::{BbbError, Result};

/// Below this point `log(1 + exp(x))` loses precision in f32 (and
/// rounds to zero past about -17), so we switch to the asymptote
/// `exp(x)`; the relative gap between the two is `exp(x) / 2`.
const SOFTPLUS_TAIL: f64 = -10.0;

/// Numerically stable softplus
///
/// ```text
/// softplus(x) = log(1 + exp(x))
///             = max(x, 0) + log(1 + exp(-|x|))
/// ```
///
/// and `exp(x)` in the far negative tail. The tail is floored at the
/// smallest positive normal value of the dtype (about `1.2e-38` in f32,
/// reached near `x = -87`), so σ never collapses to exactly zero.
/// Below the floor `SIGMA_FLOOR` still bounds `log σ` in the KL.
pub fn softplus(x: &Tensor) -> candle_core::Result<Tensor> {
    let stable = (x.relu()? + (x.abs()?.neg()?.exp()? + 1.0)?.log()?)?;
    // clamp before exp so the unused branch never produces inf gradients
    let tail = x
        .minimum(SOFTPLUS_TAIL)?
        .exp()?
        .maximum(smallest_positive(x.dtype()))?;
    x.lt(SOFTPLUS_TAIL)?.where_cond(&tail, &stable)
}

fn smallest_positive(dtype: DType) -> f64 {
    match dtype {
        DType::F64 => f64::MIN_POSITIVE,
        DType::F16 => 6.103_515_625e-5,
        _ => f32::MIN_POSITIVE as f64,
    }
}

/// Where the standard normal noise `ε` of the reparameterization
/// comes from.
#[derive(Default)]
pub enum NoiseSource {
    /// candle's own device generator (fast, not reproducible on CPU)
    #[default]
    Device,
    /// host-side generator seeded once; reproducible across runs
    Seeded(RefCell<StdRng>),
}

impl NoiseSource {
    pub fn seeded(seed: u64) -> Self {
        Self::Seeded(RefCell::new(StdRng::seed_from_u64(seed)))
    }

    /// Draw `ε ~ N(0, I)` of the given shape
    pub fn standard_normal(&self, shape: &Shape, dtype: DType, device: &Device) -> Result<Tensor> {
        match self {
            Self::Device => Ok(Tensor::randn(0f32, 1f32, shape.clone(), device)?.to_dtype(dtype)?),
            Self::Seeded(rng) => {
                let mut rng = rng.borrow_mut();
                let eps: Vec<f32> = (0..shape.elem_count())
                    .map(|_| StandardNormal.sample(&mut *rng))
                    .collect();
                // build on CPU first; Metal can't convert f64 on device
                Ok(Tensor::from_vec(eps, shape.clone(), &Device::Cpu)?
                    .to_dtype(dtype)?
                    .to_device(device)?)
            }
        }
    }
}

/// Mean-field Gaussian over one weight tensor
///
/// q(w) = N(μ, σ²), σ = softplus(ρ)
///
/// `mean` and `rho` are trainable variables registered in the
/// `VarMap` behind the `VarBuilder`; only the optimizer mutates them.
pub struct WeightDistribution {
    mean: Tensor,
    rho: Tensor,
}

impl WeightDistribution {
    /// Create a new weight distribution.
    ///
    /// # Arguments
    /// * `vb` - VarBuilder for the trainable `mean` and `rho`
    /// * `shape` - shape of the weight tensor
    /// * `fan_in` - input width; `mean ~ U(-1/√fan_in, 1/√fan_in)`
    /// * `rho_init` - constant initial ρ
    pub fn new<S: Into<Shape>>(
        vb: VarBuilder,
        shape: S,
        fan_in: usize,
        rho_init: f64,
    ) -> Result<Self> {
        let shape: Shape = shape.into();
        let bound = 1.0 / (fan_in.max(1) as f64).sqrt();
        let mean = vb.get_with_hints(
            shape.clone(),
            "mean",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        let rho = vb.get_with_hints(shape, "rho", Init::Const(rho_init))?;
        Ok(Self { mean, rho })
    }

    /// Wrap existing tensors; `mean` and `rho` must agree in shape
    pub fn from_tensors(mean: Tensor, rho: Tensor) -> Result<Self> {
        if mean.shape() != rho.shape() {
            return Err(BbbError::ShapeMismatch {
                param: "rho".into(),
                expected: mean.shape().clone(),
                found: rho.shape().clone(),
            });
        }
        Ok(Self { mean, rho })
    }

    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    pub fn rho(&self) -> &Tensor {
        &self.rho
    }

    /// σ = softplus(ρ)
    pub fn sigma(&self) -> Result<Tensor> {
        Ok(softplus(&self.rho)?)
    }

    pub fn shape(&self) -> &Shape {
        self.mean.shape()
    }

    /// Reparameterized draw: w = μ + σ ⊙ ε. Gradients flow into μ
    /// and ρ; ε is a constant.
    pub fn sample(&self, noise: &NoiseSource) -> Result<Tensor> {
        let epsilon = noise.standard_normal(self.shape(), self.mean.dtype(), self.mean.device())?;
        Ok((&self.mean + self.sigma()?.mul(&epsilon)?)?)
    }

    /// `num_samples` independent draws stacked on a new leading axis
    ///
    /// # Returns
    /// Tensor of shape `(num_samples, ..shape)`
    pub fn sample_n(&self, noise: &NoiseSource, num_samples: usize) -> Result<Tensor> {
        let mut dims = vec![num_samples];
        dims.extend_from_slice(self.shape().dims());
        let epsilon = noise.standard_normal(
            &Shape::from(dims),
            self.mean.dtype(),
            self.mean.device(),
        )?;
        Ok(epsilon
            .broadcast_mul(&self.sigma()?)?
            .broadcast_add(&self.mean)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    #[test]
    fn test_softplus_positive_f32() -> Result<()> {
        // past -104 a bare exp(x) underflows to 0 in f32
        let rho: Vec<f32> = (0..=1800).map(|i| -1000.0 + 0.6 * i as f32).collect();
        let x = Tensor::from_vec(rho.clone(), rho.len(), &Device::Cpu)?;
        let sigma: Vec<f32> = softplus(&x)?.to_vec1()?;
        for (r, s) in rho.iter().zip(sigma.iter()) {
            assert!(*s > 0.0 && s.is_finite(), "softplus({}) = {}", r, s);
        }
        Ok(())
    }

    #[test]
    fn test_softplus_positive_f64() -> Result<()> {
        let rho: Vec<f64> = (0..=1400).map(|i| -700.0 + i as f64).collect();
        let x = Tensor::from_vec(rho.clone(), rho.len(), &Device::Cpu)?;
        let sigma: Vec<f64> = softplus(&x)?.to_vec1()?;
        for (r, s) in rho.iter().zip(sigma.iter()) {
            assert!(*s > 0.0 && s.is_finite(), "softplus({}) = {}", r, s);
        }
        Ok(())
    }

    #[test]
    fn test_softplus_values() -> Result<()> {
        let x = Tensor::new(&[-30.0f64, -1.0, 0.0, 1.0, 50.0], &Device::Cpu)?;
        let y: Vec<f64> = softplus(&x)?.to_vec1()?;
        let expected = [(-30f64).exp(), (1.0 + (-1f64).exp()).ln(), 2f64.ln(), (1.0 + 1f64.exp()).ln(), 50.0];
        for (a, b) in y.iter().zip(expected.iter()) {
            approx::assert_relative_eq!(*a, *b, max_relative = 1e-10);
        }
        Ok(())
    }

    #[test]
    fn test_sample_shape_and_gradients() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);

        let q = WeightDistribution::new(vb, (4, 3), 4, -3.0)?;
        let w = q.sample(&NoiseSource::default())?;
        assert_eq!(w.dims(), &[4, 3]);

        let grads = w.sqr()?.sum_all()?.backward()?;
        assert!(grads.get(q.mean()).is_some());
        assert!(grads.get(q.rho()).is_some());
        Ok(())
    }

    #[test]
    fn test_softplus_floor_keeps_kl_finite() -> Result<()> {
        let rho = Tensor::new(&[-150f32, -500.0], &Device::Cpu)?;
        let sigma: Vec<f32> = softplus(&rho)?.to_vec1()?;
        assert!(sigma.iter().all(|&s| s >= f32::MIN_POSITIVE));

        let mean = Tensor::zeros(2, DType::F32, &Device::Cpu)?;
        let kl: f32 = crate::bbb::fixed_gaussian_kl(&mean, &softplus(&rho)?, 1.0)?
            .sum_all()?
            .to_scalar()?;
        assert!(kl.is_finite());
        Ok(())
    }

    #[test]
    fn test_sample_n_draws_are_independent() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);

        let q = WeightDistribution::new(vb, (3, 2), 3, 0.0)?;
        let w = q.sample_n(&NoiseSource::seeded(3), 4)?;
        assert_eq!(w.dims(), &[4, 3, 2]);

        let first: Vec<Vec<f32>> = w.get(0)?.to_vec2()?;
        for s in 1..4 {
            let other: Vec<Vec<f32>> = w.get(s)?.to_vec2()?;
            assert_ne!(first, other, "draw {} repeats draw 0", s);
        }

        let grads = w.sqr()?.sum_all()?.backward()?;
        assert!(grads.get(q.mean()).is_some());
        assert!(grads.get(q.rho()).is_some());
        Ok(())
    }

    #[test]
    fn test_seeded_sampling_reproducible() -> Result<()> {
        let mean = Tensor::zeros((5, 7), DType::F32, &Device::Cpu)?;
        let rho = Tensor::zeros((5, 7), DType::F32, &Device::Cpu)?;
        let q = WeightDistribution::from_tensors(mean, rho)?;

        let a: Vec<Vec<f32>> = q.sample(&NoiseSource::seeded(17))?.to_vec2()?;
        let b: Vec<Vec<f32>> = q.sample(&NoiseSource::seeded(17))?.to_vec2()?;
        let c: Vec<Vec<f32>> = q.sample(&NoiseSource::seeded(18))?.to_vec2()?;

        assert_eq!(a, b);
        assert_ne!(a, c);
        Ok(())
    }

    #[test]
    fn test_mismatched_rho_rejected() -> Result<()> {
        let mean = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
        let rho = Tensor::zeros((3, 2), DType::F32, &Device::Cpu)?;
        let res = WeightDistribution::from_tensors(mean, rho);
        assert!(matches!(res, Err(BbbError::ShapeMismatch { .. })));
        Ok(())
    }
}
