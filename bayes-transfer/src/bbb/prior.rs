use candle_core::{Shape, Tensor};

use crate::error::{BbbError, Result};

/// Floor on posterior and prior σ before `log` and division
pub const SIGMA_FLOOR: f64 = 1e-8;

/// Prior attached to one weight group of a Bayesian layer.
///
/// Resolved once, when the layer is built or when a trained network is
/// loaded as prior; never re-decided during training.
#[derive(Clone, Debug)]
pub enum PriorKind {
    /// p(w) = N(0, exp(log_variance)), shared by every element
    Fixed { log_variance: f64 },
    /// p(w) = N(mean, sigma²) element-wise; frozen snapshots taken from
    /// another network's posterior
    Learned { mean: Tensor, sigma: Tensor },
}

impl PriorKind {
    pub fn fixed(log_variance: f64) -> Self {
        Self::Fixed { log_variance }
    }

    /// Snapshot `(source_mean, source_sigma)` as a pointwise prior for
    /// a weight tensor of shape `target`.
    ///
    /// The snapshots are detached and copied into fresh storage, so
    /// neither gradients nor later optimizer updates of the source
    /// reach them.
    pub fn learned(
        param: &str,
        target: &Shape,
        source_mean: &Tensor,
        source_sigma: &Tensor,
    ) -> Result<Self> {
        for (name, source) in [("mean", source_mean), ("sigma", source_sigma)] {
            if source.shape() != target {
                return Err(BbbError::ShapeMismatch {
                    param: format!("{}.{}", param, name),
                    expected: target.clone(),
                    found: source.shape().clone(),
                });
            }
        }
        Ok(Self::Learned {
            mean: source_mean.detach().copy()?,
            sigma: source_sigma.detach().copy()?,
        })
    }

    pub fn is_learned(&self) -> bool {
        matches!(self, Self::Learned { .. })
    }

    /// KL(N(mean, sigma²) || prior), summed over all elements
    ///
    /// # Returns
    /// Scalar tensor
    pub fn kl_from(&self, mean: &Tensor, sigma: &Tensor) -> Result<Tensor> {
        let kl = match self {
            Self::Fixed { log_variance } => {
                let prior_sigma = (0.5 * log_variance).exp().max(SIGMA_FLOOR);
                fixed_gaussian_kl(mean, sigma, prior_sigma)?
            }
            Self::Learned {
                mean: prior_mean,
                sigma: prior_sigma,
            } => gaussian_kl(mean, sigma, prior_mean, prior_sigma)?,
        };
        Ok(kl.sum_all()?)
    }
}

/// Element-wise KL between two Gaussians
///
/// ```text
/// KL = log(ps/s) + (s² + (m - pm)²) / (2 ps²) - 1/2
/// ```
pub fn gaussian_kl(
    mean: &Tensor,
    sigma: &Tensor,
    prior_mean: &Tensor,
    prior_sigma: &Tensor,
) -> candle_core::Result<Tensor> {
    let s = sigma.maximum(SIGMA_FLOOR)?;
    let ps = prior_sigma.maximum(SIGMA_FLOOR)?;
    let diff_sq = mean.sub(prior_mean)?.sqr()?;
    let log_ratio = ps.log()?.sub(&s.log()?)?;
    let quad = s.sqr()?.add(&diff_sq)?.div(&(ps.sqr()? * 2.0)?)?;
    log_ratio.add(&quad)? - 0.5
}

/// Element-wise KL against a zero-mean scalar Gaussian N(0, ps²)
pub fn fixed_gaussian_kl(
    mean: &Tensor,
    sigma: &Tensor,
    prior_sigma: f64,
) -> candle_core::Result<Tensor> {
    let s = sigma.maximum(SIGMA_FLOOR)?;
    let log_ratio = (s.log()?.neg()? + prior_sigma.ln())?;
    let quad = (s.sqr()?.add(&mean.sqr()?)? / (2.0 * prior_sigma * prior_sigma))?;
    log_ratio.add(&quad)? - 0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_identical_learned_prior_zero_kl() -> Result<()> {
        let mean = Tensor::randn(0f32, 1f32, (6, 4), &Device::Cpu)?;
        let sigma = Tensor::rand(0.01f32, 2f32, (6, 4), &Device::Cpu)?;
        let prior = PriorKind::learned("weight", mean.shape(), &mean, &sigma)?;

        let kl: Vec<Vec<f32>> = match &prior {
            PriorKind::Learned {
                mean: pm,
                sigma: ps,
            } => gaussian_kl(&mean, &sigma, pm, ps)?.to_vec2()?,
            _ => unreachable!(),
        };
        for row in kl {
            for v in row {
                assert_eq!(v, 0.0);
            }
        }

        let total: f32 = prior.kl_from(&mean, &sigma)?.to_scalar()?;
        assert_eq!(total, 0.0);
        Ok(())
    }

    #[test]
    fn test_identical_fixed_prior_zero_kl() -> Result<()> {
        let log_variance = 0.3f64;
        let prior_sigma = (0.5 * log_variance).exp();
        let mean = Tensor::zeros((3, 5), DType::F64, &Device::Cpu)?;
        let sigma = (Tensor::ones((3, 5), DType::F64, &Device::Cpu)? * prior_sigma)?;

        let kl: f64 = PriorKind::fixed(log_variance)
            .kl_from(&mean, &sigma)?
            .to_scalar()?;
        approx::assert_abs_diff_eq!(kl, 0.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_fixed_prior_closed_form() -> Result<()> {
        let mean = Tensor::new(&[0.5f64, -1.0], &Device::Cpu)?;
        let sigma = Tensor::new(&[0.1f64, 2.0], &Device::Cpu)?;
        let kl: f64 = PriorKind::fixed(0.0).kl_from(&mean, &sigma)?.to_scalar()?;

        let expected: f64 = [(0.5f64, 0.1f64), (-1.0, 2.0)]
            .iter()
            .map(|(m, s)| -s.ln() + (s * s + m * m) / 2.0 - 0.5)
            .sum();
        approx::assert_relative_eq!(kl, expected, max_relative = 1e-12);
        Ok(())
    }

    #[test]
    fn test_kl_non_negative_random_pairs() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let n = 16;
            let draw = |rng: &mut StdRng, lo: f64, hi: f64| -> Vec<f64> {
                (0..n).map(|_| rng.random_range(lo..hi)).collect()
            };
            let mean = Tensor::from_vec(draw(&mut rng, -3.0, 3.0), n, &Device::Cpu)?;
            let sigma = Tensor::from_vec(draw(&mut rng, 1e-3, 5.0), n, &Device::Cpu)?;
            let prior_mean = Tensor::from_vec(draw(&mut rng, -3.0, 3.0), n, &Device::Cpu)?;
            let prior_sigma = Tensor::from_vec(draw(&mut rng, 1e-3, 5.0), n, &Device::Cpu)?;

            let kl: Vec<f64> = gaussian_kl(&mean, &sigma, &prior_mean, &prior_sigma)?.to_vec1()?;
            assert!(kl.iter().all(|&v| v >= -1e-12), "negative KL: {:?}", kl);

            let log_variance = rng.random_range(-4.0..4.0);
            let kl: f64 = PriorKind::fixed(log_variance)
                .kl_from(&mean, &sigma)?
                .to_scalar()?;
            assert!(kl >= -1e-10);
        }
        Ok(())
    }

    #[test]
    fn test_learned_prior_shape_mismatch() -> Result<()> {
        let target = Shape::from((4, 3));
        let mean = Tensor::zeros((3, 4), DType::F32, &Device::Cpu)?;
        let sigma = Tensor::ones((4, 3), DType::F32, &Device::Cpu)?;
        match PriorKind::learned("layer.0.weight", &target, &mean, &sigma) {
            Err(BbbError::ShapeMismatch { param, .. }) => assert_eq!(param, "layer.0.weight.mean"),
            other => panic!("expected shape mismatch, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_learned_prior_is_a_copy() -> Result<()> {
        let var = candle_core::Var::ones((2, 2), DType::F32, &Device::Cpu)?;
        let sigma = Tensor::ones((2, 2), DType::F32, &Device::Cpu)?;
        let prior = PriorKind::learned("weight", var.shape(), var.as_tensor(), &sigma)?;

        var.set(&Tensor::zeros((2, 2), DType::F32, &Device::Cpu)?)?;

        if let PriorKind::Learned { mean, .. } = prior {
            let v: Vec<Vec<f32>> = mean.to_vec2()?;
            assert_eq!(v, vec![vec![1.0, 1.0], vec![1.0, 1.0]]);
        } else {
            panic!("expected a learned prior");
        }
        Ok(())
    }
}
