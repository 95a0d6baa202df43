use candle_core::Tensor;
use clap::ValueEnum;

use crate::error::{BbbError, Result};

/// Blundell et al. minibatch weighting of the KL term
///
/// ```text
/// β_i = 2^(m-i) / (2^m - 1),   i = 1..m
/// ```
///
/// evaluated as `2^(-i) / (1 - 2^(-m))`, which is the same ratio but
/// never forms `2^m`, so it holds for any `m` (the numerator quietly
/// underflows to 0 for the last batches of very long epochs). The
/// weights sum to 1 over one epoch.
pub fn blundell_beta(i: usize, m: usize) -> Result<f64> {
    check_position(i, m)?;
    let num = (-(i as f64)).exp2();
    let denom = 1.0 - (-(m as f64)).exp2();
    Ok(num / denom)
}

fn check_position(i: usize, m: usize) -> Result<()> {
    if m == 0 || i == 0 || i > m {
        return Err(BbbError::InvalidArgument(format!(
            "minibatch position {} out of 1..={}",
            i, m
        )));
    }
    Ok(())
}

/// How much of the full-data KL each minibatch carries
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[clap(rename_all = "lowercase")]
pub enum KlWeighting {
    /// β_i = 2^(m-i) / (2^m - 1): early batches take most of the KL
    #[default]
    Blundell,
    /// β_i = 1/m
    Uniform,
}

impl KlWeighting {
    /// KL coefficient of the `i`-th (1-indexed) of `m` minibatches
    pub fn beta(&self, i: usize, m: usize) -> Result<f64> {
        match self {
            KlWeighting::Blundell => blundell_beta(i, m),
            KlWeighting::Uniform => {
                check_position(i, m)?;
                Ok(1.0 / m as f64)
            }
        }
    }
}

/// Mean log-likelihood of integer class `targets` under `logits`,
/// i.e. negative cross-entropy averaged over rows
///
/// * `logits_nk` - (n, k)
/// * `targets_n` - (n,) u32
pub fn mean_log_likelihood(logits_nk: &Tensor, targets_n: &Tensor) -> Result<Tensor> {
    Ok(candle_nn::loss::cross_entropy(logits_nk, targets_n)?.neg()?)
}

/// The pieces of one minibatch objective
pub struct ObjectiveTerms {
    /// scalar to minimise
    pub loss: Tensor,
    /// mean log-likelihood over the stacked samples
    pub log_likelihood: Tensor,
    /// `total_kl / num_samples`, before β
    pub kl: Tensor,
}

/// Negative ELBO of one minibatch stacked `num_samples` times
///
/// ```text
/// loss = β * KL / S - mean_log_likelihood
/// ```
///
/// Dividing by `S` compensates for the KL being evaluated once while
/// the likelihood averages over `S` replicated copies of the batch,
/// each under its own weight draw.
#[derive(Debug, Clone)]
pub struct VariationalObjective {
    num_samples: usize,
}

impl VariationalObjective {
    pub fn new(num_samples: usize) -> Result<Self> {
        if num_samples == 0 {
            return Err(BbbError::InvalidArgument("num_samples must be > 0".into()));
        }
        Ok(Self { num_samples })
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// Scalar loss to minimise
    pub fn compute(
        &self,
        logits_nk: &Tensor,
        targets_n: &Tensor,
        total_kl: &Tensor,
        beta: f64,
    ) -> Result<Tensor> {
        Ok(self.evaluate(logits_nk, targets_n, total_kl, beta)?.loss)
    }

    /// Loss together with its likelihood and KL parts
    pub fn evaluate(
        &self,
        logits_nk: &Tensor,
        targets_n: &Tensor,
        total_kl: &Tensor,
        beta: f64,
    ) -> Result<ObjectiveTerms> {
        let log_likelihood = mean_log_likelihood(logits_nk, targets_n)?;
        let kl = (total_kl / self.num_samples as f64)?;
        let loss = ((&kl * beta)? - &log_likelihood)?;
        Ok(ObjectiveTerms {
            loss,
            log_likelihood,
            kl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_beta_sums_to_one() -> Result<()> {
        for m in [1usize, 3, 10, 60, 100, 2000] {
            let total: f64 = (1..=m).map(|i| blundell_beta(i, m)).sum::<Result<f64>>()?;
            approx::assert_abs_diff_eq!(total, 1.0, epsilon = 1e-12);

            let total: f64 = (1..=m)
                .map(|i| KlWeighting::Uniform.beta(i, m))
                .sum::<Result<f64>>()?;
            approx::assert_abs_diff_eq!(total, 1.0, epsilon = 1e-9);
        }
        Ok(())
    }

    #[test]
    fn test_beta_small_m_exact() -> Result<()> {
        // m = 3: 4/7, 2/7, 1/7
        approx::assert_relative_eq!(blundell_beta(1, 3)?, 4.0 / 7.0, max_relative = 1e-14);
        approx::assert_relative_eq!(blundell_beta(2, 3)?, 2.0 / 7.0, max_relative = 1e-14);
        approx::assert_relative_eq!(blundell_beta(3, 3)?, 1.0 / 7.0, max_relative = 1e-14);
        assert_eq!(blundell_beta(1, 1)?, 1.0);
        Ok(())
    }

    #[test]
    fn test_beta_large_m_finite_and_decreasing() -> Result<()> {
        let m = 100;
        let betas = (1..=m)
            .map(|i| blundell_beta(i, m))
            .collect::<Result<Vec<f64>>>()?;
        assert!(betas.iter().all(|b| b.is_finite() && *b > 0.0));
        assert!(betas.windows(2).all(|w| w[0] > w[1]));
        Ok(())
    }

    #[test]
    fn test_beta_out_of_range() {
        assert!(blundell_beta(0, 3).is_err());
        assert!(blundell_beta(4, 3).is_err());
        assert!(blundell_beta(1, 0).is_err());
        assert!(KlWeighting::Uniform.beta(0, 3).is_err());
    }

    #[test]
    fn test_objective_value() -> Result<()> {
        let device = Device::Cpu;
        // uniform logits over 2 classes: log-likelihood = -ln 2
        let logits = Tensor::zeros((4, 2), DType::F32, &device)?;
        let targets = Tensor::new(&[0u32, 1, 1, 0], &device)?;
        let kl = Tensor::new(10f32, &device)?;

        let objective = VariationalObjective::new(5)?;
        let terms = objective.evaluate(&logits, &targets, &kl, 0.5)?;

        let llik: f32 = terms.log_likelihood.to_scalar()?;
        let kl_scaled: f32 = terms.kl.to_scalar()?;
        let loss: f32 = objective.compute(&logits, &targets, &kl, 0.5)?.to_scalar()?;

        approx::assert_relative_eq!(llik, -(2f32.ln()), max_relative = 1e-5);
        approx::assert_relative_eq!(kl_scaled, 2.0, max_relative = 1e-6);
        approx::assert_relative_eq!(loss, 0.5 * 2.0 + 2f32.ln(), max_relative = 1e-5);
        Ok(())
    }

    #[test]
    fn test_zero_samples_rejected() {
        assert!(matches!(
            VariationalObjective::new(0),
            Err(BbbError::InvalidArgument(_))
        ));
    }
}
