use candle_core::Tensor;

use crate::error::Result;

pub trait BayesModuleT {
    /// A stochastic classifier that spits out two results (logits, KL)
    ///
    /// # Arguments
    /// * `x_nd` - input data (n x d)
    ///
    /// # Returns `(logits_nk, kl)`
    /// * `logits_nk` - class logits (n x k), one weight draw per call
    /// * `kl` - scalar KL(q || p) summed over every weight
    fn forward_with_kl(&self, x_nd: &Tensor) -> Result<(Tensor, Tensor)>;

    /// Like `forward_with_kl` on a batch stacked `num_samples` times
    /// (replica-major), with an independent weight draw per replica
    ///
    /// # Returns `(logits_nk, kl)`
    /// * `logits_nk` - class logits, one row per input row
    /// * `kl` - scalar KL(q || p), evaluated once
    fn forward_samples_with_kl(&self, x_nd: &Tensor, num_samples: usize)
        -> Result<(Tensor, Tensor)>;

    /// Logits under the posterior means (no sampling)
    fn forward_mean(&self, x_nd: &Tensor) -> Result<Tensor>;

    fn dim_input(&self) -> usize;

    fn dim_output(&self) -> usize;
}
