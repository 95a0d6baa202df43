use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use super::prior::PriorKind;
use super::weight_distribution::{NoiseSource, WeightDistribution};
use crate::error::{BbbError, Result};

/// The two weight groups of a layer, each with its own prior
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamGroup {
    Weight,
    Bias,
}

impl ParamGroup {
    pub fn name(&self) -> &'static str {
        match self {
            ParamGroup::Weight => "weight",
            ParamGroup::Bias => "bias",
        }
    }
}

/////////////////////////////////////////////
// Fully-connected layer with Gaussian     //
// posteriors over weights and biases      //
/////////////////////////////////////////////

pub struct BayesLinear {
    index: usize,
    in_dim: usize,
    out_dim: usize,
    weight: WeightDistribution, // in x out
    bias: WeightDistribution,   // out
    weight_prior: PriorKind,
    bias_prior: PriorKind,
}

/// Build the `index`-th layer of a network under `vb`
///
/// * `prior_log_variance` - log variance of the initial fixed prior
/// * `rho_init` - initial ρ of every posterior σ = softplus(ρ)
pub fn bayes_linear(
    index: usize,
    in_dim: usize,
    out_dim: usize,
    prior_log_variance: f64,
    rho_init: f64,
    vb: VarBuilder,
) -> Result<BayesLinear> {
    let weight = WeightDistribution::new(vb.pp("weight"), (in_dim, out_dim), in_dim, rho_init)?;
    let bias = WeightDistribution::new(vb.pp("bias"), out_dim, in_dim, rho_init)?;

    Ok(BayesLinear {
        index,
        in_dim,
        out_dim,
        weight,
        bias,
        weight_prior: PriorKind::fixed(prior_log_variance),
        bias_prior: PriorKind::fixed(prior_log_variance),
    })
}

impl BayesLinear {
    /// `h_out = h_in @ W + b` with `W`, `b` freshly sampled from the
    /// posterior; every call is an independent draw.
    ///
    /// * `h_nk` - (n, in) with one draw shared by all rows, or
    ///   (S, n, in) with an independent draw per leading index
    pub fn forward(&self, h_nk: &Tensor, noise: &NoiseSource) -> Result<Tensor> {
        match *h_nk.dims() {
            [nsamples, _, _] => {
                let w_skd = self.weight.sample_n(noise, nsamples)?;
                let b_s1d = self.bias.sample_n(noise, nsamples)?.unsqueeze(1)?;
                Ok(affine(h_nk, &w_skd, &b_s1d)?)
            }
            _ => {
                let w_kd = self.weight.sample(noise)?;
                let b_d = self.bias.sample(noise)?;
                Ok(affine(h_nk, &w_kd, &b_d)?)
            }
        }
    }

    /// Deterministic pass through the posterior means
    pub fn forward_mean(&self, h_nk: &Tensor) -> Result<Tensor> {
        Ok(affine(h_nk, self.weight.mean(), self.bias.mean())?)
    }

    /// KL(q || p) summed over the weight and bias groups
    pub fn kl_divergence(&self) -> Result<Tensor> {
        let kl_w = self.group_kl(ParamGroup::Weight)?;
        let kl_b = self.group_kl(ParamGroup::Bias)?;
        Ok((kl_w + kl_b)?)
    }

    fn group_kl(&self, group: ParamGroup) -> Result<Tensor> {
        let (q, prior) = self.group(group);
        prior.kl_from(q.mean(), &q.sigma()?)
    }

    /// Fails with `NumericInstability` naming this layer and the first
    /// group whose KL is not finite. Syncs with the host once per group.
    pub fn check_finite(&self) -> Result<()> {
        for group in [ParamGroup::Weight, ParamGroup::Bias] {
            if !is_finite_scalar(&self.group_kl(group)?)? {
                return Err(BbbError::NumericInstability {
                    layer: self.index,
                    param: group.name().into(),
                });
            }
        }
        Ok(())
    }

    /// Install a zero-mean isotropic prior on one group
    pub fn attach_fixed(&mut self, group: ParamGroup, log_variance: f64) {
        *self.prior_mut(group) = PriorKind::fixed(log_variance);
    }

    /// Install a pointwise prior on one group; shapes must match the
    /// group's weight tensor exactly.
    pub fn attach_learned(
        &mut self,
        group: ParamGroup,
        source_mean: &Tensor,
        source_sigma: &Tensor,
    ) -> Result<()> {
        let param = format!("layer.{}.{}", self.index, group.name());
        let prior = PriorKind::learned(&param, self.group(group).0.shape(), source_mean, source_sigma)?;
        *self.prior_mut(group) = prior;
        Ok(())
    }

    fn group(&self, group: ParamGroup) -> (&WeightDistribution, &PriorKind) {
        match group {
            ParamGroup::Weight => (&self.weight, &self.weight_prior),
            ParamGroup::Bias => (&self.bias, &self.bias_prior),
        }
    }

    fn prior_mut(&mut self, group: ParamGroup) -> &mut PriorKind {
        match group {
            ParamGroup::Weight => &mut self.weight_prior,
            ParamGroup::Bias => &mut self.bias_prior,
        }
    }

    pub fn posterior(&self, group: ParamGroup) -> &WeightDistribution {
        self.group(group).0
    }

    pub fn prior(&self, group: ParamGroup) -> &PriorKind {
        self.group(group).1
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }
}

fn affine(h_nk: &Tensor, w_kd: &Tensor, b_d: &Tensor) -> candle_core::Result<Tensor> {
    let h_nd = match (h_nk.rank(), w_kd.rank()) {
        (3, 2) => h_nk.matmul(&w_kd.broadcast_left(h_nk.dim(0)?)?)?,
        _ => h_nk.matmul(w_kd)?,
    };
    h_nd.broadcast_add(b_d)
}

/// Scalar tensor on any device holds a finite value
pub(crate) fn is_finite_scalar(x: &Tensor) -> candle_core::Result<bool> {
    let value = x
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F64)?
        .to_scalar::<f64>()?;
    Ok(value.is_finite())
}
