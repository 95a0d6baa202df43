//! Bayes by Backprop (BBB) module.
//!
//! Variational inference over the weights of a feed-forward classifier
//! with mean-field Gaussian posteriors and reparameterization gradients.
//!
//! # Key characteristics
//!
//! - Posterior per weight: `q(w) = N(μ, softplus(ρ)²)`
//! - Sample: `w = μ + softplus(ρ) * ε`, `ε ~ N(0, I)`
//! - Closed-form KL against either a fixed `N(0, σ²)` prior or a
//!   pointwise prior copied from another trained network
//! - Objective per minibatch: `β_i * KL / S - E[log p(y|x, w)]` with the
//!   Blundell schedule `β_i = 2^(m-i) / (2^m - 1)`
//!
//! # Example
//!
//! ```ignore
//! use bayes_transfer::bbb::{BayesNet, BayesNetConfig};
//!
//! // task A
//! let net_a = BayesNet::new(vb_a, config.clone())?;
//! // ... train net_a ...
//!
//! // task B starts from task A's posterior as its prior
//! let mut net_b = BayesNet::new(vb_b, config)?;
//! net_b.load_prior(&net_a)?;
//! let (logits, kl) = net_b.forward(&x)?;
//! ```

mod bayes_linear;
mod bayes_net;
mod objective;
mod prior;
mod traits;
mod weight_distribution;

pub use bayes_linear::{bayes_linear, BayesLinear, ParamGroup};
pub use bayes_net::{BayesNet, BayesNetConfig};
pub use objective::{
    blundell_beta, mean_log_likelihood, KlWeighting, ObjectiveTerms, VariationalObjective,
};
pub use prior::{fixed_gaussian_kl, gaussian_kl, PriorKind, SIGMA_FLOOR};
pub use traits::BayesModuleT;
pub use weight_distribution::{softplus, NoiseSource, WeightDistribution};
