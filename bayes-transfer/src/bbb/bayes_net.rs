use candle_core::Tensor;
use candle_nn::{Activation, Module, VarBuilder};
use log::info;

use super::bayes_linear::{bayes_linear, is_finite_scalar, BayesLinear, ParamGroup};
use super::traits::BayesModuleT;
use super::weight_distribution::NoiseSource;
use crate::error::{BbbError, Result};

/// Network-level hyperparameters
#[derive(Debug, Clone, PartialEq)]
pub struct BayesNetConfig {
    pub input_dim: usize,
    pub num_hidden: usize,
    /// number of Bayesian layers, including the output layer
    pub num_layers: usize,
    pub num_classes: usize,
    /// log variance of the fixed N(0, σ²) prior before any transfer
    pub prior_log_variance: f64,
    /// initial ρ of every posterior; -5 gives σ ≈ 0.0067
    pub rho_init: f64,
}

impl BayesNetConfig {
    pub fn new(input_dim: usize, num_hidden: usize, num_layers: usize, num_classes: usize) -> Self {
        Self {
            input_dim,
            num_hidden,
            num_layers,
            num_classes,
            prior_log_variance: 0.0,
            rho_init: -5.0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 || self.num_classes == 0 {
            return Err(BbbError::InvalidArgument(format!(
                "input_dim ({}) and num_classes ({}) must be positive",
                self.input_dim, self.num_classes
            )));
        }
        if self.num_hidden == 0 {
            return Err(BbbError::InvalidArgument("num_hidden must be > 0".into()));
        }
        if self.num_layers == 0 {
            return Err(BbbError::InvalidArgument("num_layers must be >= 1".into()));
        }
        if !self.prior_log_variance.is_finite() || !self.rho_init.is_finite() {
            return Err(BbbError::InvalidArgument(
                "prior_log_variance and rho_init must be finite".into(),
            ));
        }
        Ok(())
    }

    /// `(in, out)` of each layer, input to output
    pub fn layer_dims(&self) -> Vec<(usize, usize)> {
        let l = self.num_layers;
        (0..l)
            .map(|i| {
                let d_in = if i == 0 { self.input_dim } else { self.num_hidden };
                let d_out = if i + 1 == l { self.num_classes } else { self.num_hidden };
                (d_in, d_out)
            })
            .collect()
    }
}

/// A classifier built from an ordered stack of `BayesLinear` layers
/// with ReLU in between; the last layer emits logits.
pub struct BayesNet {
    config: BayesNetConfig,
    layers: Vec<BayesLinear>,
    activation: Activation,
    noise: NoiseSource,
}

impl BayesNet {
    /// Build the network; variables are registered as
    /// `layer.{i}.{weight,bias}.{mean,rho}` under `vb`.
    pub fn new(vb: VarBuilder, config: BayesNetConfig) -> Result<Self> {
        config.validate()?;
        let layers = config
            .layer_dims()
            .into_iter()
            .enumerate()
            .map(|(i, (d_in, d_out))| {
                bayes_linear(
                    i,
                    d_in,
                    d_out,
                    config.prior_log_variance,
                    config.rho_init,
                    vb.pp(format!("layer.{}", i)),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            layers,
            activation: Activation::Relu,
            noise: NoiseSource::default(),
        })
    }

    /// Replace the source of ε, e.g. `NoiseSource::seeded(42)`
    pub fn with_noise(mut self, noise: NoiseSource) -> Self {
        self.noise = noise;
        self
    }

    /// One stochastic pass with a fresh weight draw in every layer
    ///
    /// # Returns `(logits, total_kl)`
    /// * `logits` - (n, num_classes)
    /// * `total_kl` - scalar, sum of the layers' KL
    pub fn forward(&self, x_nd: &Tensor) -> Result<(Tensor, Tensor)> {
        let logits = self.propagate(x_nd)?;
        Ok((logits, self.kl_divergence()?))
    }

    /// Stochastic pass over a batch stacked `num_samples` times along
    /// rows, replica-major as `repeat_batch` lays it out. Each replica
    /// gets its own weight draw in every layer.
    ///
    /// # Returns `(logits, total_kl)`
    /// * `logits` - (S * n, num_classes), rows in the input's order
    /// * `total_kl` - scalar, sum of the layers' KL (evaluated once)
    pub fn forward_samples(&self, x_nd: &Tensor, num_samples: usize) -> Result<(Tensor, Tensor)> {
        let (rows, dim) = x_nd.dims2()?;
        if num_samples == 0 || rows % num_samples != 0 {
            return Err(BbbError::InvalidArgument(format!(
                "{} rows do not split into {} replicas",
                rows, num_samples
            )));
        }
        if num_samples == 1 {
            return self.forward(x_nd);
        }

        let x_snd = x_nd.reshape((num_samples, rows / num_samples, dim))?;
        let logits_snk = self.propagate(&x_snd)?;
        let logits = logits_snk.reshape((rows, self.config.num_classes))?;
        Ok((logits, self.kl_divergence()?))
    }

    fn propagate(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = x.clone();
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h, &self.noise)?;
            if i < last {
                h = self.activation.forward(&h)?;
            }
        }
        Ok(h)
    }

    /// Deterministic pass through the posterior means
    pub fn forward_mean(&self, x_nd: &Tensor) -> Result<Tensor> {
        let mut h = x_nd.clone();
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward_mean(&h)?;
            if i < last {
                h = self.activation.forward(&h)?;
            }
        }
        Ok(h)
    }

    /// Sum of the layers' KL without a forward pass.
    ///
    /// The sum is read back once; a non-finite total fails with
    /// `NumericInstability` naming the first offending layer.
    pub fn kl_divergence(&self) -> Result<Tensor> {
        let mut kls = self.layers.iter().map(|l| l.kl_divergence());
        let first = kls
            .next()
            .ok_or_else(|| BbbError::StructureMismatch("no layers".into()))??;
        let total = kls.try_fold(first, |acc, kl| -> Result<Tensor> { Ok((acc + kl?)?) })?;

        if !is_finite_scalar(&total)? {
            for layer in &self.layers {
                layer.check_finite()?;
            }
            // every layer is finite on its own; the sum overflowed
            return Err(BbbError::NumericInstability {
                layer: self.layers.len() - 1,
                param: "total".into(),
            });
        }
        Ok(total)
    }

    /// Take `source`'s current posterior as this network's prior.
    ///
    /// Layers are matched in order; every layer's weight and bias
    /// posterior `(mean, σ)` is copied (detached) into a learned prior.
    /// The topology is checked in full before anything is installed,
    /// so a failed transfer leaves the existing priors intact.
    pub fn load_prior(&mut self, source: &BayesNet) -> Result<()> {
        if self.layers.len() != source.layers.len() {
            return Err(BbbError::StructureMismatch(format!(
                "{} layers vs. {} layers in the source",
                self.layers.len(),
                source.layers.len()
            )));
        }

        let groups = [ParamGroup::Weight, ParamGroup::Bias];

        for (dst, src) in self.layers.iter().zip(source.layers.iter()) {
            for group in groups {
                let (dst_shape, src_shape) =
                    (dst.posterior(group).shape(), src.posterior(group).shape());
                if dst_shape != src_shape {
                    return Err(BbbError::StructureMismatch(format!(
                        "layer {} {}: {:?} vs. {:?} in the source",
                        dst.index(),
                        group.name(),
                        dst_shape,
                        src_shape
                    )));
                }
            }
        }

        for (dst, src) in self.layers.iter_mut().zip(source.layers.iter()) {
            for group in groups {
                let q = src.posterior(group);
                dst.attach_learned(group, q.mean(), &q.sigma()?)?;
            }
        }

        info!(
            "loaded the posterior of {} layers as a learned prior",
            self.layers.len()
        );
        Ok(())
    }

    pub fn layers(&self) -> &[BayesLinear] {
        &self.layers
    }

    pub fn config(&self) -> &BayesNetConfig {
        &self.config
    }
}

impl BayesModuleT for BayesNet {
    fn forward_with_kl(&self, x_nd: &Tensor) -> Result<(Tensor, Tensor)> {
        self.forward(x_nd)
    }

    fn forward_samples_with_kl(
        &self,
        x_nd: &Tensor,
        num_samples: usize,
    ) -> Result<(Tensor, Tensor)> {
        self.forward_samples(x_nd, num_samples)
    }

    fn forward_mean(&self, x_nd: &Tensor) -> Result<Tensor> {
        BayesNet::forward_mean(self, x_nd)
    }

    fn dim_input(&self) -> usize {
        self.config.input_dim
    }

    fn dim_output(&self) -> usize {
        self.config.num_classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bbb::PriorKind;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build(varmap: &VarMap, config: BayesNetConfig) -> Result<BayesNet> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        BayesNet::new(vb, config)
    }

    #[test]
    fn test_layer_dims() {
        let config = BayesNetConfig::new(4, 8, 3, 2);
        assert_eq!(config.layer_dims(), vec![(4, 8), (8, 8), (8, 2)]);

        let config = BayesNetConfig::new(4, 8, 1, 2);
        assert_eq!(config.layer_dims(), vec![(4, 2)]);
    }

    #[test]
    fn test_invalid_config() {
        let varmap = VarMap::new();
        let res = build(&varmap, BayesNetConfig::new(4, 0, 2, 3));
        assert!(matches!(res, Err(BbbError::InvalidArgument(_))));
        let res = build(&varmap, BayesNetConfig::new(4, 8, 0, 3));
        assert!(matches!(res, Err(BbbError::InvalidArgument(_))));
    }

    #[test]
    fn test_forward_kl_matches_kl_divergence() -> Result<()> {
        let varmap = VarMap::new();
        let net = build(&varmap, BayesNetConfig::new(4, 8, 3, 3))?;
        let x = Tensor::randn(0f32, 1f32, (5, 4), &Device::Cpu)?;

        let (logits, kl) = net.forward(&x)?;
        assert_eq!(logits.dims(), &[5, 3]);
        assert_eq!(net.forward_mean(&x)?.dims(), &[5, 3]);

        let kl: f32 = kl.to_scalar()?;
        let kl2: f32 = net.kl_divergence()?.to_scalar()?;
        approx::assert_relative_eq!(kl, kl2, max_relative = 1e-6);
        Ok(())
    }

    #[test]
    fn test_forward_samples_splits_replicas() -> Result<()> {
        let varmap = VarMap::new();
        let config = BayesNetConfig {
            rho_init: 0.0,
            ..BayesNetConfig::new(4, 8, 2, 3)
        };
        let net = build(&varmap, config)?.with_noise(NoiseSource::seeded(3));

        let x = Tensor::randn(0f32, 1f32, (2, 4), &Device::Cpu)?;
        let x = Tensor::cat(&[&x, &x, &x], 0)?;
        let (logits, kl) = net.forward_samples(&x, 3)?;
        assert_eq!(logits.dims(), &[6, 3]);
        assert!(kl.to_scalar::<f32>()?.is_finite());

        let rows: Vec<Vec<f32>> = logits.to_vec2()?;
        assert_ne!(rows[0], rows[2]);
        assert_ne!(rows[0], rows[4]);
        assert_ne!(rows[1], rows[3]);

        assert!(matches!(
            net.forward_samples(&x, 4),
            Err(BbbError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn test_non_finite_kl_names_layer() -> Result<()> {
        let varmap = VarMap::new();
        let net = build(&varmap, BayesNetConfig::new(4, 8, 3, 3))?;
        assert!(net.kl_divergence()?.to_scalar::<f32>()?.is_finite());

        {
            let data = varmap.data().lock().expect("varmap lock");
            let mean = data
                .get("layer.1.weight.mean")
                .expect("layer 1 weight mean");
            mean.set(&Tensor::full(f32::NAN, (8, 8), &Device::Cpu)?)?;
        }

        let x = Tensor::randn(0f32, 1f32, (5, 4), &Device::Cpu)?;
        for res in [net.kl_divergence().map(|_| ()), net.forward(&x).map(|_| ())] {
            match res {
                Err(BbbError::NumericInstability { layer, param }) => {
                    assert_eq!(layer, 1);
                    assert_eq!(param, "weight");
                }
                other => panic!("expected numeric instability, got {:?}", other),
            }
        }
        Ok(())
    }

    #[test]
    fn test_load_prior_installs_source_posterior() -> Result<()> {
        let src_map = VarMap::new();
        let dst_map = VarMap::new();
        let config = BayesNetConfig::new(4, 8, 2, 3);
        let source = build(&src_map, config.clone())?;
        let mut target = build(&dst_map, config)?;

        target.load_prior(&source)?;

        for (dst, src) in target.layers().iter().zip(source.layers()) {
            for group in [ParamGroup::Weight, ParamGroup::Bias] {
                match dst.prior(group) {
                    PriorKind::Learned { mean, sigma } => {
                        let q = src.posterior(group);
                        let dm = (mean - q.mean())?.abs()?.max_all()?.to_scalar::<f32>()?;
                        let ds = (sigma - q.sigma()?)?.abs()?.max_all()?.to_scalar::<f32>()?;
                        assert_eq!(dm, 0.0);
                        assert_eq!(ds, 0.0);
                    }
                    PriorKind::Fixed { .. } => panic!("prior was not transferred"),
                }
            }
        }

        // priors are snapshots outside the destination's variables
        assert_eq!(dst_map.all_vars().len(), 8);
        Ok(())
    }

    #[test]
    fn test_load_prior_structure_mismatch() -> Result<()> {
        let src_map = VarMap::new();
        let dst_map = VarMap::new();
        let source = build(&src_map, BayesNetConfig::new(4, 8, 3, 3))?;
        let mut target = build(&dst_map, BayesNetConfig::new(4, 8, 2, 3))?;
        assert!(matches!(
            target.load_prior(&source),
            Err(BbbError::StructureMismatch(_))
        ));

        let source = build(&VarMap::new(), BayesNetConfig::new(4, 16, 2, 3))?;
        assert!(matches!(
            target.load_prior(&source),
            Err(BbbError::StructureMismatch(_))
        ));
        assert!(target
            .layers()
            .iter()
            .all(|l| !l.prior(ParamGroup::Weight).is_learned()));
        Ok(())
    }
}
