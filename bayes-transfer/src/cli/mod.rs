pub mod train;
pub mod transfer;

use candle_core::Device;
use candle_nn::{VarBuilder, VarMap};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::info;
use std::path::Path;

use crate::bbb::{BayesNet, BayesNetConfig, KlWeighting, NoiseSource};
use crate::bbb_trainer::Bbb;
use crate::candle_data_loader::LabelledData;
use crate::candle_inference::TrainConfig;
use crate::diagnostics::{Phase, TrainHistory, ACCURACY};
use crate::simulate::{simulate_gaussian_clusters, SimArgs};

pub use train::TrainArgs;
pub use transfer::TransferArgs;

#[derive(Parser)]
#[command(name = "bayes-transfer")]
#[command(about = "Bayes by Backprop with the posterior of one task as the prior of the next")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train one network on a label subset, optionally with a learned prior
    Train(TrainArgs),
    /// Train on task A, then on task B with task A's posterior as prior
    Transfer(TransferArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

impl ComputeDevice {
    pub fn to_device(&self, device_no: usize) -> anyhow::Result<Device> {
        Ok(match self {
            ComputeDevice::Metal => Device::new_metal(device_no)?,
            ComputeDevice::Cuda => Device::new_cuda(device_no)?,
            ComputeDevice::Cpu => Device::Cpu,
        })
    }
}

/// Data, network and optimisation options shared by every subcommand
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    #[arg(long, default_value_t = 10, help = "Number of simulated classes")]
    pub sim_classes: usize,

    #[arg(long, default_value_t = 200, help = "Simulated rows per class")]
    pub sim_rows_per_class: usize,

    #[arg(long, default_value_t = 16, help = "Simulated feature dimension")]
    pub sim_dim: usize,

    #[arg(
        long,
        default_value_t = 3.0,
        help = "Spread of the simulated class centres",
        long_help = "Standard deviation of the simulated class centres.\n\
		     Larger values make the classes easier to separate."
    )]
    pub sim_separation: f32,

    #[arg(long, default_value_t = 1.0, help = "Within-class noise")]
    pub sim_noise: f32,

    #[arg(long, default_value_t = 100, help = "Hidden layer width")]
    pub num_hidden: usize,

    #[arg(
        long,
        default_value_t = 2,
        help = "Number of Bayesian layers",
        long_help = "Number of Bayesian layers including the output layer.\n\
		     1 gives a single input-to-classes layer."
    )]
    pub num_layers: usize,

    #[arg(
        long,
        short = 's',
        default_value_t = 10,
        help = "Monte Carlo samples per minibatch",
        long_help = "Monte Carlo samples per minibatch.\n\
		     Each minibatch is stacked this many times and every\n\
		     copy sees its own weight draw.\n\
		     Trades gradient variance for compute."
    )]
    pub num_samples: usize,

    #[arg(long, short = 'i', default_value_t = 10, help = "Number of epochs")]
    pub epochs: usize,

    #[arg(long, default_value_t = 1e-3, help = "Learning rate")]
    pub learning_rate: f32,

    #[arg(long, short = 'b', default_value_t = 128, help = "Minibatch size")]
    pub batch_size: usize,

    #[arg(
        long,
        default_value_t = 0.2,
        help = "Validation fraction",
        long_help = "Fraction of each task's rows held out for validation.\n\
		     0 disables validation."
    )]
    pub val_fraction: f64,

    #[arg(
        long,
        value_enum,
        default_value = "blundell",
        help = "KL weighting across minibatches",
        long_help = "KL weighting across the minibatches of one epoch.\n\
		     blundell: beta_i = 2^(m-i) / (2^m - 1)\n\
		     uniform: beta_i = 1 / m"
    )]
    pub kl_weighting: KlWeighting,

    #[arg(long, default_value_t = 0.0, help = "Log variance of the fixed prior")]
    pub prior_log_variance: f64,

    #[arg(long, default_value_t = -5.0, allow_negative_numbers = true, help = "Initial rho")]
    pub rho_init: f64,

    #[arg(long, default_value_t = 42, help = "Random seed")]
    pub seed: u64,

    #[arg(long, value_enum, default_value = "cpu", help = "Candle device")]
    pub device: ComputeDevice,

    #[arg(long, default_value_t = 0, help = "Device number for cuda/metal")]
    pub device_no: usize,

    #[arg(long, short, default_value_t = false, help = "Per-epoch logging")]
    pub verbose: bool,
}

impl CommonArgs {
    pub fn sim_args(&self) -> SimArgs {
        SimArgs {
            num_classes: self.sim_classes,
            num_per_class: self.sim_rows_per_class,
            dim: self.sim_dim,
            separation: self.sim_separation,
            noise: self.sim_noise,
            rseed: self.seed,
        }
    }

    pub fn net_config(&self, input_dim: usize, num_classes: usize) -> BayesNetConfig {
        BayesNetConfig {
            prior_log_variance: self.prior_log_variance,
            rho_init: self.rho_init,
            ..BayesNetConfig::new(input_dim, self.num_hidden, self.num_layers, num_classes)
        }
    }

    pub fn train_config(&self) -> anyhow::Result<TrainConfig> {
        let config = TrainConfig {
            learning_rate: self.learning_rate,
            batch_size: self.batch_size,
            num_epochs: self.epochs,
            num_samples: self.num_samples,
            kl_weighting: self.kl_weighting,
            device: self.device.to_device(self.device_no)?,
            verbose: self.verbose,
            show_progress: true,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn simulate(&self) -> anyhow::Result<LabelledData> {
        if !(0.0..1.0).contains(&self.val_fraction) {
            anyhow::bail!("val-fraction must be in [0, 1), got {}", self.val_fraction);
        }
        simulate_gaussian_clusters(&self.sim_args())
    }
}

/// A trained network with the parameters that back it
pub struct FittedTask {
    pub net: BayesNet,
    pub variable_map: VarMap,
    pub history: TrainHistory,
}

/// Train a fresh network on rows whose labels are in `labels`.
/// With `prior`, the fresh network's priors are that network's posteriors.
pub fn fit_task(
    data: &LabelledData,
    labels: &[u32],
    prior: Option<&BayesNet>,
    args: &CommonArgs,
    train_config: &TrainConfig,
) -> anyhow::Result<FittedTask> {
    let (mut train_data, mut val_data) =
        data.partition(labels, 1.0 - args.val_fraction, args.seed)?;

    let dev = &train_config.device;
    let variable_map = VarMap::new();
    let vb = VarBuilder::from_varmap(&variable_map, candle_core::DType::F32, dev);
    let mut net = BayesNet::new(vb, args.net_config(data.dim(), labels.len()))?;

    if dev.is_cpu() {
        net = net.with_noise(NoiseSource::seeded(args.seed));
    }

    if let Some(source) = prior {
        net.load_prior(source)?;
    }

    let history = Bbb::build(&net, &variable_map).train(
        &mut train_data,
        Some(&mut val_data),
        train_config,
    )?;

    if let Some(acc) = history.last_mean(Phase::Train, ACCURACY) {
        info!("labels {:?}: final training accuracy {:.4}", labels, acc);
    }
    if let Some(acc) = history.last_mean(Phase::Validation, ACCURACY) {
        info!("labels {:?}: final validation accuracy {:.4}", labels, acc);
    }

    Ok(FittedTask {
        net,
        variable_map,
        history,
    })
}

pub(crate) fn write_history<P: AsRef<Path>>(history: &TrainHistory, path: P) -> anyhow::Result<()> {
    history.to_json(path.as_ref())?;
    info!("wrote diagnostics to {}", path.as_ref().display());
    Ok(())
}
