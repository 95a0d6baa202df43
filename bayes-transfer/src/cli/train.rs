use clap::Args;
use log::info;
use std::path::PathBuf;

use super::{fit_task, write_history, CommonArgs};
use crate::candle_checkpoint::{restore_network, save_model};

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[arg(
        long,
        short,
        required = true,
        value_delimiter(','),
        help = "Class labels of this task",
        long_help = "Class labels of this task (comma-separated).\n\
		     Labels are renumbered 0..k in the given order.\n\
		     Example: 0,1,2,3,4"
    )]
    pub labels: Vec<u32>,

    #[arg(
        long,
        help = "Checkpoint used as the prior",
        long_help = "Safetensors checkpoint of a trained network whose\n\
		     posteriors become this network's priors.\n\
		     Its architecture must match the one requested here."
    )]
    pub prior_model: Option<PathBuf>,

    #[arg(long, help = "Write the trained parameters (safetensors)")]
    pub save_model: Option<PathBuf>,

    #[arg(long, help = "Write per-epoch diagnostics (json)")]
    pub out_json: Option<PathBuf>,
}

pub fn run(args: &TrainArgs) -> anyhow::Result<()> {
    let common = &args.common;
    let train_config = common.train_config()?;
    let data = common.simulate()?;

    let prior = match &args.prior_model {
        Some(path) => {
            let config = common.net_config(data.dim(), args.labels.len());
            let (net, variable_map) = restore_network(&config, path, &train_config.device)?;
            info!("using {} as the prior", path.display());
            Some((net, variable_map))
        }
        None => None,
    };

    let fitted = fit_task(
        &data,
        &args.labels,
        prior.as_ref().map(|(net, _)| net),
        common,
        &train_config,
    )?;

    if let Some(path) = &args.save_model {
        save_model(&fitted.variable_map, path)?;
    }
    if let Some(path) = &args.out_json {
        write_history(&fitted.history, path)?;
    }

    info!("done");
    Ok(())
}
