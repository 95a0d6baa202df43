use clap::Args;
use log::info;
use std::path::PathBuf;

use super::{fit_task, write_history, CommonArgs};
use crate::candle_checkpoint::save_model;
use crate::diagnostics::{Phase, ACCURACY};

#[derive(Args, Debug)]
pub struct TransferArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[arg(
        long,
        value_delimiter(','),
        default_value = "0,1,2,3,4",
        help = "Class labels of task A"
    )]
    pub labels_a: Vec<u32>,

    #[arg(
        long,
        value_delimiter(','),
        default_value = "5,6,7,8,9",
        help = "Class labels of task B",
        long_help = "Class labels of task B (comma-separated).\n\
		     Must have as many labels as task A so that\n\
		     task A's output layer can serve as the prior."
    )]
    pub labels_b: Vec<u32>,

    #[arg(
        long,
        short,
        required = true,
        help = "Output header",
        long_help = "Output header for results:\n\
		     - {out}.task_a.json\n\
		     - {out}.task_b.json\n\
		     - {out}.task_a.safetensors\n\
		     - {out}.task_b.safetensors"
    )]
    pub out: Box<str>,
}

pub fn run(args: &TransferArgs) -> anyhow::Result<()> {
    let common = &args.common;

    if args.labels_a.len() != args.labels_b.len() {
        anyhow::bail!(
            "task A has {} labels but task B has {}",
            args.labels_a.len(),
            args.labels_b.len()
        );
    }

    let train_config = common.train_config()?;
    let data = common.simulate()?;

    info!("task A: labels {:?}", args.labels_a);
    let task_a = fit_task(&data, &args.labels_a, None, common, &train_config)?;

    info!("task B: labels {:?}, prior from task A", args.labels_b);
    let task_b = fit_task(&data, &args.labels_b, Some(&task_a.net), common, &train_config)?;

    let out = &args.out;
    write_history(&task_a.history, format!("{}.task_a.json", out))?;
    write_history(&task_b.history, format!("{}.task_b.json", out))?;
    save_model(
        &task_a.variable_map,
        PathBuf::from(format!("{}.task_a.safetensors", out)),
    )?;
    save_model(
        &task_b.variable_map,
        PathBuf::from(format!("{}.task_b.safetensors", out)),
    )?;

    for (name, history) in [("A", &task_a.history), ("B", &task_b.history)] {
        let train = history.last_mean(Phase::Train, ACCURACY);
        let val = history.last_mean(Phase::Validation, ACCURACY);
        info!("task {}: accuracy train {:?}, validation {:?}", name, train, val);
    }

    Ok(())
}
