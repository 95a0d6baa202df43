use crate::bbb::{BayesModuleT, VariationalObjective};
use crate::candle_data_loader::DataLoader;
use crate::candle_inference::TrainConfig;
use crate::diagnostics::{Diagnostics, Phase, TrainHistory, ACCURACY, KL, LIKELIHOOD, LOSS};

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;

/// Trains one task's network.
///
/// Holds nothing across tasks: the optimizer and objective are built
/// per call (`train`) or handed in (`train_with`), so task A and task B
/// runs never share state.
pub struct Bbb<'a, M>
where
    M: BayesModuleT,
{
    pub model: &'a M,
    pub variable_map: &'a candle_nn::VarMap,
}

impl<'a, M> Bbb<'a, M>
where
    M: BayesModuleT,
{
    /// * `model` - Bayesian network whose `mean`/`rho` live in `variable_map`
    /// * `variable_map` - trainable variables only; learned priors are not in it
    pub fn build(model: &'a M, variable_map: &'a candle_nn::VarMap) -> Self {
        Self {
            model,
            variable_map,
        }
    }

    /// Train the model with a fresh `AdamW` (no weight decay; the KL
    /// term is the only regulariser on `mean` and `rho`)
    /// * `train_data` - training loader
    /// * `val_data` - validation loader, evaluated after each epoch (skipped if empty)
    /// * `train_config` - training configuration
    pub fn train<DataL>(
        &mut self,
        train_data: &mut DataL,
        val_data: Option<&mut DataL>,
        train_config: &TrainConfig,
    ) -> anyhow::Result<TrainHistory>
    where
        DataL: DataLoader,
    {
        train_config.validate()?;
        let objective = VariationalObjective::new(train_config.num_samples)?;

        let mut adam = AdamW::new(
            self.variable_map.all_vars(),
            ParamsAdamW {
                lr: train_config.learning_rate.into(),
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;

        self.train_with(&mut adam, &objective, train_data, val_data, train_config)
    }

    /// Train the model with a caller-owned optimizer and objective
    pub fn train_with<DataL, O>(
        &mut self,
        optimizer: &mut O,
        objective: &VariationalObjective,
        train_data: &mut DataL,
        mut val_data: Option<&mut DataL>,
        train_config: &TrainConfig,
    ) -> anyhow::Result<TrainHistory>
    where
        DataL: DataLoader,
        O: Optimizer,
    {
        let pb = ProgressBar::new(train_config.num_epochs as u64);

        if !train_config.show_progress || train_config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        if let Some(val) = val_data.as_mut() {
            if val.num_data() > 0 {
                val.shuffle_minibatch(train_config.batch_size)?;
            }
        }

        let mut history = TrainHistory::default();

        for epoch in 0..train_config.num_epochs {
            train_data.shuffle_minibatch(train_config.batch_size)?;

            let train_diag = train_epoch(
                self.model,
                optimizer,
                &*train_data,
                objective,
                train_config,
                epoch,
            )?;

            let val_diag = match val_data.as_ref() {
                Some(val) if val.num_data() > 0 => Some(evaluate_epoch(
                    self.model,
                    &**val,
                    objective,
                    train_config,
                    epoch,
                )?),
                _ => None,
            };

            pb.inc(1);

            if train_config.verbose {
                match &val_diag {
                    Some(val) => info!(
                        "[{}] train: {} | validation: {}",
                        epoch + 1,
                        train_diag.summary(),
                        val.summary()
                    ),
                    None => info!("[{}] train: {}", epoch + 1, train_diag.summary()),
                }
            }

            history.push(train_diag);
            if let Some(val) = val_diag {
                history.push(val);
            }
        } // each epoch

        pb.finish_and_clear();
        Ok(history)
    }
}

/// One pass over `data` with an optimizer step per minibatch
pub fn train_epoch<M, DataL, O>(
    model: &M,
    optimizer: &mut O,
    data: &DataL,
    objective: &VariationalObjective,
    train_config: &TrainConfig,
    epoch: usize,
) -> anyhow::Result<Diagnostics>
where
    M: BayesModuleT,
    DataL: DataLoader,
    O: Optimizer,
{
    run_epoch(
        model,
        data,
        objective,
        train_config,
        Phase::Train,
        epoch,
        Some(optimizer),
    )
}

/// One pass over `data` computing the same diagnostics, parameters
/// untouched
pub fn evaluate_epoch<M, DataL>(
    model: &M,
    data: &DataL,
    objective: &VariationalObjective,
    train_config: &TrainConfig,
    epoch: usize,
) -> anyhow::Result<Diagnostics>
where
    M: BayesModuleT,
    DataL: DataLoader,
{
    run_epoch::<M, DataL, AdamW>(
        model,
        data,
        objective,
        train_config,
        Phase::Validation,
        epoch,
        None,
    )
}

fn run_epoch<M, DataL, O>(
    model: &M,
    data: &DataL,
    objective: &VariationalObjective,
    train_config: &TrainConfig,
    phase: Phase,
    epoch: usize,
    mut optimizer: Option<&mut O>,
) -> anyhow::Result<Diagnostics>
where
    M: BayesModuleT,
    DataL: DataLoader,
    O: Optimizer,
{
    let num_minibatch = data.num_minibatch();
    if num_minibatch == 0 {
        anyhow::bail!("no minibatches: shuffle the data first");
    }

    let num_samples = objective.num_samples();
    let mut diag = Diagnostics::new(phase, epoch);

    for b in 0..num_minibatch {
        let mb = data.minibatch_data(b, &train_config.device)?;
        let x_nd = repeat_batch(&mb.input, num_samples)?;
        let y_n = repeat_batch(&mb.labels, num_samples)?;

        let (logits_nk, kl) = model.forward_samples_with_kl(&x_nd, num_samples)?;
        let beta = train_config.kl_weighting.beta(b + 1, num_minibatch)?;
        let terms = objective.evaluate(&logits_nk, &y_n, &kl, beta)?;

        if let Some(opt) = optimizer.as_mut() {
            opt.backward_step(&terms.loss)?;
        }

        diag.push(ACCURACY, accuracy(&logits_nk, &y_n)?);
        diag.push(LIKELIHOOD, to_f32(&terms.log_likelihood)?);
        diag.push(KL, to_f32(&terms.kl)?);
        diag.push(LOSS, to_f32(&terms.loss)?);
    }

    Ok(diag)
}

/// Stack `num_samples` copies of a minibatch along the batch axis,
/// replica-major. The model draws its weights once per replica, the
/// objective averages the log-likelihood over the widened batch and
/// divides the network KL by `num_samples`.
pub fn repeat_batch(x: &Tensor, num_samples: usize) -> Result<Tensor> {
    if num_samples <= 1 {
        return Ok(x.clone());
    }
    let copies = vec![x.clone(); num_samples];
    Tensor::cat(&copies, 0)
}

fn to_f32(x: &Tensor) -> Result<f32> {
    x.to_dtype(DType::F32)?.to_scalar::<f32>()
}

/// Share of rows whose arg-max logit is the target class
pub fn accuracy(logits_nk: &Tensor, y_n: &Tensor) -> Result<f32> {
    logits_nk
        .argmax(D::Minus1)?
        .eq(y_n)?
        .to_dtype(DType::F32)?
        .mean_all()?
        .to_scalar::<f32>()
}
