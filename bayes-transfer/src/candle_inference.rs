use crate::bbb::KlWeighting;
use crate::error::{BbbError, Result};

/// Everything one task's training run needs besides the model and data
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub learning_rate: f32,
    pub batch_size: usize,
    pub num_epochs: usize,
    /// Monte Carlo weight draws per minibatch (the batch is stacked
    /// this many times)
    pub num_samples: usize,
    pub kl_weighting: KlWeighting,
    pub device: candle_core::Device,
    pub verbose: bool,
    pub show_progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            batch_size: 128,
            num_epochs: 10,
            num_samples: 10,
            kl_weighting: KlWeighting::default(),
            device: candle_core::Device::Cpu,
            verbose: false,
            show_progress: false,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(BbbError::InvalidArgument(format!(
                "learning_rate must be > 0, got {}",
                self.learning_rate
            )));
        }
        if self.batch_size == 0 {
            return Err(BbbError::InvalidArgument("batch_size must be > 0".into()));
        }
        if self.num_epochs == 0 {
            return Err(BbbError::InvalidArgument("num_epochs must be > 0".into()));
        }
        if self.num_samples == 0 {
            return Err(BbbError::InvalidArgument("num_samples must be > 0".into()));
        }
        Ok(())
    }
}
