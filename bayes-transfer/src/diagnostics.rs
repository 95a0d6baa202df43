use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub const ACCURACY: &str = "accuracy";
pub const LIKELIHOOD: &str = "likelihood";
pub const KL: &str = "KL";
pub const LOSS: &str = "loss";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Train,
    Validation,
}

/// Per-minibatch traces of one epoch in one phase
///
/// Metric name -> values in minibatch order. Purely observational; the
/// trainer fills it and reporting code reads it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Diagnostics {
    pub phase: Phase,
    pub epoch: usize,
    pub series: BTreeMap<String, Vec<f32>>,
}

impl Diagnostics {
    pub fn new(phase: Phase, epoch: usize) -> Self {
        Self {
            phase,
            epoch,
            series: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, metric: &str, value: f32) {
        self.series.entry(metric.to_string()).or_default().push(value);
    }

    pub fn get(&self, metric: &str) -> Option<&[f32]> {
        self.series.get(metric).map(|v| v.as_slice())
    }

    /// Epoch average of a metric over its minibatches
    pub fn mean(&self, metric: &str) -> Option<f32> {
        let values = self.get(metric)?;
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f32>() / values.len() as f32)
    }

    pub fn num_minibatch(&self) -> usize {
        self.series.values().map(|v| v.len()).max().unwrap_or(0)
    }

    /// `metric=mean` pairs for logging
    pub fn summary(&self) -> String {
        self.series
            .keys()
            .filter_map(|k| self.mean(k).map(|v| format!("{}={:.4}", k, v)))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// All epoch records of one task's training run
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct TrainHistory {
    pub train: Vec<Diagnostics>,
    pub validation: Vec<Diagnostics>,
}

impl TrainHistory {
    pub fn push(&mut self, diag: Diagnostics) {
        match diag.phase {
            Phase::Train => self.train.push(diag),
            Phase::Validation => self.validation.push(diag),
        }
    }

    /// Epoch averages of `metric` in the given phase
    pub fn trace(&self, phase: Phase, metric: &str) -> Vec<f32> {
        let records = match phase {
            Phase::Train => &self.train,
            Phase::Validation => &self.validation,
        };
        records.iter().filter_map(|d| d.mean(metric)).collect()
    }

    pub fn last_mean(&self, phase: Phase, metric: &str) -> Option<f32> {
        self.trace(phase, metric).last().copied()
    }

    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let file = std::fs::File::create(path.as_ref())?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn from_json<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}
