use anyhow::anyhow;
use candle_core::{Device, Tensor};
use log::{info, warn};
use rand::prelude::SliceRandom;
use rand::rngs::StdRng;
use rand::SeedableRng;

pub struct MinibatchData {
    pub input: Tensor,
    /// class index per row, u32
    pub labels: Tensor,
}

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData>;

    /// number of minibatches `m` in one pass
    fn num_minibatch(&self) -> usize;

    /// number of rows in the whole data set
    fn num_data(&self) -> usize;

    fn batch_size(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

///
/// A simple data loader for an in-memory labelled 2d matrix. Each row
/// is a feature vector with one class label.
///
pub struct InMemoryData {
    input_data: Vec<Tensor>,
    label_data: Vec<u32>,

    shuffled_input_data: Option<Vec<Tensor>>,
    shuffled_label_data: Option<Vec<Vec<u32>>>,

    minibatches: Minibatches,
}

impl InMemoryData {
    ///
    /// Create a data loader with `x_nd` (rows are samples) and one
    /// label per row
    ///
    pub fn new(x_nd: &Tensor, labels: &[u32]) -> anyhow::Result<Self> {
        Self::from_rows(x_nd.rows_to_tensor_vec(), labels.to_vec())
    }

    /// Create a data loader from `(1, d)` row tensors
    pub fn from_rows(rows: Vec<Tensor>, labels: Vec<u32>) -> anyhow::Result<Self> {
        if rows.len() != labels.len() {
            return Err(anyhow!(
                "{} rows vs. {} labels",
                rows.len(),
                labels.len()
            ));
        }
        let samples = (0..rows.len()).collect();

        Ok(InMemoryData {
            input_data: rows,
            label_data: labels,
            shuffled_input_data: None,
            shuffled_label_data: None,
            minibatches: Minibatches::new(samples, 0),
        })
    }

    /// Fix the shuffling seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.minibatches.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn labels(&self) -> &[u32] {
        &self.label_data
    }
}

impl DataLoader for InMemoryData {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        match (&self.shuffled_input_data, &self.shuffled_label_data) {
            (Some(inputs), Some(labels)) => {
                let input = inputs.get(batch_idx).ok_or_else(|| {
                    anyhow!(
                        "invalid index = {} vs. total # = {}",
                        batch_idx,
                        inputs.len()
                    )
                })?;
                let labels = &labels[batch_idx];
                Ok(MinibatchData {
                    input: input.to_device(target_device)?,
                    labels: Tensor::from_slice(labels.as_slice(), labels.len(), target_device)?,
                })
            }
            _ => Err(anyhow!("need to shuffle data")),
        }
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn num_data(&self) -> usize {
        self.minibatches.size()
    }

    fn batch_size(&self) -> usize {
        self.minibatches.batch_size
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        if batch_size == 0 {
            return Err(anyhow!("batch size must be > 0"));
        }

        self.minibatches.shuffle_minibatch(batch_size);

        ///////////////////////////////////
        // preload all the shuffled data //
        ///////////////////////////////////

        let mut shuffled_input = Vec::with_capacity(self.num_minibatch());
        let mut shuffled_labels = Vec::with_capacity(self.num_minibatch());

        for samples in self.minibatches.chunks.iter() {
            let chunk: Vec<Tensor> = samples
                .iter()
                .map(|&i| self.input_data[i].clone())
                .collect();
            shuffled_input.push(Tensor::cat(&chunk, 0)?);
            shuffled_labels.push(samples.iter().map(|&i| self.label_data[i]).collect());
        }

        self.shuffled_input_data = Some(shuffled_input);
        self.shuffled_label_data = Some(shuffled_labels);
        Ok(())
    }
}

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` partition indexes
/// into `ceil(n / batch_size)` groups (the last may be short).
///
pub struct Minibatches {
    samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
    batch_size: usize,
    rng: StdRng,
}

impl Minibatches {
    pub fn new(samples: Vec<usize>, seed: u64) -> Self {
        Self {
            samples,
            chunks: vec![],
            batch_size: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn shuffle_minibatch(&mut self, batch_size: usize) {
        self.samples.shuffle(&mut self.rng);
        self.batch_size = batch_size;
        self.chunks = self
            .samples
            .chunks(batch_size)
            .map(|c| c.to_vec())
            .collect();
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}

///
/// A labelled data set held in memory, from which task partitions are
/// carved out by label subset
///
pub struct LabelledData {
    rows: Vec<Tensor>,
    labels: Vec<u32>,
    dim: usize,
}

impl LabelledData {
    /// * `x_nd` - features (n x d)
    /// * `labels` - class of each row
    pub fn new(x_nd: &Tensor, labels: Vec<u32>) -> anyhow::Result<Self> {
        let (n, dim) = x_nd.dims2()?;
        if n != labels.len() {
            return Err(anyhow!("{} rows vs. {} labels", n, labels.len()));
        }
        Ok(Self {
            rows: x_nd.rows_to_tensor_vec(),
            labels,
            dim,
        })
    }

    pub fn num_data(&self) -> usize {
        self.labels.len()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    /// Take the rows whose label is in `label_subset` and split them
    /// into training and validation loaders.
    ///
    /// * `label_subset` - original labels of this task; the `j`-th label
    ///   becomes class `j`, so tasks of equal size share an output layer
    /// * `fraction` - share of the selected rows used for training, in
    ///   (0, 1]; the remainder is validation
    /// * `seed` - seed of the row permutation and of both loaders
    ///
    /// # Returns `(train, validation)`
    pub fn partition(
        &self,
        label_subset: &[u32],
        fraction: f64,
        seed: u64,
    ) -> anyhow::Result<(InMemoryData, InMemoryData)> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(anyhow!("fraction must be in (0, 1], got {}", fraction));
        }
        if label_subset.is_empty() {
            return Err(anyhow!("empty label subset"));
        }
        for (j, y) in label_subset.iter().enumerate() {
            if label_subset[..j].contains(y) {
                return Err(anyhow!("duplicate label {} in the subset", y));
            }
        }

        let mut selected: Vec<(usize, u32)> = self
            .labels
            .iter()
            .enumerate()
            .filter_map(|(i, y)| {
                label_subset
                    .iter()
                    .position(|s| s == y)
                    .map(|j| (i, j as u32))
            })
            .collect();

        if selected.is_empty() {
            return Err(anyhow!("no rows with labels {:?}", label_subset));
        }
        for (j, y) in label_subset.iter().enumerate() {
            if !selected.iter().any(|&(_, k)| k as usize == j) {
                warn!("label {} has no rows", y);
            }
        }

        let mut rng = StdRng::seed_from_u64(seed);
        selected.shuffle(&mut rng);

        let ntrain = ((selected.len() as f64 * fraction).round() as usize).clamp(1, selected.len());
        let (train, val) = selected.split_at(ntrain);

        let take = |part: &[(usize, u32)]| -> anyhow::Result<InMemoryData> {
            let rows = part.iter().map(|&(i, _)| self.rows[i].clone()).collect();
            let labels = part.iter().map(|&(_, j)| j).collect();
            Ok(InMemoryData::from_rows(rows, labels)?.with_seed(seed))
        };

        info!(
            "labels {:?}: {} training and {} validation rows",
            label_subset,
            train.len(),
            val.len()
        );

        Ok((take(train)?, take(val)?))
    }
}

///
/// Convert rows of a matrix to a vector of `Tensor`
///
pub trait RowsToTensorVec {
    fn rows_to_tensor_vec(&self) -> Vec<Tensor>;
}

impl RowsToTensorVec for Tensor {
    fn rows_to_tensor_vec(&self) -> Vec<Tensor> {
        let nrows = self.dims().first().copied().unwrap_or(0);
        (0..nrows)
            .filter_map(|i| self.narrow(0, i, 1).ok())
            .collect()
    }
}
