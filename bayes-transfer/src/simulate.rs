use candle_core::{Device, Tensor};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::candle_data_loader::LabelledData;

pub struct SimArgs {
    pub num_classes: usize,
    pub num_per_class: usize,
    pub dim: usize,
    /// standard deviation of the class centres around the origin
    pub separation: f32,
    /// within-class standard deviation
    pub noise: f32,
    pub rseed: u64,
}

impl Default for SimArgs {
    fn default() -> Self {
        Self {
            num_classes: 10,
            num_per_class: 200,
            dim: 16,
            separation: 3.0,
            noise: 1.0,
            rseed: 42,
        }
    }
}

/// Generate a labelled Gaussian mixture with one cluster per class
///
/// ```text
/// c(k,j) ~ N(0, separation²)
/// x(i,j) ~ N(c(y(i),j), noise²)
/// ```
///
/// Rows come out grouped by class; `LabelledData::partition` shuffles.
pub fn simulate_gaussian_clusters(args: &SimArgs) -> anyhow::Result<LabelledData> {
    let kk = args.num_classes;
    let dd = args.dim;
    let nn = kk * args.num_per_class;

    if kk == 0 || dd == 0 || args.num_per_class == 0 {
        anyhow::bail!(
            "empty simulation: {} classes x {} rows x {} features",
            kk,
            args.num_per_class,
            dd
        );
    }

    let mut rng = StdRng::seed_from_u64(args.rseed);
    let centre = Normal::new(0f32, args.separation)?;
    let within = Normal::new(0f32, args.noise)?;

    let centres: Vec<f32> = (0..kk * dd).map(|_| centre.sample(&mut rng)).collect();

    let mut x = Vec::with_capacity(nn * dd);
    let mut labels = Vec::with_capacity(nn);
    for k in 0..kk {
        for _ in 0..args.num_per_class {
            x.extend((0..dd).map(|j| centres[k * dd + j] + within.sample(&mut rng)));
            labels.push(k as u32);
        }
    }

    info!("simulated {} rows, {} features, {} classes", nn, dd, kk);

    let x_nd = Tensor::from_vec(x, (nn, dd), &Device::Cpu)?;
    LabelledData::new(&x_nd, labels)
}
