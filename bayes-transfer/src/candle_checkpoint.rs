use std::path::Path;

use candle_core::Device;
use candle_nn::{VarBuilder, VarMap};
use log::info;

use crate::bbb::{BayesNet, BayesNetConfig};

/// Write every variational parameter (`layer.{i}.{weight,bias}.{mean,rho}`)
/// to a safetensors file. Learned priors are not variables and are not
/// saved.
pub fn save_model<P: AsRef<Path>>(variable_map: &VarMap, path: P) -> anyhow::Result<()> {
    let path = path.as_ref();
    variable_map.save(path)?;
    info!(
        "saved {} parameter tensors to {}",
        variable_map.all_vars().len(),
        path.display()
    );
    Ok(())
}

/// Overwrite the variables of an already built model with the values
/// stored in `path`. Names and shapes must match.
pub fn load_model<P: AsRef<Path>>(variable_map: &mut VarMap, path: P) -> anyhow::Result<()> {
    let path = path.as_ref();
    variable_map.load(path).map_err(|e| {
        anyhow::anyhow!("failed to load checkpoint {}: {}", path.display(), e)
    })?;
    info!("loaded checkpoint {}", path.display());
    Ok(())
}

/// Rebuild a trained network from a checkpoint.
///
/// Returns the network together with the `VarMap` holding its
/// parameters; the caller keeps the map alive as long as the network.
pub fn restore_network<P: AsRef<Path>>(
    config: &BayesNetConfig,
    path: P,
    dev: &Device,
) -> anyhow::Result<(BayesNet, VarMap)> {
    let mut variable_map = VarMap::new();
    let vb = VarBuilder::from_varmap(&variable_map, candle_core::DType::F32, dev);
    let net = BayesNet::new(vb, config.clone())?;
    load_model(&mut variable_map, path)?;
    Ok((net, variable_map))
}
