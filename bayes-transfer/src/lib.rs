pub mod bbb;
pub mod bbb_trainer;
pub mod candle_checkpoint;
pub mod candle_data_loader;
pub mod candle_inference;
pub mod cli;
pub mod diagnostics;
pub mod error;
pub mod simulate;

pub use candle_core;
pub use candle_nn;
