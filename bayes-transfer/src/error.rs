use candle_core::Shape;

/// Errors raised by the Bayes-by-Backprop core.
///
/// Configuration errors (`ShapeMismatch`, `StructureMismatch`,
/// `InvalidArgument`) surface before training starts; numeric errors
/// surface during training. Anything else comes from candle unchanged.
#[derive(Debug, thiserror::Error)]
pub enum BbbError {
    #[error("prior shape mismatch for {param}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        param: String,
        expected: Shape,
        found: Shape,
    },

    #[error("network structure mismatch: {0}")]
    StructureMismatch(String),

    #[error("non-finite KL divergence in layer {layer} ({param})")]
    NumericInstability { layer: usize, param: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, BbbError>;
