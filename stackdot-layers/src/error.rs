use tch::TchError;
use thiserror::Error;

/// Errors of the recurrent building blocks.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LayerError {
    /// The sequence is longer than the pooling window.
    #[error("sequence length ({time_steps:?}) exceeds the pooling window ({window:?})")]
    ExceedsPoolWindow {
        /// The number of time steps of the input.
        time_steps: i64,

        /// The pooling window.
        window: i64,
    },

    /// A tensor does not have the shape required by a layer.
    #[error("{name} should have shape {expected}, has shape {got:?}")]
    IncorrectShape {
        /// The name of the tensor.
        name: &'static str,

        /// Description of the expected shape.
        expected: &'static str,

        /// The actual shape.
        got: Vec<i64>,
    },

    /// A size hyper-parameter is not positive.
    #[error("{name} should be larger than 0, was {size:?}")]
    NonPositiveSize {
        /// The name of the hyper-parameter.
        name: &'static str,

        /// The size.
        size: i64,
    },

    /// Torch error.
    #[error(transparent)]
    Tch(#[from] TchError),
}

impl LayerError {
    pub(crate) fn check_positive(name: &'static str, size: i64) -> Result<(), LayerError> {
        if size > 0 {
            Ok(())
        } else {
            Err(LayerError::NonPositiveSize { name, size })
        }
    }
}
