use tch::Tensor;

use crate::error::LayerError;
use crate::module::FallibleModule;

/// Temporal max pooling.
///
/// Reduces a batch of sequences of shape `[batch_size, time_steps,
/// features]` to a matrix of shape `[batch_size, features]`. Sequences are
/// zero-padded to the pooling window, after which the maximum is taken
/// over the window. Since the window and stride coincide, this is a global
/// maximum over time per feature that includes the zero padding.
#[derive(Clone, Copy, Debug)]
pub struct TemporalMaxPool {
    window: i64,
}

impl TemporalMaxPool {
    /// Construct a pooling layer with the given window size.
    pub fn new(window: i64) -> Result<Self, LayerError> {
        LayerError::check_positive("pooling window", window)?;
        Ok(TemporalMaxPool { window })
    }

    /// The window over which the maximum is taken.
    pub fn window(&self) -> i64 {
        self.window
    }
}

impl FallibleModule for TemporalMaxPool {
    type Error = LayerError;

    fn forward(&self, input: &Tensor) -> Result<Tensor, Self::Error> {
        let (batch_size, time_steps, features) = input.size3()?;

        if time_steps > self.window {
            return Err(LayerError::ExceedsPoolWindow {
                time_steps,
                window: self.window,
            });
        }

        let padding = Tensor::f_zeros(
            [batch_size, self.window - time_steps, features],
            (input.kind(), input.device()),
        )?;
        let padded = Tensor::f_cat(&[input, &padding], 1)?;

        // Pool over time steps: [batch_size, features, window] -> [batch_size, features, 1]
        let pooled = padded.f_permute([0, 2, 1])?.f_max_pool1d(
            [self.window],
            [self.window],
            [0],
            [1],
            false,
        )?;

        Ok(pooled
            .f_permute([0, 2, 1])?
            .f_contiguous()?
            .f_view([batch_size, features])?)
    }
}
