use std::borrow::Borrow;

use stackdot_layers::{Lstm, LstmConfig, PackedModuleT, PackedSequence};
use stackdot_tch_ext::PathExt;
use tch::Tensor;

use crate::error::{ConfigError, StackdotError};

/// Stack of recurrent layers.
///
/// Every layer packs its input using the true sequence lengths, so that
/// padding never influences the hidden states, and unpacks its output
/// again. Output time steps beyond the length of a sequence are zero.
#[derive(Debug)]
pub struct RecurrentLayerStack {
    layers: Vec<Lstm>,
}

impl RecurrentLayerStack {
    /// Construct a stack with one LSTM per configuration.
    ///
    /// Layer *i* is stored under the path `lstm_{i}`.
    pub fn new<'a>(
        vs: impl Borrow<PathExt<'a>>,
        configs: impl IntoIterator<Item = LstmConfig>,
    ) -> Result<Self, StackdotError> {
        let vs = vs.borrow();

        let layers = configs
            .into_iter()
            .enumerate()
            .map(|(layer, config)| Lstm::new(vs / format!("lstm_{}", layer), config))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RecurrentLayerStack { layers })
    }

    /// Apply layer `layer` to a padded batch.
    ///
    /// `input` has shape `[batch_size, time_steps, input_size]`, the result
    /// `[batch_size, max(lengths), output_size]`.
    pub fn forward_layer_t(
        &self,
        layer: usize,
        input: &Tensor,
        lengths: &Tensor,
        sorted: bool,
        train: bool,
    ) -> Result<Tensor, StackdotError> {
        let lstm = self.layers.get(layer).ok_or(ConfigError::LayerCount {
            expected: layer + 1,
            got: self.layers.len(),
        })?;

        let packed = PackedSequence::pack(input, lengths, sorted)?;
        Ok(lstm.forward_packed_t(&packed, train)?.unpack()?)
    }

    /// The input size of each layer.
    pub fn input_sizes(&self) -> Vec<i64> {
        self.layers.iter().map(PackedModuleT::input_size).collect()
    }

    /// The output size of each layer.
    pub fn output_sizes(&self) -> Vec<i64> {
        self.layers.iter().map(PackedModuleT::output_size).collect()
    }

    /// The number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Returns `true` if the stack does not have any layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}
