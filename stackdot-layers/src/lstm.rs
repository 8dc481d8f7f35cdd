//! Long short-term memory layers.

use std::borrow::Borrow;

use serde::{Deserialize, Serialize};
use stackdot_tch_ext::PathExt;
use tch::nn::Init;
use tch::Tensor;

use crate::error::LayerError;
use crate::module::PackedModuleT;
use crate::packed::PackedSequence;

/// Hyper-parameters of an LSTM.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LstmConfig {
    /// The number of input features per time step.
    pub input_size: i64,

    /// The number of hidden units per direction.
    pub hidden_size: i64,

    /// The number of stacked LSTM layers.
    pub num_layers: i64,

    /// Run a second LSTM over the reversed sequence.
    pub bidirectional: bool,
}

impl LstmConfig {
    /// The number of directions in which sequences are processed.
    pub fn num_directions(&self) -> i64 {
        if self.bidirectional {
            2
        } else {
            1
        }
    }

    /// The number of output features per time step.
    ///
    /// In bidirectional LSTMs, the forward and backward hidden states
    /// are concatenated.
    pub fn output_size(&self) -> i64 {
        self.hidden_size * self.num_directions()
    }
}

/// A (multi-layer, optionally bidirectional) LSTM.
///
/// Parameter names and layout follow the cuDNN-compatible convention of
/// Torch: `weight_ih_l{k}`, `weight_hh_l{k}`, `bias_ih_l{k}` and
/// `bias_hh_l{k}` per layer *k*, with a `_reverse` suffix for the
/// backward direction.
#[derive(Debug)]
pub struct Lstm {
    config: LstmConfig,
    flat_weights: Vec<Tensor>,
}

impl Lstm {
    /// Construct an LSTM with freshly-initialized parameters.
    ///
    /// Parameters are drawn from *U(-1/√h, 1/√h)*, where *h* is the hidden
    /// size.
    pub fn new<'a>(vs: impl Borrow<PathExt<'a>>, config: LstmConfig) -> Result<Self, LayerError> {
        LayerError::check_positive("input size", config.input_size)?;
        LayerError::check_positive("hidden size", config.hidden_size)?;
        LayerError::check_positive("number of layers", config.num_layers)?;

        let vs = vs.borrow();

        let bound = 1.0 / (config.hidden_size as f64).sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };

        let gates_size = 4 * config.hidden_size;

        let mut flat_weights =
            Vec::with_capacity((config.num_layers * config.num_directions() * 4) as usize);
        for layer in 0..config.num_layers {
            let layer_input_size = if layer == 0 {
                config.input_size
            } else {
                config.output_size()
            };

            for direction in 0..config.num_directions() {
                let suffix = if direction == 1 { "_reverse" } else { "" };

                flat_weights.push(vs.var(
                    &format!("weight_ih_l{}{}", layer, suffix),
                    &[gates_size, layer_input_size],
                    init,
                )?);
                flat_weights.push(vs.var(
                    &format!("weight_hh_l{}{}", layer, suffix),
                    &[gates_size, config.hidden_size],
                    init,
                )?);
                flat_weights.push(vs.var(
                    &format!("bias_ih_l{}{}", layer, suffix),
                    &[gates_size],
                    init,
                )?);
                flat_weights.push(vs.var(
                    &format!("bias_hh_l{}{}", layer, suffix),
                    &[gates_size],
                    init,
                )?);
            }
        }

        Ok(Lstm {
            config,
            flat_weights,
        })
    }

    /// The hyper-parameters of this LSTM.
    pub fn config(&self) -> &LstmConfig {
        &self.config
    }
}

impl PackedModuleT for Lstm {
    type Error = LayerError;

    fn forward_packed_t(
        &self,
        input: &PackedSequence,
        train: bool,
    ) -> Result<PackedSequence, Self::Error> {
        let data = input.data();

        if data.dim() != 2 || data.size()[1] != self.config.input_size {
            return Err(LayerError::IncorrectShape {
                name: "LSTM input",
                expected: "[sum(lengths), input_size]",
                got: data.size(),
            });
        }

        // Every sequence starts with zero hidden and cell states.
        let h0 = Tensor::f_zeros(
            [
                self.config.num_layers * self.config.num_directions(),
                input.batch_size(),
                self.config.hidden_size,
            ],
            (data.kind(), data.device()),
        )?;
        let c0 = h0.f_zeros_like()?;

        let (output, _, _) = Tensor::f_lstm_data(
            data,
            input.batch_sizes(),
            &[h0, c0],
            self.flat_weights.as_slice(),
            true,
            self.config.num_layers,
            0.0,
            train,
            self.config.bidirectional,
        )?;

        input.with_data(output)
    }

    fn input_size(&self) -> i64 {
        self.config.input_size
    }

    fn output_size(&self) -> i64 {
        self.config.output_size()
    }
}
