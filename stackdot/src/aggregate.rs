//! Residual aggregation of recurrent layer outputs.
//!
//! The layers of the encoder are connected as follows, where *E* are the
//! (repacked) embeddings and *hᵢ* the output of layer *i*:
//!
//! * The first layer receives *E*. Its output starts the running sum and
//!   the second layer receives *[h₀; E]*.
//! * A middle layer adds its output to the running sum. The next layer
//!   receives *[running sum; E]*.
//! * The output of the last layer is the representation of the stack.
//!
//! A single-layer stack only has a last layer.

use tch::{TchError, Tensor};

use crate::error::ConfigError;

/// The role of a layer, determined by its position in the stack.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LayerPolicy {
    First,
    Middle,
    Last,
}

impl LayerPolicy {
    /// Get the policy of layer `layer` in a stack of `n_layers`.
    pub fn for_position(layer: usize, n_layers: usize) -> Self {
        if layer + 1 >= n_layers {
            LayerPolicy::Last
        } else if layer == 0 {
            LayerPolicy::First
        } else {
            LayerPolicy::Middle
        }
    }

    /// Combine the output of a layer with the aggregation state.
    ///
    /// `layer_output` and `embeddings` must have the same batch and time
    /// dimensions.
    pub fn combine(
        self,
        state: AggregationState,
        layer_output: &Tensor,
        embeddings: &Tensor,
    ) -> Result<AggregationState, TchError> {
        match self {
            LayerPolicy::First => Ok(AggregationState {
                input: Tensor::f_cat(&[layer_output, embeddings], -1)?,
                running_sum: Some(layer_output.shallow_clone()),
            }),
            LayerPolicy::Middle => {
                let running_sum = match state.running_sum {
                    Some(running_sum) => running_sum.f_add(layer_output)?,
                    None => layer_output.shallow_clone(),
                };

                Ok(AggregationState {
                    input: Tensor::f_cat(&[&running_sum, embeddings], -1)?,
                    running_sum: Some(running_sum),
                })
            }
            LayerPolicy::Last => Ok(AggregationState {
                input: layer_output.shallow_clone(),
                running_sum: state.running_sum,
            }),
        }
    }
}

/// State that is threaded through the layers of the stack.
#[derive(Debug)]
pub struct AggregationState {
    /// Input of the next layer. After the last layer, this is the
    /// representation of the stack.
    pub input: Tensor,

    /// Sum of the outputs of the layers before the last layer.
    pub running_sum: Option<Tensor>,
}

/// Result of running the residual stack.
#[derive(Debug)]
pub struct Aggregation {
    /// The output of each layer, shape `[batch_size, time_steps, layer_output_size]`.
    pub layer_outputs: Vec<Tensor>,

    /// Sum of the outputs of all layers except the last. `None` for
    /// single-layer stacks.
    pub running_sum: Option<Tensor>,

    /// The output of the last layer.
    pub output: Tensor,
}

/// Residual connections between the layers of a recurrent stack.
#[derive(Clone, Debug)]
pub struct ResidualAggregator {
    policies: Vec<LayerPolicy>,
    input_sizes: Vec<i64>,
}

impl ResidualAggregator {
    /// Construct an aggregator for layers with the given output sizes.
    ///
    /// Since the outputs of all layers except the last are summed, these
    /// layers must have the same output size.
    pub fn new(embedding_dim: i64, output_sizes: &[i64]) -> Result<Self, ConfigError> {
        let first_output_size = *output_sizes.first().ok_or(ConfigError::NoLayers)?;

        let n_layers = output_sizes.len();
        for (layer, &output_size) in output_sizes
            .iter()
            .enumerate()
            .take(n_layers - 1)
            .skip(1)
        {
            if output_size != first_output_size {
                return Err(ConfigError::MiddleLayerOutputSize {
                    layer,
                    expected: first_output_size,
                    got: output_size,
                });
            }
        }

        let policies = (0..n_layers)
            .map(|layer| LayerPolicy::for_position(layer, n_layers))
            .collect();

        let input_sizes = (0..n_layers)
            .map(|layer| {
                if layer == 0 {
                    embedding_dim
                } else {
                    embedding_dim + first_output_size
                }
            })
            .collect();

        Ok(ResidualAggregator {
            policies,
            input_sizes,
        })
    }

    /// The input size that each layer must accept.
    pub fn input_sizes(&self) -> &[i64] {
        &self.input_sizes
    }

    /// The number of layers.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Returns `true` if there are no layers.
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// The policy of each layer.
    pub fn policies(&self) -> &[LayerPolicy] {
        &self.policies
    }

    /// Verify that layers accept the inputs that the aggregator provides.
    pub fn check_input_sizes(&self, layer_input_sizes: &[i64]) -> Result<(), ConfigError> {
        if layer_input_sizes.len() != self.input_sizes.len() {
            return Err(ConfigError::LayerCount {
                expected: self.input_sizes.len(),
                got: layer_input_sizes.len(),
            });
        }

        for (layer, (&expected, &got)) in self
            .input_sizes
            .iter()
            .zip(layer_input_sizes)
            .enumerate()
        {
            if expected != got {
                return Err(ConfigError::LayerInputSize {
                    layer,
                    expected,
                    got,
                });
            }
        }

        Ok(())
    }

    /// Run the stack over `embeddings`.
    ///
    /// `forward` applies layer `i` to its input.
    pub fn aggregate<F, E>(&self, embeddings: &Tensor, mut forward: F) -> Result<Aggregation, E>
    where
        F: FnMut(usize, &Tensor) -> Result<Tensor, E>,
        E: From<TchError>,
    {
        let initial = AggregationState {
            input: embeddings.shallow_clone(),
            running_sum: None,
        };

        let (state, layer_outputs) = self.policies.iter().enumerate().try_fold(
            (initial, Vec::with_capacity(self.policies.len())),
            |(state, mut layer_outputs), (layer, policy)| {
                let layer_output = forward(layer, &state.input)?;
                let state = policy.combine(state, &layer_output, embeddings)?;
                layer_outputs.push(layer_output);
                Ok::<_, E>((state, layer_outputs))
            },
        )?;

        Ok(Aggregation {
            layer_outputs,
            running_sum: state.running_sum,
            output: state.input,
        })
    }
}
