use std::borrow::Borrow;
use std::time::Instant;

use stackdot_layers::{Embedding, FallibleModule, PackedSequence, TemporalMaxPool};
use stackdot_tch_ext::PathExt;
use tch::Tensor;

use crate::aggregate::{Aggregation, ResidualAggregator};
use crate::batch::SequenceBatch;
use crate::config::{EncoderConfig, LayerSpec};
use crate::error::{ConfigError, PreconditionError, StackdotError};
use crate::recurrent::RecurrentLayerStack;

/// Sentence encoder with a residual stack of LSTMs.
///
/// The encoder embeds the tokens of a batch, runs the embeddings through
/// a stack of recurrent layers and max-pools the output of the last layer
/// over time. Every layer after the first receives the embeddings together
/// with the sum of the outputs of the preceding layers (see
/// [`ResidualAggregator`]).
#[derive(Debug)]
pub struct ResidualStackedEncoder {
    aggregator: ResidualAggregator,
    config: EncoderConfig,
    embeddings: Embedding,
    output_size: i64,
    pool: TemporalMaxPool,
    stack: RecurrentLayerStack,
}

impl ResidualStackedEncoder {
    /// Construct an encoder.
    ///
    /// The embeddings are initialized from `pretrained`, which has shape
    /// `[vocab_size, embedding_dim]`. Embeddings are stored under the path
    /// `embeddings`, the recurrent layers under `encoder`.
    pub fn new<'a>(
        vs: impl Borrow<PathExt<'a>>,
        config: &EncoderConfig,
        pretrained: &Tensor,
    ) -> Result<Self, StackdotError> {
        let vs = vs.borrow();

        let (vocab_size, embedding_dim) = match *pretrained.size().as_slice() {
            [vocab_size, embedding_dim] if vocab_size > 0 && embedding_dim > 0 => {
                (vocab_size, embedding_dim)
            }
            _ => return Err(ConfigError::PretrainedShape(pretrained.size()).into()),
        };

        config.validate(vocab_size)?;

        let output_sizes = config
            .layers
            .iter()
            .map(LayerSpec::output_size)
            .collect::<Vec<_>>();
        let aggregator = ResidualAggregator::new(embedding_dim, &output_sizes)?;
        let output_size = *output_sizes.last().ok_or(ConfigError::NoLayers)?;

        let embeddings = Embedding::from_pretrained(
            vs / "embeddings",
            pretrained,
            Some(config.padding_index),
            config.freeze_embeddings,
        )?;

        let stack = RecurrentLayerStack::new(
            vs / "encoder",
            config
                .layers
                .iter()
                .zip(aggregator.input_sizes())
                .map(|(spec, &input_size)| spec.lstm_config(input_size)),
        )?;
        aggregator.check_input_sizes(&stack.input_sizes())?;

        let pool = TemporalMaxPool::new(config.max_sentence_length)?;

        log::debug!(
            "Constructed encoder with {} layers (input sizes: {:?}, output sizes: {:?})",
            stack.len(),
            stack.input_sizes(),
            stack.output_sizes()
        );

        Ok(ResidualStackedEncoder {
            aggregator,
            config: config.clone(),
            embeddings,
            output_size,
            pool,
            stack,
        })
    }

    /// The encoder configuration.
    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// The dimensionality of the token embeddings.
    pub fn embedding_dim(&self) -> i64 {
        self.embeddings.embedding_dim()
    }

    /// The size of the sentence representations.
    pub fn output_size(&self) -> i64 {
        self.output_size
    }

    /// Encode a batch.
    ///
    /// Returns a tensor of shape `[batch_size, output_size]`.
    pub fn encode(&self, batch: &SequenceBatch, train: bool) -> Result<Tensor, StackdotError> {
        let start = Instant::now();

        let aggregation = self.encode_layers(batch, train)?;
        let encoded = self.pool.forward(&aggregation.output)?;

        log::debug!(
            "Encoded {} sequences with length {} in {}ms",
            batch.batch_size(),
            batch.max_length(),
            start.elapsed().as_millis()
        );

        Ok(encoded)
    }

    /// Run the recurrent stack on a batch, without pooling.
    ///
    /// All layer outputs have `max(lengths)` time steps.
    pub fn encode_layers(
        &self,
        batch: &SequenceBatch,
        train: bool,
    ) -> Result<Aggregation, StackdotError> {
        self.check_batch(batch)?;

        let lengths = batch.lengths_tensor();
        let sorted = batch.is_sorted();

        let embeddings = self.embeddings.forward(batch.tokens())?;
        let embeddings = PackedSequence::repack(&embeddings, &lengths, sorted)?;

        self.aggregator.aggregate(&embeddings, |layer, input| {
            self.stack
                .forward_layer_t(layer, input, &lengths, sorted, train)
        })
    }

    fn check_batch(&self, batch: &SequenceBatch) -> Result<(), StackdotError> {
        // Sequence lengths are bounded by the token matrix width.
        let width = batch.tokens().size()[1];
        if width != self.config.max_sentence_length {
            return Err(PreconditionError::TokenWidth {
                expected: self.config.max_sentence_length,
                got: width,
            }
            .into());
        }

        let min = batch.tokens().f_min()?.f_int64_value(&[])?;
        let max = batch.tokens().f_max()?.f_int64_value(&[])?;
        let vocab_size = self.embeddings.vocab_size();
        if min < 0 || max >= vocab_size {
            return Err(PreconditionError::TokenOutOfRange {
                min,
                max,
                vocab_size,
            }
            .into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::convert::TryInto;

    use approx::assert_abs_diff_eq;
    use maplit::btreeset;
    use ndarray::{arr1, ArrayD};
    use stackdot_layers::{FallibleModule, PackedSequence};
    use stackdot_tch_ext::RootExt;
    use tch::nn::VarStore;
    use tch::{Device, Kind, Tensor};
    use test_case::test_case;

    use super::ResidualStackedEncoder;
    use crate::batch::{BatchBuilder, SequenceBatch};
    use crate::config::{EncoderConfig, LayerSpec};
    use crate::error::{ConfigError, PreconditionError, StackdotError};

    const VOCAB_SIZE: i64 = 10;
    const EMBEDDING_DIM: i64 = 3;
    const PADDING_INDEX: i64 = 0;

    fn to_array(tensor: &Tensor) -> ArrayD<f32> {
        (&tensor.detach()).try_into().unwrap()
    }

    fn assert_tensors_close(a: &Tensor, b: &Tensor) {
        assert_eq!(a.size(), b.size());
        assert_abs_diff_eq!(to_array(a), to_array(b), epsilon = 1e-5);
    }

    fn pretrained(device: Device) -> Tensor {
        let pretrained = Tensor::randn([VOCAB_SIZE, EMBEDDING_DIM], (Kind::Float, device));
        let _ = pretrained.narrow(0, PADDING_INDEX, 1).zero_();
        pretrained
    }

    fn config(layers: Vec<LayerSpec>, max_sentence_length: i64) -> EncoderConfig {
        EncoderConfig {
            layers,
            max_sentence_length,
            padding_index: PADDING_INDEX,
            freeze_embeddings: false,
        }
    }

    fn encoder(vs: &VarStore, config: &EncoderConfig) -> ResidualStackedEncoder {
        ResidualStackedEncoder::new(vs.root_ext(|_| 0), config, &pretrained(vs.device()))
            .unwrap()
    }

    fn batch(sequences: &[&[i64]], max_sentence_length: i64, sorted: bool) -> SequenceBatch {
        let mut builder = BatchBuilder::new(
            sequences.len(),
            max_sentence_length as usize,
            PADDING_INDEX,
        );
        for sequence in sequences {
            builder.add(arr1(sequence).view()).unwrap();
        }
        builder.build(sorted).unwrap()
    }

    /// Repacked embeddings of a batch, as fed to the first layer.
    fn embeddings(encoder: &ResidualStackedEncoder, batch: &SequenceBatch) -> Tensor {
        let embeddings = encoder.embeddings.forward(batch.tokens()).unwrap();
        PackedSequence::repack(&embeddings, &batch.lengths_tensor(), batch.is_sorted()).unwrap()
    }

    /// Set the recurrent weights and biases to constants.
    fn set_recurrent_params(vs: &VarStore, weight: f64, bias: f64) {
        tch::no_grad(|| {
            for (name, mut var) in vs.variables() {
                if name.starts_with("encoder.") {
                    let value = if name.contains(".bias_") { bias } else { weight };
                    let _ = var.fill_(value);
                }
            }
        });
    }

    fn varstore_variables(vs: &VarStore) -> BTreeSet<String> {
        vs.variables()
            .into_iter()
            .map(|(name, _)| name)
            .collect::<BTreeSet<_>>()
    }

    #[test_case(Device::Cpu)]
    #[cfg_attr(cuda_test, test_case(Device::Cuda(0)))]
    fn output_shape_is_independent_of_max_sentence_length(device: Device) {
        let layers = vec![
            LayerSpec::new(4, 1, true),
            LayerSpec::new(4, 2, true),
            LayerSpec::new(5, 1, false),
        ];
        let pretrained = pretrained(device);
        let sequences: &[&[i64]] = &[&[1, 2, 3, 4], &[5, 6], &[7]];

        let mut outputs = Vec::new();
        for &max_sentence_length in &[5, 8, 12] {
            tch::manual_seed(42);
            let vs = VarStore::new(device);
            let encoder = ResidualStackedEncoder::new(
                vs.root_ext(|_| 0),
                &config(layers.clone(), max_sentence_length),
                &pretrained,
            )
            .unwrap();
            assert_eq!(encoder.output_size(), 5);
            assert_eq!(encoder.embedding_dim(), EMBEDDING_DIM);

            let output = encoder
                .encode(&batch(sequences, max_sentence_length, true), false)
                .unwrap();
            assert_eq!(output.size(), &[3, 5]);
            outputs.push(output);
        }

        // Pooling only adds zero padding, so the representations are equal.
        assert_tensors_close(&outputs[0], &outputs[1]);
        assert_tensors_close(&outputs[0], &outputs[2]);
    }

    #[test]
    fn single_layer_encoding_is_pooled_layer_output() {
        tch::manual_seed(42);
        let vs = VarStore::new(Device::Cpu);
        let encoder = encoder(&vs, &config(vec![LayerSpec::new(4, 1, true)], 6));
        let batch = batch(&[&[1, 2, 3, 4], &[5, 6]], 6, true);

        let aggregation = encoder.encode_layers(&batch, false).unwrap();
        assert!(aggregation.running_sum.is_none());
        assert_eq!(aggregation.layer_outputs.len(), 1);
        assert_tensors_close(&aggregation.output, &aggregation.layer_outputs[0]);
        assert_eq!(aggregation.output.size(), &[2, 4, 8]);

        // The sequences are shorter than the pooling window, so the zero
        // padding takes part in the maximum.
        let expected = aggregation
            .output
            .amax([1], false)
            .clamp_min(0.);
        assert_tensors_close(&encoder.encode(&batch, false).unwrap(), &expected);
    }

    #[test]
    fn two_layer_encoding_is_pooled_second_layer_output() {
        tch::manual_seed(42);
        let vs = VarStore::new(Device::Cpu);
        let encoder = encoder(
            &vs,
            &config(vec![LayerSpec::new(4, 1, true), LayerSpec::new(3, 1, false)], 5),
        );
        let batch = batch(&[&[1, 2, 3], &[4, 5, 6, 7, 8], &[9]], 5, false);

        let aggregation = encoder.encode_layers(&batch, false).unwrap();
        assert_eq!(aggregation.layer_outputs.len(), 2);
        assert_tensors_close(
            aggregation.running_sum.as_ref().unwrap(),
            &aggregation.layer_outputs[0],
        );
        assert_tensors_close(&aggregation.output, &aggregation.layer_outputs[1]);

        // The second layer receives the first layer output and the embeddings.
        let input = Tensor::cat(
            &[&aggregation.layer_outputs[0], &embeddings(&encoder, &batch)],
            -1,
        );
        let expected = encoder
            .stack
            .forward_layer_t(1, &input, &batch.lengths_tensor(), false, false)
            .unwrap();
        assert_tensors_close(&aggregation.output, &expected);

        let encoded = encoder.encode(&batch, false).unwrap();
        assert_eq!(encoded.size(), &[3, 3]);
        assert_tensors_close(&encoded, &encoder.pool.forward(&expected).unwrap());
    }

    #[test]
    fn middle_layers_receive_running_sum() {
        tch::manual_seed(42);
        let vs = VarStore::new(Device::Cpu);
        let encoder = encoder(
            &vs,
            &config(
                vec![
                    LayerSpec::new(2, 1, true),
                    LayerSpec::new(4, 1, false),
                    LayerSpec::new(2, 2, true),
                    LayerSpec::new(3, 1, false),
                ],
                6,
            ),
        );
        let batch = batch(&[&[3, 1, 4, 1, 5, 9], &[2, 6, 5], &[3, 5]], 6, true);
        let lengths = batch.lengths_tensor();
        let embeddings = embeddings(&encoder, &batch);

        let aggregation = encoder.encode_layers(&batch, false).unwrap();
        let outputs = &aggregation.layer_outputs;
        assert_eq!(outputs.len(), 4);

        let mut running_sum = outputs[0].shallow_clone();
        for layer in 1..4 {
            let input = Tensor::cat(&[&running_sum, &embeddings], -1);
            let expected = encoder
                .stack
                .forward_layer_t(layer, &input, &lengths, true, false)
                .unwrap();
            assert_tensors_close(&outputs[layer], &expected);

            if layer < 3 {
                running_sum = &running_sum + &outputs[layer];
            }
        }

        assert_tensors_close(aggregation.running_sum.as_ref().unwrap(), &running_sum);
        assert_tensors_close(&aggregation.output, &outputs[3]);
    }

    #[test]
    fn padding_tokens_do_not_affect_encoding() {
        tch::manual_seed(42);
        let vs = VarStore::new(Device::Cpu);
        let encoder = encoder(
            &vs,
            &config(vec![LayerSpec::new(4, 1, true), LayerSpec::new(3, 1, true)], 4),
        );

        let padded_with_padding_index = SequenceBatch::new(
            Tensor::from_slice(&[1i64, 2, 3, 0, 4, 5, 0, 0]).reshape([2, 4]),
            vec![3, 2],
            true,
        )
        .unwrap();
        let padded_with_tokens = SequenceBatch::new(
            Tensor::from_slice(&[1i64, 2, 3, 9, 4, 5, 8, 7]).reshape([2, 4]),
            vec![3, 2],
            true,
        )
        .unwrap();

        assert_tensors_close(
            &encoder.encode(&padded_with_padding_index, false).unwrap(),
            &encoder.encode(&padded_with_tokens, false).unwrap(),
        );
    }

    #[test]
    fn single_token_and_full_length_sequences() {
        let vs = VarStore::new(Device::Cpu);
        let encoder = encoder(&vs, &config(vec![LayerSpec::new(2, 1, false)], 4));

        // With zero weights and positive biases, every hidden state is
        // positive and increases over time.
        set_recurrent_params(&vs, 0., 0.5);

        let batch = batch(&[&[1, 2, 3, 4], &[5]], 4, true);
        let layer_output = encoder.encode_layers(&batch, false).unwrap().output;
        let encoded = encoder.encode(&batch, false).unwrap();

        assert!(to_array(&encoded).iter().all(|&v| v > 0.));
        assert_tensors_close(
            &encoded.narrow(0, 0, 1),
            &layer_output.narrow(0, 0, 1).select(1, 3),
        );
        assert_tensors_close(
            &encoded.narrow(0, 1, 1),
            &layer_output.narrow(0, 1, 1).select(1, 0),
        );
    }

    #[test]
    fn unsorted_batch_is_encoded_as_sorted_batch() {
        tch::manual_seed(42);
        let vs = VarStore::new(Device::Cpu);
        let encoder = encoder(
            &vs,
            &config(
                vec![
                    LayerSpec::new(3, 1, true),
                    LayerSpec::new(3, 1, true),
                    LayerSpec::new(2, 1, false),
                ],
                7,
            ),
        );

        let unsorted = batch(&[&[1, 2], &[3, 4, 5, 6, 7], &[8, 9, 1], &[2, 3]], 7, false);
        let (sorted, permutation) = unsorted.sort_by_length().unwrap();

        let unsorted_encoded = encoder.encode(&unsorted, false).unwrap();
        let sorted_encoded = encoder.encode(&sorted, false).unwrap();

        let permutation = permutation.iter().map(|&idx| idx as i64).collect::<Vec<_>>();
        assert_tensors_close(
            &sorted_encoded,
            &unsorted_encoded.index_select(0, &Tensor::from_slice(&permutation)),
        );
    }

    #[test]
    fn token_width_must_be_max_sentence_length() {
        let vs = VarStore::new(Device::Cpu);
        let encoder = encoder(&vs, &config(vec![LayerSpec::new(2, 1, false)], 4));

        let err = encoder
            .encode(&batch(&[&[1, 2]], 3, true), false)
            .unwrap_err();
        assert!(matches!(
            err,
            StackdotError::Precondition(PreconditionError::TokenWidth {
                expected: 4,
                got: 3
            })
        ));
    }

    #[test]
    fn token_ids_must_be_in_vocabulary() {
        let vs = VarStore::new(Device::Cpu);
        let encoder = encoder(&vs, &config(vec![LayerSpec::new(2, 1, false)], 3));

        let err = encoder
            .encode(&batch(&[&[1, VOCAB_SIZE]], 3, true), false)
            .unwrap_err();
        assert!(matches!(
            err,
            StackdotError::Precondition(PreconditionError::TokenOutOfRange {
                min: 0,
                max: VOCAB_SIZE,
                vocab_size: VOCAB_SIZE
            })
        ));

        let err = encoder
            .encode(&batch(&[&[-1, 2]], 3, true), false)
            .unwrap_err();
        assert!(matches!(
            err,
            StackdotError::Precondition(PreconditionError::TokenOutOfRange { min: -1, .. })
        ));
    }

    #[test]
    fn middle_layer_output_size_mismatch_is_rejected() {
        let vs = VarStore::new(Device::Cpu);
        let err = ResidualStackedEncoder::new(
            vs.root_ext(|_| 0),
            &config(
                vec![
                    LayerSpec::new(4, 1, true),
                    LayerSpec::new(3, 1, false),
                    LayerSpec::new(2, 1, false),
                ],
                5,
            ),
            &pretrained(Device::Cpu),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            StackdotError::Config(ConfigError::MiddleLayerOutputSize {
                layer: 1,
                expected: 8,
                got: 3
            })
        ));
    }

    #[test]
    fn invalid_configurations_are_rejected() {
        let vs = VarStore::new(Device::Cpu);
        let root = vs.root_ext(|_| 0);

        let err = ResidualStackedEncoder::new(&root, &config(vec![], 5), &pretrained(Device::Cpu))
            .unwrap_err();
        assert!(matches!(err, StackdotError::Config(ConfigError::NoLayers)));

        let err = ResidualStackedEncoder::new(
            &root,
            &EncoderConfig {
                padding_index: VOCAB_SIZE,
                ..config(vec![LayerSpec::new(2, 1, false)], 5)
            },
            &pretrained(Device::Cpu),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            StackdotError::Config(ConfigError::PaddingIndexOutOfRange { .. })
        ));

        let err = ResidualStackedEncoder::new(
            &root,
            &config(vec![LayerSpec::new(2, 1, false)], 5),
            &Tensor::zeros([VOCAB_SIZE], (Kind::Float, Device::Cpu)),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            StackdotError::Config(ConfigError::PretrainedShape(_))
        ));
    }

    #[test]
    fn encoder_names() {
        let vs = VarStore::new(Device::Cpu);
        encoder(
            &vs,
            &config(vec![LayerSpec::new(4, 1, true), LayerSpec::new(2, 1, false)], 5),
        );

        assert_eq!(
            varstore_variables(&vs),
            btreeset![
                "embeddings.embeddings".to_string(),
                "encoder.lstm_0.bias_hh_l0".to_string(),
                "encoder.lstm_0.bias_hh_l0_reverse".to_string(),
                "encoder.lstm_0.bias_ih_l0".to_string(),
                "encoder.lstm_0.bias_ih_l0_reverse".to_string(),
                "encoder.lstm_0.weight_hh_l0".to_string(),
                "encoder.lstm_0.weight_hh_l0_reverse".to_string(),
                "encoder.lstm_0.weight_ih_l0".to_string(),
                "encoder.lstm_0.weight_ih_l0_reverse".to_string(),
                "encoder.lstm_1.bias_hh_l0".to_string(),
                "encoder.lstm_1.bias_ih_l0".to_string(),
                "encoder.lstm_1.weight_hh_l0".to_string(),
                "encoder.lstm_1.weight_ih_l0".to_string()
            ]
        );
    }
}
