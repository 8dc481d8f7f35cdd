use std::io;

use stackdot_layers::LayerError;
use tch::TchError;
use thiserror::Error;

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StackdotError {
    #[error("Illegal configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    IoError(#[from] io::Error),

    #[error(transparent)]
    Layer(#[from] LayerError),

    #[error("Invalid input batch: {0}")]
    Precondition(#[from] PreconditionError),

    #[error(transparent)]
    Tch(#[from] TchError),

    #[error(transparent)]
    TomlDeserializationError(#[from] toml::de::Error),
}

/// Inconsistencies in the encoder configuration.
///
/// These are detected when the encoder is constructed.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ConfigError {
    #[error("the residual stack has {expected} layers, the recurrent stack has {got}")]
    LayerCount { expected: usize, got: usize },

    #[error("layer {layer} expects {got} input features, the residual stack provides {expected}")]
    LayerInputSize { layer: usize, expected: i64, got: i64 },

    #[error(
        "layer {layer} has output size {got}, but layers before the last layer must have \
         the output size of the first layer ({expected}) to be summed"
    )]
    MiddleLayerOutputSize { layer: usize, expected: i64, got: i64 },

    #[error("the encoder should have at least one recurrent layer")]
    NoLayers,

    #[error("{name} should be larger than 0, was {value}")]
    NonPositive { name: &'static str, value: i64 },

    #[error("padding index {padding_index} is not in the vocabulary of size {vocab_size}")]
    PaddingIndexOutOfRange { padding_index: i64, vocab_size: i64 },

    #[error("pretrained embeddings should have shape [vocab_size, embedding_dim], has shape {0:?}")]
    PretrainedShape(Vec<i64>),
}

/// Malformed encoder inputs.
///
/// These are detected before any computation is performed on a batch.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum PreconditionError {
    #[error("batch has {n_sequences} sequences, but {n_lengths} lengths")]
    BatchSize { n_sequences: i64, n_lengths: i64 },

    #[error("batch is already filled with {batch_size} sequences")]
    BatchFull { batch_size: usize },

    #[error("batch does not contain any sequences")]
    EmptyBatch,

    #[error("sequence {index} has length {length}, which exceeds the maximum sentence length {max_length}")]
    LengthExceedsMax {
        index: usize,
        length: i64,
        max_length: i64,
    },

    #[error("sequence {index} has non-positive length {length}")]
    NonPositiveLength { index: usize, length: i64 },

    #[error("token ids should have shape {expected}, has shape {got:?}")]
    TokenShape { expected: &'static str, got: Vec<i64> },

    #[error("token ids should be in [0, {vocab_size}), found ids in [{min}, {max}]")]
    TokenOutOfRange { min: i64, max: i64, vocab_size: i64 },

    #[error("token matrix has {got} time steps, expected the maximum sentence length {expected}")]
    TokenWidth { expected: i64, got: i64 },

    #[error(
        "batch is marked as sorted, but sequence {index} (length {length}) is longer than \
         its predecessor (length {previous})"
    )]
    UnsortedLengths {
        index: usize,
        previous: i64,
        length: i64,
    },
}
