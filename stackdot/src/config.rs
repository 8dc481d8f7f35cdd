use std::io::Read;

use serde::{Deserialize, Serialize};
use stackdot_layers::LstmConfig;

use crate::error::{ConfigError, StackdotError};

/// Configuration of a single recurrent layer.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LayerSpec {
    /// Hidden size per direction.
    pub hidden_size: i64,

    /// The number of stacked LSTM layers within this layer.
    #[serde(default = "default_num_layers")]
    pub num_layers: i64,

    /// Process sequences in both directions.
    #[serde(default)]
    pub bidirectional: bool,
}

fn default_num_layers() -> i64 {
    1
}

impl LayerSpec {
    pub fn new(hidden_size: i64, num_layers: i64, bidirectional: bool) -> Self {
        LayerSpec {
            hidden_size,
            num_layers,
            bidirectional,
        }
    }

    /// The number of output features per time step.
    pub fn output_size(&self) -> i64 {
        if self.bidirectional {
            self.hidden_size * 2
        } else {
            self.hidden_size
        }
    }

    /// LSTM hyper-parameters of this layer for the given input size.
    pub fn lstm_config(&self, input_size: i64) -> LstmConfig {
        LstmConfig {
            input_size,
            hidden_size: self.hidden_size,
            num_layers: self.num_layers,
            bidirectional: self.bidirectional,
        }
    }
}

/// Encoder configuration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EncoderConfig {
    /// The recurrent layers, from the bottom to the top of the stack.
    pub layers: Vec<LayerSpec>,

    /// The number of time steps of a padded batch.
    pub max_sentence_length: i64,

    /// The token id that is used for padding.
    pub padding_index: i64,

    /// Exclude the embeddings from backpropagation.
    #[serde(default)]
    pub freeze_embeddings: bool,
}

impl EncoderConfig {
    /// The size of the encoder output.
    ///
    /// Returns `None` when there are no layers.
    pub fn output_size(&self) -> Option<i64> {
        self.layers.last().map(LayerSpec::output_size)
    }

    /// Check the configuration against an embedding vocabulary.
    ///
    /// The consistency of the layer sizes is verified when the residual
    /// stack is constructed.
    pub fn validate(&self, vocab_size: i64) -> Result<(), ConfigError> {
        if self.layers.is_empty() {
            return Err(ConfigError::NoLayers);
        }

        check_positive("maximum sentence length", self.max_sentence_length)?;

        for layer in &self.layers {
            check_positive("hidden size", layer.hidden_size)?;
            check_positive("number of layers", layer.num_layers)?;
        }

        if self.padding_index < 0 || self.padding_index >= vocab_size {
            return Err(ConfigError::PaddingIndexOutOfRange {
                padding_index: self.padding_index,
                vocab_size,
            });
        }

        Ok(())
    }
}

fn check_positive(name: &'static str, value: i64) -> Result<(), ConfigError> {
    if value > 0 {
        Ok(())
    } else {
        Err(ConfigError::NonPositive { name, value })
    }
}

pub trait TomlRead
where
    Self: Sized,
{
    fn from_toml_read(read: impl Read) -> Result<Self, StackdotError>;
}

impl TomlRead for EncoderConfig {
    fn from_toml_read(mut read: impl Read) -> Result<Self, StackdotError> {
        let mut data = String::new();
        read.read_to_string(&mut data)?;
        let config: EncoderConfig = toml::from_str(&data)?;
        Ok(config)
    }
}
