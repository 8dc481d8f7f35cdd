//! Sentence encoder with a residual stack of LSTMs.
//!
//! The encoder maps a batch of variable-length token sequences to one
//! fixed-size vector per sequence. See [`ResidualStackedEncoder`] for
//! the architecture.

pub mod aggregate;
pub use aggregate::{Aggregation, LayerPolicy, ResidualAggregator};

pub mod batch;
pub use batch::{BatchBuilder, SequenceBatch};

pub mod config;
pub use config::{EncoderConfig, LayerSpec, TomlRead};

pub mod encoder;
pub use encoder::ResidualStackedEncoder;

pub mod error;
pub use error::{ConfigError, PreconditionError, StackdotError};

pub mod recurrent;
pub use recurrent::RecurrentLayerStack;
