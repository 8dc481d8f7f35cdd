//! Recurrent building blocks for batches of variable-length sequences.

pub mod embedding;
pub use embedding::Embedding;

pub mod error;
pub use error::LayerError;

pub mod lstm;
pub use lstm::{Lstm, LstmConfig};

pub mod module;
pub use module::{FallibleModule, PackedModuleT};

pub mod packed;
pub use packed::PackedSequence;

pub mod pooling;
pub use pooling::TemporalMaxPool;
