use std::fmt::Debug;

use tch::Tensor;

use crate::packed::PackedSequence;

/// Module for which a computation can fail.
pub trait FallibleModule: Debug + Send {
    /// The error type.
    type Error;

    /// Apply the module.
    fn forward(&self, input: &Tensor) -> Result<Tensor, Self::Error>;
}

/// Module that is applied to packed variable-length sequences.
///
/// Implementations only see the time steps that lie within the true
/// length of each sequence. The output is packed with the same batch
/// sizes and permutations as the input.
pub trait PackedModuleT: Debug + Send {
    /// The error type.
    type Error;

    /// Apply the module.
    ///
    /// `train` indicates whether the result is used for backpropagation.
    fn forward_packed_t(
        &self,
        input: &PackedSequence,
        train: bool,
    ) -> Result<PackedSequence, Self::Error>;

    /// The number of input features per time step.
    fn input_size(&self) -> i64;

    /// The number of output features per time step.
    fn output_size(&self) -> i64;
}
