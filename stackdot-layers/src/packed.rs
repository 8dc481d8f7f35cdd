//! Packing of variable-length sequence batches.
//!
//! A padded batch of shape `[batch_size, time_steps, features]` is packed
//! into a matrix that contains only the time steps within the true length
//! of each sequence. Recurrent kernels consume this representation, so
//! that padding never influences the state of a sequence. Unpacking pads
//! the batch again, up to the longest true length in the batch.

use tch::{Device, Kind, Tensor};

use crate::error::LayerError;

/// A packed batch of variable-length sequences.
#[derive(Debug)]
pub struct PackedSequence {
    batch_size: i64,

    /// Packed time steps of shape `[sum(lengths), features]`.
    data: Tensor,

    /// The number of active sequences per time step (CPU, `Int64`).
    batch_sizes: Tensor,

    /// Permutation that sorts the batch by decreasing length.
    sorted_indices: Option<Tensor>,

    /// Inverse of `sorted_indices`.
    unsorted_indices: Option<Tensor>,
}

impl PackedSequence {
    /// Pack a padded batch.
    ///
    /// `padded` has shape `[batch_size, time_steps, features]` and
    /// `lengths` holds the true length of each sequence. If `sorted` is
    /// `true`, the lengths must be non-increasing, otherwise packing
    /// fails. If `sorted` is `false`, the batch is sorted by length before
    /// packing and the original order is restored by
    /// [`PackedSequence::unpack`].
    pub fn pack(padded: &Tensor, lengths: &Tensor, sorted: bool) -> Result<Self, LayerError> {
        let (batch_size, _, _) = padded.size3()?;

        if lengths.size() != [batch_size] {
            return Err(LayerError::IncorrectShape {
                name: "lengths",
                expected: "[batch_size]",
                got: lengths.size(),
            });
        }

        // The packing kernel requires lengths as a CPU tensor.
        let lengths = lengths.f_to_device(Device::Cpu)?.f_to_kind(Kind::Int64)?;

        let (sorted_padded, sorted_lengths, sorted_indices) = if sorted {
            (padded.shallow_clone(), lengths, None)
        } else {
            let (sorted_lengths, sorted_indices) = lengths.f_sort(0, true)?;
            let sorted_indices = sorted_indices.f_to_device(padded.device())?;
            (
                padded.f_index_select(0, &sorted_indices)?,
                sorted_lengths,
                Some(sorted_indices),
            )
        };

        let (data, batch_sizes) =
            Tensor::f_internal_pack_padded_sequence(&sorted_padded, &sorted_lengths, true)?;

        let unsorted_indices = sorted_indices
            .as_ref()
            .map(|indices| indices.f_argsort(0, false))
            .transpose()?;

        Ok(PackedSequence {
            batch_size,
            data,
            batch_sizes,
            sorted_indices,
            unsorted_indices,
        })
    }

    /// Strip padding beyond the true sequence lengths.
    ///
    /// Returns a tensor of shape `[batch_size, max(lengths), features]`
    /// in the original batch order. Time steps beyond the true length of
    /// a sequence are zero.
    pub fn repack(padded: &Tensor, lengths: &Tensor, sorted: bool) -> Result<Tensor, LayerError> {
        Self::pack(padded, lengths, sorted)?.unpack()
    }

    /// The number of sequences in the batch.
    pub fn batch_size(&self) -> i64 {
        self.batch_size
    }

    /// The number of active sequences per time step.
    pub fn batch_sizes(&self) -> &Tensor {
        &self.batch_sizes
    }

    /// The packed time steps, shape `[sum(lengths), features]`.
    pub fn data(&self) -> &Tensor {
        &self.data
    }

    /// The length of the longest sequence in the batch.
    pub fn max_length(&self) -> i64 {
        self.batch_sizes.size()[0]
    }

    /// Replace the packed data, retaining the packing structure.
    ///
    /// `data` must have one row for every packed time step of `self`.
    pub fn with_data(&self, data: Tensor) -> Result<Self, LayerError> {
        if data.dim() != 2 || data.size()[0] != self.data.size()[0] {
            return Err(LayerError::IncorrectShape {
                name: "packed data",
                expected: "[sum(lengths), features]",
                got: data.size(),
            });
        }

        Ok(PackedSequence {
            batch_size: self.batch_size,
            data,
            batch_sizes: self.batch_sizes.shallow_clone(),
            sorted_indices: self.sorted_indices.as_ref().map(Tensor::shallow_clone),
            unsorted_indices: self.unsorted_indices.as_ref().map(Tensor::shallow_clone),
        })
    }

    /// Unpack into a padded batch in the original batch order.
    ///
    /// The result has shape `[batch_size, max(lengths), features]`, time
    /// steps beyond the true length of a sequence are zero.
    pub fn unpack(&self) -> Result<Tensor, LayerError> {
        let (padded, _) = Tensor::f_internal_pad_packed_sequence(
            &self.data,
            &self.batch_sizes,
            true,
            0.0,
            self.max_length(),
        )?;

        Ok(match &self.unsorted_indices {
            Some(unsorted_indices) => padded.f_index_select(0, unsorted_indices)?,
            None => padded,
        })
    }
}
