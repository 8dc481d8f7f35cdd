use std::convert::{TryFrom, TryInto};

use ndarray::{s, Array2, ArrayView1};
use tch::{Device, Kind, Tensor};

use crate::error::{PreconditionError, StackdotError};

/// A batch of padded token sequences.
///
/// The batch consists of a token matrix of shape `[batch_size,
/// time_steps]` and the true length of every sequence. Time steps beyond
/// the true length of a sequence are padding.
#[derive(Debug)]
pub struct SequenceBatch {
    tokens: Tensor,
    lengths: Vec<i64>,
    sorted: bool,
}

impl SequenceBatch {
    /// Construct a batch.
    ///
    /// If `sorted` is `true`, the lengths must be non-increasing.
    pub fn new(tokens: Tensor, lengths: Vec<i64>, sorted: bool) -> Result<Self, PreconditionError> {
        let shape = tokens.size();
        if shape.len() != 2 {
            return Err(PreconditionError::TokenShape {
                expected: "[batch_size, max_sentence_length]",
                got: shape,
            });
        }

        if shape[0] != lengths.len() as i64 {
            return Err(PreconditionError::BatchSize {
                n_sequences: shape[0],
                n_lengths: lengths.len() as i64,
            });
        }

        if lengths.is_empty() {
            return Err(PreconditionError::EmptyBatch);
        }

        for (index, &length) in lengths.iter().enumerate() {
            if length <= 0 {
                return Err(PreconditionError::NonPositiveLength { index, length });
            }

            if length > shape[1] {
                return Err(PreconditionError::LengthExceedsMax {
                    index,
                    length,
                    max_length: shape[1],
                });
            }
        }

        if sorted {
            if let Some(index) = (1..lengths.len()).find(|&idx| lengths[idx] > lengths[idx - 1]) {
                return Err(PreconditionError::UnsortedLengths {
                    index,
                    previous: lengths[index - 1],
                    length: lengths[index],
                });
            }
        }

        Ok(SequenceBatch {
            tokens,
            lengths,
            sorted,
        })
    }

    /// Construct a batch from a token tensor and a length tensor.
    pub fn from_tensors(
        tokens: Tensor,
        lengths: &Tensor,
        sorted: bool,
    ) -> Result<Self, StackdotError> {
        let lengths = Vec::<i64>::try_from(
            &lengths
                .f_to_device(Device::Cpu)?
                .f_to_kind(Kind::Int64)?
                .f_flatten(0, -1)?,
        )?;
        Ok(Self::new(tokens, lengths, sorted)?)
    }

    /// The number of sequences in the batch.
    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    /// Returns `true` if the batch is sorted by decreasing length.
    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    /// The true sequence lengths.
    pub fn lengths(&self) -> &[i64] {
        &self.lengths
    }

    /// The true sequence lengths as a CPU tensor.
    pub fn lengths_tensor(&self) -> Tensor {
        Tensor::from_slice(&self.lengths)
    }

    /// The length of the longest sequence.
    pub fn max_length(&self) -> i64 {
        self.lengths.iter().copied().max().unwrap_or(0)
    }

    /// The padded token matrix.
    pub fn tokens(&self) -> &Tensor {
        &self.tokens
    }

    /// Sort the batch by decreasing length.
    ///
    /// Returns the sorted batch and the permutation that was applied:
    /// sequence `i` of the sorted batch is sequence `permutation[i]` of
    /// this batch. Sequences of equal length retain their order.
    pub fn sort_by_length(&self) -> Result<(SequenceBatch, Vec<usize>), StackdotError> {
        let mut permutation = (0..self.lengths.len()).collect::<Vec<_>>();
        permutation.sort_by(|&a, &b| self.lengths[b].cmp(&self.lengths[a]));

        let indices = permutation.iter().map(|&idx| idx as i64).collect::<Vec<_>>();
        let tokens = self.tokens.f_index_select(
            0,
            &Tensor::from_slice(&indices).f_to_device(self.tokens.device())?,
        )?;
        let lengths = permutation.iter().map(|&idx| self.lengths[idx]).collect();

        Ok((
            SequenceBatch {
                tokens,
                lengths,
                sorted: true,
            },
            permutation,
        ))
    }
}

/// Build a [`SequenceBatch`] from unpadded token sequences.
pub struct BatchBuilder {
    current_sequence: usize,
    tokens: Array2<i64>,
    lengths: Vec<i64>,
}

impl BatchBuilder {
    /// Create a new `BatchBuilder`.
    ///
    /// The builder holds up to `batch_size` sequences of at most
    /// `max_sentence_length` tokens. Sequences are padded with
    /// `padding_index`.
    pub fn new(batch_size: usize, max_sentence_length: usize, padding_index: i64) -> Self {
        BatchBuilder {
            current_sequence: 0,
            tokens: Array2::from_elem((batch_size, max_sentence_length), padding_index),
            lengths: Vec::with_capacity(batch_size),
        }
    }

    /// Add a sequence of token ids.
    pub fn add(&mut self, tokens: ArrayView1<i64>) -> Result<(), PreconditionError> {
        let (batch_size, max_sentence_length) = self.tokens.dim();

        if self.current_sequence >= batch_size {
            return Err(PreconditionError::BatchFull { batch_size });
        }

        if tokens.is_empty() {
            return Err(PreconditionError::NonPositiveLength {
                index: self.current_sequence,
                length: 0,
            });
        }

        if tokens.len() > max_sentence_length {
            return Err(PreconditionError::LengthExceedsMax {
                index: self.current_sequence,
                length: tokens.len() as i64,
                max_length: max_sentence_length as i64,
            });
        }

        self.tokens
            .row_mut(self.current_sequence)
            .slice_mut(s![0..tokens.len()])
            .assign(&tokens);
        self.lengths.push(tokens.len() as i64);

        self.current_sequence += 1;

        Ok(())
    }

    /// Construct the batch from the sequences added so far.
    ///
    /// If `sorted` is `true`, the sequences must have been added in order
    /// of non-increasing length.
    pub fn build(self, sorted: bool) -> Result<SequenceBatch, StackdotError> {
        let tokens: Tensor = self
            .tokens
            .slice(s![0..self.current_sequence, ..])
            .to_owned()
            .try_into()?;
        Ok(SequenceBatch::new(tokens, self.lengths, sorted)?)
    }
}
