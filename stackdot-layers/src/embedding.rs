use std::borrow::Borrow;

use stackdot_tch_ext::PathExt;
use tch::Tensor;

use crate::error::LayerError;
use crate::module::FallibleModule;

/// Embedding lookup layer initialized from pretrained embeddings.
#[derive(Debug)]
pub struct Embedding {
    embeddings: Tensor,
    freeze: bool,
    padding_idx: Option<i64>,
}

impl Embedding {
    /// Construct an embedding layer from a pretrained embedding matrix.
    ///
    /// The matrix of shape `[vocab_size, embedding_dim]` is copied into
    /// the variable store. The row `padding_idx` does not receive
    /// gradients. If `freeze` is `true`, lookups are excluded from
    /// backpropagation altogether.
    pub fn from_pretrained<'a>(
        vs: impl Borrow<PathExt<'a>>,
        pretrained: &Tensor,
        padding_idx: Option<i64>,
        freeze: bool,
    ) -> Result<Self, LayerError> {
        if pretrained.dim() != 2 {
            return Err(LayerError::IncorrectShape {
                name: "pretrained embeddings",
                expected: "[vocab_size, embedding_dim]",
                got: pretrained.size(),
            });
        }

        let embeddings = vs.borrow().var_copy("embeddings", pretrained)?;

        Ok(Embedding {
            embeddings,
            freeze,
            padding_idx,
        })
    }

    /// The dimensionality of the embeddings.
    pub fn embedding_dim(&self) -> i64 {
        self.embeddings.size()[1]
    }

    /// The number of embeddings.
    pub fn vocab_size(&self) -> i64 {
        self.embeddings.size()[0]
    }

    fn lookup(&self, input: &Tensor) -> Result<Tensor, LayerError> {
        Ok(Tensor::f_embedding(
            &self.embeddings,
            &input.f_to_device(self.embeddings.device())?,
            self.padding_idx.unwrap_or(-1),
            false,
            false,
        )?)
    }
}

impl FallibleModule for Embedding {
    type Error = LayerError;

    fn forward(&self, input: &Tensor) -> Result<Tensor, Self::Error> {
        if self.freeze {
            tch::no_grad(|| self.lookup(input))
        } else {
            self.lookup(input)
        }
    }
}
