//! Exact sparse propagation over a fixed edge list.
//!
//! The sparsity pattern is frozen at construction; only the per-edge weights
//! are parameters. A forward pass gathers the source columns, scales them by
//! their edge weights and scatter-adds the products into the target columns,
//! so the cost is `O(nnz × batch)` and both operations are differentiable.

use burn::module::{Ignored, Module, Param};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::connectivity::{index_tensor, ConnectivitySpec};

/// Frozen coordinate structure of a [`SparseLinear`]
#[derive(Debug, Clone)]
pub struct SparseIndex {
    pub rows: usize,
    pub cols: usize,
    pub sources: Vec<usize>,
    pub targets: Vec<usize>,
}

/// Linear map `x · W` with `W` given by a [`ConnectivitySpec`].
#[derive(Module, Debug)]
pub struct SparseLinear<B: Backend> {
    /// One trainable weight per edge; `None` when the spec has no edges
    weight: Option<Param<Tensor<B, 1>>>,
    index: Ignored<SparseIndex>,
}

impl<B: Backend> SparseLinear<B> {
    /// Initializes the edge weights from the spec.
    pub fn new(spec: &ConnectivitySpec, device: &B::Device) -> Self {
        let weight = if spec.is_empty() {
            None
        } else {
            let values = spec.weights();
            Some(Param::from_tensor(Tensor::<B, 1>::from_floats(
                values.as_slice(),
                device,
            )))
        };

        Self {
            weight,
            index: Ignored(SparseIndex {
                rows: spec.rows(),
                cols: spec.cols(),
                sources: spec.sources(),
                targets: spec.targets(),
            }),
        }
    }

    /// Input width
    pub fn rows(&self) -> usize {
        self.index.0.rows
    }

    /// Output width
    pub fn cols(&self) -> usize {
        self.index.0.cols
    }

    pub fn nnz(&self) -> usize {
        self.index.0.sources.len()
    }

    /// Propagates `x: [batch, rows]` to `[batch, cols]`.
    ///
    /// The caller is responsible for the width check.
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let [batch, _] = x.dims();
        let device = x.device();
        let out = Tensor::<B, 2>::zeros([batch, self.index.0.cols], &device);

        let Some(weight) = &self.weight else {
            return out;
        };

        let sources = index_tensor::<B>(&self.index.0.sources, &device);
        let targets = index_tensor::<B>(&self.index.0.targets, &device);

        // [batch, nnz] * [1, nnz]
        let contributions = x.select(1, sources) * weight.val().unsqueeze::<2>();
        out.select_assign(1, targets, contributions)
    }
}
