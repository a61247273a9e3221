//! # Connectivity descriptions
//!
//! Validated, immutable descriptions of who connects to whom:
//!
//! - [`ConnectivitySpec`]: a sparse coordinate-format edge list between two
//!   neuron populations (hidden-to-hidden or input-to-hidden)
//! - [`IndexMap`]: an injective placement of an external vector into a
//!   population
//! - [`FeedbackAdjacency`]: the layer-level feedback graph of a layer stack
//!
//! All three are validated once at construction and never mutated by a forward
//! pass. Connectivity and index maps persist as small JSON artifacts:
//!
//! ```text
//! connectivity: {"shape": [rows, cols], "edges": [[row, col, weight], ...]}
//! index map:    [i0, i1, i2, ...]
//! ```

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};

mod feedback;
mod index_map;
mod spec;

pub use feedback::FeedbackAdjacency;
pub use index_map::IndexMap;
pub use spec::{ConnectivitySpec, Edge};

/// Builds a 1-D integer index tensor on `device`.
pub(crate) fn index_tensor<B: Backend>(indices: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let data: Vec<i64> = indices.iter().map(|&i| i as i64).collect();
    Tensor::from_data(TensorData::new(data, [indices.len()]), device)
}
