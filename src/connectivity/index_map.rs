use std::fs;
use std::path::Path;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use tracing::debug;

use super::index_tensor;
use super::spec::check_permutation;
use crate::error::{BioplnnError, Result};

/// Injective map from external vector positions to neurons of a population.
///
/// Position `k` of an external `[batch, len]` array corresponds to neuron
/// `indices[k]` of a `[batch, num_neurons]` population state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMap {
    indices: Vec<usize>,
    num_neurons: usize,
}

impl IndexMap {
    /// Validates bounds and injectivity.
    pub fn new(indices: Vec<usize>, num_neurons: usize) -> Result<Self> {
        let mut seen = vec![false; num_neurons];
        for &index in &indices {
            if index >= num_neurons {
                return Err(BioplnnError::out_of_range("index map", index, num_neurons));
            }
            if seen[index] {
                return Err(BioplnnError::DuplicateIndex { index });
            }
            seen[index] = true;
        }
        Ok(Self {
            indices,
            num_neurons,
        })
    }

    /// Revalidates the same indices against a population of `num_neurons`.
    pub fn for_population(&self, num_neurons: usize) -> Result<Self> {
        Self::new(self.indices.clone(), num_neurons)
    }

    /// Maps position `k` to neuron `k` for every neuron.
    pub fn identity(num_neurons: usize) -> Self {
        Self {
            indices: (0..num_neurons).collect(),
            num_neurons,
        }
    }

    /// Parses a JSON array of neuron indices.
    pub fn from_json_str(json: &str, num_neurons: usize) -> Result<Self> {
        let indices: Vec<usize> = serde_json::from_str(json)?;
        Self::new(indices, num_neurons)
    }

    /// Loads a JSON index-map artifact and validates it against `num_neurons`.
    pub fn load(path: impl AsRef<Path>, num_neurons: usize) -> Result<Self> {
        let path = path.as_ref();
        let map = Self::from_json_str(&fs::read_to_string(path)?, num_neurons)?;
        debug!(
            path = %path.display(),
            len = map.len(),
            num_neurons,
            "loaded index map artifact"
        );
        Ok(map)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string(&self.indices)?)?;
        Ok(())
    }

    /// External vector length
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Size of the population the map points into
    pub fn num_neurons(&self) -> usize {
        self.num_neurons
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Renumbers target neurons: old neuron `n` becomes `perm[n]`.
    pub fn relabel(&self, perm: &[usize]) -> Result<Self> {
        check_permutation("index map relabeling", perm, self.num_neurons)?;
        Self::new(
            self.indices.iter().map(|&i| perm[i]).collect(),
            self.num_neurons,
        )
    }

    /// Places `x: [batch, len]` into a zeroed `[batch, num_neurons]` array.
    pub fn scatter<B: Backend>(&self, x: Tensor<B, 2>) -> Result<Tensor<B, 2>> {
        let [batch, width] = x.dims();
        if width != self.len() {
            return Err(BioplnnError::shape(
                "index map scatter input",
                &[batch, self.len()],
                &[batch, width],
            ));
        }
        let device = x.device();
        let zeros = Tensor::<B, 2>::zeros([batch, self.num_neurons], &device);
        if self.is_empty() {
            return Ok(zeros);
        }
        Ok(zeros.select_assign(1, index_tensor::<B>(&self.indices, &device), x))
    }

    /// Reads `[batch, len]` out of a `[batch, num_neurons]` state. Pure.
    pub fn gather<B: Backend>(&self, state: Tensor<B, 2>) -> Result<Tensor<B, 2>> {
        let [batch, width] = state.dims();
        if width != self.num_neurons {
            return Err(BioplnnError::shape(
                "index map gather state",
                &[batch, self.num_neurons],
                &[batch, width],
            ));
        }
        let device = state.device();
        Ok(state.select(1, index_tensor::<B>(&self.indices, &device)))
    }
}
