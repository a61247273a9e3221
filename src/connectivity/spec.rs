use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use ndarray::Array2;
use rand::prelude::*;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BioplnnError, Result};

/// One synapse: `row` is the presynaptic position, `col` the postsynaptic neuron.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub row: usize,
    pub col: usize,
    pub weight: f32,
}

/// On-disk layout of a connectivity artifact
#[derive(Serialize, Deserialize)]
struct ConnectivityArtifact {
    shape: (usize, usize),
    edges: Vec<(usize, usize, f32)>,
}

/// Sparse connectivity in coordinate format.
///
/// Propagating a batch-major state `x` of shape `[batch, rows]` through the
/// spec yields `[batch, cols]` with `out[b, col] = Σ weight * x[b, row]`,
/// i.e. `x · W` for the dense matrix `W` the edge list describes.
///
/// Construction validates every coordinate against `shape` and coalesces
/// duplicate `(row, col)` pairs by summing their weights. Edges are kept
/// sorted by `(row, col)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ConnectivityArtifact", into = "ConnectivityArtifact")]
pub struct ConnectivitySpec {
    shape: (usize, usize),
    edges: Vec<Edge>,
}

impl ConnectivitySpec {
    /// Creates a validated spec from `(row, col, weight)` triples.
    pub fn new<I>(shape: (usize, usize), edges: I) -> Result<Self>
    where
        I: IntoIterator<Item = (usize, usize, f32)>,
    {
        let (rows, cols) = shape;
        let mut coalesced: BTreeMap<(usize, usize), f32> = BTreeMap::new();

        for (row, col, weight) in edges {
            if row >= rows {
                return Err(BioplnnError::out_of_range("connectivity row", row, rows));
            }
            if col >= cols {
                return Err(BioplnnError::out_of_range("connectivity col", col, cols));
            }
            if !weight.is_finite() {
                return Err(BioplnnError::config(format!(
                    "Non-finite weight {} on edge ({}, {})",
                    weight, row, col
                )));
            }
            *coalesced.entry((row, col)).or_insert(0.0) += weight;
        }

        let edges = coalesced
            .into_iter()
            .map(|((row, col), weight)| Edge { row, col, weight })
            .collect();

        Ok(Self { shape, edges })
    }

    /// A spec with no edges.
    pub fn empty(shape: (usize, usize)) -> Self {
        Self {
            shape,
            edges: Vec::new(),
        }
    }

    /// Square spec with a single self-edge of `weight` on every neuron.
    pub fn identity(num_neurons: usize, weight: f32) -> Self {
        Self {
            shape: (num_neurons, num_neurons),
            edges: (0..num_neurons)
                .map(|i| Edge {
                    row: i,
                    col: i,
                    weight,
                })
                .collect(),
        }
    }

    /// Random topographic connectivity over a 2-D neuron sheet.
    ///
    /// Every neuron at `(i, j)` receives `synapses_per_neuron` synapses whose
    /// sources are drawn from a Gaussian of std `synapse_std` centred on
    /// `(i, j)`, truncated to integer coordinates and clamped to the sheet.
    /// With `self_recurrence` each neuron also receives a synapse from itself.
    /// Weights follow He initialization, `N(0, 2 / synapses_per_neuron)`.
    /// Neurons are numbered row-major.
    pub fn random_topographic(
        sheet_size: (usize, usize),
        synapse_std: f32,
        synapses_per_neuron: usize,
        self_recurrence: bool,
        seed: u64,
    ) -> Result<Self> {
        let (sheet_rows, sheet_cols) = sheet_size;
        if sheet_rows == 0 || sheet_cols == 0 {
            return Err(BioplnnError::config(format!(
                "Sheet size must be non-zero, got {:?}",
                sheet_size
            )));
        }
        if synapses_per_neuron == 0 {
            return Err(BioplnnError::config("synapses_per_neuron must be positive"));
        }
        if !(synapse_std.is_finite() && synapse_std >= 0.0) {
            return Err(BioplnnError::config(format!(
                "synapse_std must be finite and non-negative, got {}",
                synapse_std
            )));
        }

        let num_neurons = sheet_rows * sheet_cols;
        let mut rng = StdRng::seed_from_u64(seed);
        // std of 0 is a valid degenerate normal
        let offset = Normal::new(0.0f32, synapse_std)
            .map_err(|e| BioplnnError::config(format!("Invalid synapse_std: {}", e)))?;
        let he = Normal::new(0.0f32, (2.0 / synapses_per_neuron as f32).sqrt())
            .map_err(|e| BioplnnError::config(format!("Invalid He scale: {}", e)))?;

        let clamp = |v: f32, len: usize| -> usize { (v as i64).clamp(0, len as i64 - 1) as usize };

        let per_neuron = synapses_per_neuron + usize::from(self_recurrence);
        let mut triples = Vec::with_capacity(num_neurons * per_neuron);
        for i in 0..sheet_rows {
            for j in 0..sheet_cols {
                let target = i * sheet_cols + j;
                for _ in 0..synapses_per_neuron {
                    let si = clamp(i as f32 + offset.sample(&mut rng), sheet_rows);
                    let sj = clamp(j as f32 + offset.sample(&mut rng), sheet_cols);
                    triples.push((si * sheet_cols + sj, target, he.sample(&mut rng)));
                }
                if self_recurrence {
                    triples.push((target, target, he.sample(&mut rng)));
                }
            }
        }

        let spec = Self::new((num_neurons, num_neurons), triples)?;
        debug!(
            sheet_rows,
            sheet_cols,
            nnz = spec.nnz(),
            "generated random topographic connectivity"
        );
        Ok(spec)
    }

    /// Adds a self-edge of `weight` to every neuron that does not already have one.
    ///
    /// Only meaningful for square specs; rectangular specs are returned unchanged.
    pub fn with_self_recurrence(self, weight: f32) -> Self {
        let (rows, cols) = self.shape;
        if rows != cols {
            return self;
        }
        let mut map: BTreeMap<(usize, usize), f32> = self
            .edges
            .iter()
            .map(|e| ((e.row, e.col), e.weight))
            .collect();
        for i in 0..rows {
            map.entry((i, i)).or_insert(weight);
        }
        Self {
            shape: self.shape,
            edges: map
                .into_iter()
                .map(|((row, col), weight)| Edge { row, col, weight })
                .collect(),
        }
    }

    /// Renumbers rows and columns: old row `r` becomes `row_perm[r]`, old
    /// column `c` becomes `col_perm[c]`.
    pub fn relabel(&self, row_perm: &[usize], col_perm: &[usize]) -> Result<Self> {
        let (rows, cols) = self.shape;
        check_permutation("row relabeling", row_perm, rows)?;
        check_permutation("column relabeling", col_perm, cols)?;
        Self::new(
            self.shape,
            self.edges
                .iter()
                .map(|e| (row_perm[e.row], col_perm[e.col], e.weight)),
        )
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Number of presynaptic positions
    pub fn rows(&self) -> usize {
        self.shape.0
    }

    /// Number of postsynaptic neurons
    pub fn cols(&self) -> usize {
        self.shape.1
    }

    /// Number of stored (coalesced) edges
    pub fn nnz(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn sources(&self) -> Vec<usize> {
        self.edges.iter().map(|e| e.row).collect()
    }

    pub fn targets(&self) -> Vec<usize> {
        self.edges.iter().map(|e| e.col).collect()
    }

    pub fn weights(&self) -> Vec<f32> {
        self.edges.iter().map(|e| e.weight).collect()
    }

    /// Number of incoming edges per postsynaptic neuron
    pub fn fan_in(&self) -> Vec<usize> {
        let mut counts = vec![0; self.cols()];
        for e in &self.edges {
            counts[e.col] += 1;
        }
        counts
    }

    /// Dense `[rows, cols]` view, for inspection and small-matrix checks.
    pub fn to_dense(&self) -> Array2<f32> {
        let mut dense = Array2::zeros(self.shape);
        for e in &self.edges {
            dense[[e.row, e.col]] += e.weight;
        }
        dense
    }

    /// Parses a JSON artifact.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Loads a JSON connectivity artifact from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let spec = Self::from_json_str(&fs::read_to_string(path)?)?;
        debug!(
            path = %path.display(),
            rows = spec.rows(),
            cols = spec.cols(),
            nnz = spec.nnz(),
            "loaded connectivity artifact"
        );
        Ok(spec)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.to_json_string()?)?;
        Ok(())
    }
}

impl TryFrom<ConnectivityArtifact> for ConnectivitySpec {
    type Error = BioplnnError;

    fn try_from(artifact: ConnectivityArtifact) -> Result<Self> {
        Self::new(artifact.shape, artifact.edges)
    }
}

impl From<ConnectivitySpec> for ConnectivityArtifact {
    fn from(spec: ConnectivitySpec) -> Self {
        Self {
            shape: spec.shape,
            edges: spec
                .edges
                .into_iter()
                .map(|e| (e.row, e.col, e.weight))
                .collect(),
        }
    }
}

pub(crate) fn check_permutation(context: &str, perm: &[usize], len: usize) -> Result<()> {
    if perm.len() != len {
        return Err(BioplnnError::shape(context, &[len], &[perm.len()]));
    }
    let mut seen = vec![false; len];
    for &p in perm {
        if p >= len {
            return Err(BioplnnError::out_of_range(context, p, len));
        }
        if seen[p] {
            return Err(BioplnnError::DuplicateIndex { index: p });
        }
        seen[p] = true;
    }
    Ok(())
}
