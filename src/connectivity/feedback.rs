use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{BioplnnError, Result};

/// Directed feedback graph among the layers of a stack.
///
/// `matrix[[src, dst]] == 1` means the output of layer `src` is fed back into
/// layer `dst`. Self-loops are rejected and the graph must be acyclic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<u8>>", into = "Vec<Vec<u8>>")]
pub struct FeedbackAdjacency {
    matrix: Array2<u8>,
}

impl FeedbackAdjacency {
    /// Validates a square 0/1 matrix given as rows.
    pub fn new(rows: Vec<Vec<u8>>) -> Result<Self> {
        let n = rows.len();
        let mut matrix = Array2::zeros((n, n));
        for (src, row) in rows.iter().enumerate() {
            if row.len() != n {
                return Err(BioplnnError::config(format!(
                    "Feedback adjacency must be square: row {} has {} entries, expected {}",
                    src,
                    row.len(),
                    n
                )));
            }
            for (dst, &value) in row.iter().enumerate() {
                if value > 1 {
                    return Err(BioplnnError::config(format!(
                        "Feedback adjacency entries must be 0 or 1, got {} at ({}, {})",
                        value, src, dst
                    )));
                }
                matrix[[src, dst]] = value;
            }
        }
        Self::from_array(matrix)
    }

    /// Validates an existing square array.
    pub fn from_array(matrix: Array2<u8>) -> Result<Self> {
        let (rows, cols) = matrix.dim();
        if rows != cols {
            return Err(BioplnnError::config(format!(
                "Feedback adjacency must be square, got {}x{}",
                rows, cols
            )));
        }
        if let Some(&v) = matrix.iter().find(|&&v| v > 1) {
            return Err(BioplnnError::config(format!(
                "Feedback adjacency entries must be 0 or 1, got {}",
                v
            )));
        }
        for i in 0..rows {
            if matrix[[i, i]] != 0 {
                return Err(BioplnnError::config(format!(
                    "Layer {} must not feed back into itself",
                    i
                )));
            }
        }
        let adjacency = Self { matrix };
        if let Some(layer) = adjacency.find_cycle() {
            return Err(BioplnnError::config(format!(
                "Feedback adjacency must be acyclic; layer {} lies on a cycle",
                layer
            )));
        }
        Ok(adjacency)
    }

    /// No feedback between any of `num_layers` layers.
    pub fn none(num_layers: usize) -> Self {
        Self {
            matrix: Array2::zeros((num_layers, num_layers)),
        }
    }

    pub fn num_layers(&self) -> usize {
        self.matrix.nrows()
    }

    /// False for layers outside the matrix.
    pub fn has_edge(&self, src: usize, dst: usize) -> bool {
        self.matrix.get((src, dst)).is_some_and(|&v| v != 0)
    }

    /// Layers feeding back into `dst`, in ascending order
    pub fn sources_of(&self, dst: usize) -> Vec<usize> {
        (0..self.num_layers())
            .filter(|&src| self.has_edge(src, dst))
            .collect()
    }

    pub fn receives_feedback(&self, dst: usize) -> bool {
        (0..self.num_layers()).any(|src| self.has_edge(src, dst))
    }

    /// All `(src, dst)` edges in row-major order
    pub fn edges(&self) -> Vec<(usize, usize)> {
        self.matrix
            .indexed_iter()
            .filter(|(_, &v)| v != 0)
            .map(|((src, dst), _)| (src, dst))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.matrix.iter().all(|&v| v == 0)
    }

    /// True when every edge goes from a lower to a higher layer, so the
    /// feedback graph agrees with the feedforward update order.
    pub fn follows_layer_order(&self) -> bool {
        self.edges().into_iter().all(|(src, dst)| src < dst)
    }

    pub fn as_array(&self) -> &Array2<u8> {
        &self.matrix
    }

    /// Kahn's algorithm; returns a node left over when a cycle exists.
    fn find_cycle(&self) -> Option<usize> {
        let n = self.num_layers();
        let mut in_degree: Vec<usize> = (0..n).map(|dst| self.sources_of(dst).len()).collect();
        let mut ready: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut visited = 0;

        while let Some(src) = ready.pop() {
            visited += 1;
            for dst in 0..n {
                if self.has_edge(src, dst) {
                    in_degree[dst] -= 1;
                    if in_degree[dst] == 0 {
                        ready.push(dst);
                    }
                }
            }
        }

        if visited == n {
            None
        } else {
            (0..n).find(|&i| in_degree[i] > 0)
        }
    }
}

impl TryFrom<Vec<Vec<u8>>> for FeedbackAdjacency {
    type Error = BioplnnError;

    fn try_from(rows: Vec<Vec<u8>>) -> Result<Self> {
        Self::new(rows)
    }
}

impl From<FeedbackAdjacency> for Vec<Vec<u8>> {
    fn from(adjacency: FeedbackAdjacency) -> Self {
        adjacency
            .matrix
            .outer_iter()
            .map(|row| row.to_vec())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_down_feedback() {
        let adj = FeedbackAdjacency::new(vec![vec![0, 0, 0], vec![1, 0, 0], vec![1, 1, 0]]).unwrap();

        assert_eq!(adj.num_layers(), 3);
        assert_eq!(adj.sources_of(0), vec![1, 2]);
        assert_eq!(adj.sources_of(1), vec![2]);
        assert!(!adj.receives_feedback(2));
        assert!(!adj.follows_layer_order());
    }

    #[test]
    fn test_edge_queries_outside_matrix() {
        let adj = FeedbackAdjacency::new(vec![vec![0, 0], vec![1, 0]]).unwrap();

        assert!(adj.has_edge(1, 0));
        assert!(!adj.has_edge(2, 0));
        assert!(!adj.has_edge(1, 5));
        assert!(!adj.receives_feedback(7));
    }

    #[test]
    fn test_rejects_self_loop() {
        let err = FeedbackAdjacency::new(vec![vec![1, 0], vec![0, 0]]).unwrap_err();
        assert!(matches!(err, BioplnnError::Configuration(_)));
    }

    #[test]
    fn test_rejects_non_square() {
        assert!(FeedbackAdjacency::new(vec![vec![0, 0], vec![0]]).is_err());
    }

    #[test]
    fn test_rejects_non_binary() {
        assert!(FeedbackAdjacency::new(vec![vec![0, 2], vec![0, 0]]).is_err());
    }

    #[test]
    fn test_rejects_cycle() {
        let err = FeedbackAdjacency::new(vec![vec![0, 1], vec![1, 0]]).unwrap_err();
        assert!(matches!(err, BioplnnError::Configuration(_)));
    }

    #[test]
    fn test_none_is_empty() {
        let adj = FeedbackAdjacency::none(4);
        assert!(adj.is_empty());
        assert!(adj.edges().is_empty());
        assert!(adj.follows_layer_order());
    }

    #[test]
    fn test_serde_round_trip() {
        let adj: FeedbackAdjacency = serde_json::from_str("[[0, 0], [1, 0]]").unwrap();
        assert!(adj.has_edge(1, 0));
        let json = serde_json::to_string(&adj).unwrap();
        assert_eq!(json, "[[0,0],[1,0]]");
        assert!(serde_json::from_str::<FeedbackAdjacency>("[[1, 0], [0, 0]]").is_err());
    }
}
