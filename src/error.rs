//! Error types for bioplnn

use thiserror::Error;

/// Errors raised while building or running a network.
///
/// Configuration and index errors are reported at construction time; shape
/// errors at the first forward call that sees the offending tensor.
#[derive(Debug, Error)]
pub enum BioplnnError {
    /// Malformed or inconsistent constructor arguments
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A runtime tensor disagrees with the geometry fixed at construction
    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A connectivity or index-map entry references a position outside its bounds
    #[error("Index out of range in {context}: {index} >= {bound}")]
    IndexOutOfRange {
        context: String,
        index: usize,
        bound: usize,
    },

    /// An index map sends two external positions to the same neuron
    #[error("Duplicate neuron index {index} in index map")]
    DuplicateIndex { index: usize },

    /// Modulation is enabled but no cue was supplied
    #[error("Modulation is enabled but no cue tensor was provided")]
    MissingCue,

    /// IO error while reading or writing an artifact
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON artifact or config
    #[error("Artifact format error: {0}")]
    Artifact(#[from] serde_json::Error),
}

impl BioplnnError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn shape(context: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    pub(crate) fn out_of_range(context: impl Into<String>, index: usize, bound: usize) -> Self {
        Self::IndexOutOfRange {
            context: context.into(),
            index,
            bound,
        }
    }
}

pub type Result<T> = std::result::Result<T, BioplnnError>;
