//! # Recurrent Networks
//!
//! Complete networks that unroll a cell (or a stack of cells) for a fixed
//! number of timesteps and classify the result. **These are the primary APIs
//! most users should use.**
//!
//! ## Available Networks
//!
//! | Network | Core | Input |
//! |---------|------|-------|
//! | [`TopographicRNN`] | one sparse [`TopographicCell`](crate::cells::TopographicCell) | `[batch, width]` or a sequence |
//! | [`Conv2dEIRNN`] | a [`LayerStack`] of [`EIConvCell`](crate::cells::EIConvCell)s | `[batch, c, h, w]` or a sequence |
//!
//! ## Tensor Shapes
//!
//! ### Sequence Input
//!
//! | Format | Topographic | Layered | Default |
//! |--------|-------------|---------|---------|
//! | Batch-first | `[batch, T, width]` | `[batch, T, c, h, w]` | ✓ Yes |
//! | Sequence-first | `[T, batch, width]` | `[T, batch, c, h, w]` | No |
//!
//! `T` must equal the network's `num_steps`.
//!
//! ### Output
//!
//! | `loss_all_timesteps` | [`NetworkOutput`] | Shape |
//! |----------------------|-------------------|-------|
//! | `false` (default) | `Final` | `[batch, num_classes]` |
//! | `true` | `AllSteps` | `[batch, num_steps, num_classes]` |
//!
//! ## Stateful Processing
//!
//! Both networks return their final state. Pass it back in to continue from
//! where the previous call stopped:
//!
//! ```ignore
//! let (logits1, state) = net.forward_static(x1, None)?;
//! let (logits2, state) = net.forward_static(x2, Some(state))?;
//! ```
//!
//! For the layered network the stack's [`FlushPolicy`] decides which carried
//! buffers are actually used.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::error::{BioplnnError, Result};

pub mod ei_rnn;
pub mod layer_stack;
pub mod topographic;

pub use ei_rnn::Conv2dEIRNN;
pub use layer_stack::{
    FeedbackProjection, FeedbackResolution, FlushPolicy, LayerStack, LayerStackConfig, StackState,
};
pub use topographic::TopographicRNN;

/// Logits of a network forward pass.
#[derive(Debug, Clone)]
pub enum NetworkOutput<B: Backend> {
    /// Logits of the last step, `[batch, num_classes]`
    Final(Tensor<B, 2>),
    /// Logits of every step, `[batch, num_steps, num_classes]`
    AllSteps(Tensor<B, 3>),
}

impl<B: Backend> NetworkOutput<B> {
    /// Packs per-step logits; `all_steps = false` keeps only the last entry.
    pub(crate) fn from_logits(mut logits: Vec<Tensor<B, 2>>, all_steps: bool) -> Result<Self> {
        if all_steps {
            if logits.is_empty() {
                return Err(BioplnnError::config("No timesteps were run"));
            }
            Ok(NetworkOutput::AllSteps(Tensor::stack(logits, 1)))
        } else {
            logits
                .pop()
                .map(NetworkOutput::Final)
                .ok_or_else(|| BioplnnError::config("No timesteps were run"))
        }
    }

    pub fn dims(&self) -> Vec<usize> {
        match self {
            NetworkOutput::Final(t) => t.dims().to_vec(),
            NetworkOutput::AllSteps(t) => t.dims().to_vec(),
        }
    }

    /// Logits of the last step in either mode.
    pub fn final_logits(&self) -> Tensor<B, 2> {
        match self {
            NetworkOutput::Final(t) => t.clone(),
            NetworkOutput::AllSteps(t) => {
                let [batch, steps, classes] = t.dims();
                t.clone().narrow(1, steps - 1, 1).reshape([batch, classes])
            }
        }
    }

    pub fn into_all_steps(self) -> Option<Tensor<B, 3>> {
        match self {
            NetworkOutput::AllSteps(t) => Some(t),
            NetworkOutput::Final(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_final_logits_from_all_steps() {
        let device = Default::default();
        let logits = vec![
            Tensor::<TestBackend, 2>::from_floats([[1.0, 2.0]], &device),
            Tensor::<TestBackend, 2>::from_floats([[3.0, 4.0]], &device),
        ];

        let output = NetworkOutput::from_logits(logits, true).unwrap();
        assert_eq!(output.dims(), vec![1, 2, 2]);
        assert_eq!(
            output.final_logits().into_data().to_vec::<f32>().unwrap(),
            vec![3.0, 4.0]
        );
    }

    #[test]
    fn test_final_only() {
        let device = Default::default();
        let logits = vec![
            Tensor::<TestBackend, 2>::zeros([2, 3], &device),
            Tensor::<TestBackend, 2>::ones([2, 3], &device),
        ];

        let output = NetworkOutput::from_logits(logits, false).unwrap();
        assert_eq!(output.dims(), vec![2, 3]);
        assert!(output.into_all_steps().is_none());
    }
}
