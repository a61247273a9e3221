//! # Recurrent Cell Implementations
//!
//! Single-timestep cells. They are unrolled over a fixed number of steps by
//! the network layers in [`crate::rnn`].
//!
//! ## Cell Types
//!
//! | Cell | Population | State shape |
//! |------|------------|-------------|
//! | [`TopographicCell`] | one population, arbitrary sparse graph | `[batch, num_neurons]` |
//! | [`EIConvCell`] | pyramidal + interneuron populations, convolutional | `[batch, channels, h, w]` each |
//!
//! ## Update Rule
//!
//! Every population follows the same leaky rate update ([`CellDynamics`]):
//!
//! ```text
//! state' = (1 - leak) * state + leak * act(pre_activation)
//! ```
//!
//! With `leak = 1` (the default) this is the plain discrete update
//! `state' = act(pre_activation)`.
//!
//! ## Example: Stepping a TopographicCell
//!
//! ```ignore
//! use bioplnn::cells::{CellDynamics, TopographicCell};
//! use bioplnn::connectivity::ConnectivitySpec;
//!
//! let hh = ConnectivitySpec::new((3, 3), vec![(0, 1, 1.0), (1, 2, 1.0)])?;
//! let ih = ConnectivitySpec::new((2, 3), vec![(0, 0, 1.0)])?;
//! let cell = TopographicCell::<Backend>::new(&hh, &ih, None, None, CellDynamics::default(), &device)?
//!     .without_bias();
//!
//! let state = cell.init_state(1, &device);
//! let state = cell.step(state, input)?;
//! ```

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::activation::Activation;
use crate::error::{BioplnnError, Result};

pub mod ei_conv_cell;
pub mod sparse;
pub mod topographic_cell;

pub use ei_conv_cell::{EIConvCell, EIState, InterneuronConfig, InterneuronUnit, LayerConfig, LayerGeometry};
pub use sparse::SparseLinear;
pub use topographic_cell::TopographicCell;

/// Nonlinearity and leak shared by all populations of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellDynamics {
    pub activation: Activation,
    /// Interpolation weight of the new activation, in `(0, 1]`
    pub leak: f32,
}

impl Default for CellDynamics {
    fn default() -> Self {
        Self {
            activation: Activation::Relu,
            leak: 1.0,
        }
    }
}

impl CellDynamics {
    pub fn new(activation: Activation, leak: f32) -> Result<Self> {
        let dynamics = Self { activation, leak };
        dynamics.validate()?;
        Ok(dynamics)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.leak > 0.0 && self.leak <= 1.0) {
            return Err(BioplnnError::config(format!(
                "Leak must be in (0, 1], got {}",
                self.leak
            )));
        }
        Ok(())
    }

    /// Leaky update of one population.
    pub fn update<B: Backend, const D: usize>(
        &self,
        state: Tensor<B, D>,
        pre_activation: Tensor<B, D>,
    ) -> Tensor<B, D> {
        let activated = self.activation.forward(pre_activation);
        if self.leak == 1.0 {
            activated
        } else {
            state.mul_scalar(1.0 - self.leak) + activated.mul_scalar(self.leak)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_leak_validation() {
        assert!(CellDynamics::new(Activation::Relu, 0.0).is_err());
        assert!(CellDynamics::new(Activation::Relu, 1.5).is_err());
        assert!(CellDynamics::new(Activation::Relu, 0.25).is_ok());
    }

    #[test]
    fn test_leaky_update_interpolates() {
        let device = Default::default();
        let dynamics = CellDynamics::new(Activation::Relu, 0.25).unwrap();
        let state = Tensor::<TestBackend, 2>::from_floats([[4.0, 4.0]], &device);
        let pre = Tensor::<TestBackend, 2>::from_floats([[8.0, -8.0]], &device);

        let next = dynamics.update(state, pre).into_data().to_vec::<f32>().unwrap();
        // 0.75 * 4 + 0.25 * relu(8) and 0.75 * 4 + 0.25 * relu(-8)
        assert_eq!(next, vec![5.0, 3.0]);
    }
}
