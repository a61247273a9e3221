use burn::module::{Ignored, Module, Param};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::sparse::SparseLinear;
use super::CellDynamics;
use crate::connectivity::{ConnectivitySpec, IndexMap};
use crate::error::{BioplnnError, Result};

/// A single population of rate neurons wired by arbitrary sparse graphs.
///
/// Each step computes
///
/// ```text
/// pre    = state · W_hh + scatter(input) · W_ih + bias
/// state' = (1 - leak) * state + leak * act(pre)
/// ```
///
/// where `W_hh` and `W_ih` are [`ConnectivitySpec`]s propagated exactly over
/// their nonzero entries. Edge `(row, col, w)` carries activity from neuron
/// (or input position) `row` to neuron `col`.
///
/// ## Input Routing
///
/// - With an input [`IndexMap`], external input `[batch, map.len()]` is first
///   placed into a zeroed `[batch, num_neurons]` array and `W_ih` must be
///   `num_neurons × num_neurons`.
/// - Without one, external input is `[batch, W_ih.rows()]` and is propagated
///   directly.
///
/// The output [`IndexMap`] selects the reported neurons; without one the whole
/// state is reported.
#[derive(Module, Debug)]
pub struct TopographicCell<B: Backend> {
    hh: SparseLinear<B>,
    ih: SparseLinear<B>,
    bias: Option<Param<Tensor<B, 1>>>,
    input_map: Ignored<Option<IndexMap>>,
    output_map: Ignored<Option<IndexMap>>,
    dynamics: Ignored<CellDynamics>,
    num_neurons: usize,
}

impl<B: Backend> TopographicCell<B> {
    /// Creates a cell from its connectivity and index maps.
    ///
    /// The bias starts at zero and is trainable; see [`Self::without_bias`].
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the connectivity shapes or the
    /// dynamics disagree, and an index error when a map entry lies outside
    /// the population.
    pub fn new(
        hh: &ConnectivitySpec,
        ih: &ConnectivitySpec,
        input_map: Option<IndexMap>,
        output_map: Option<IndexMap>,
        dynamics: CellDynamics,
        device: &B::Device,
    ) -> Result<Self> {
        dynamics.validate()?;

        let (rows, num_neurons) = hh.shape();
        if rows != num_neurons {
            return Err(BioplnnError::config(format!(
                "Hidden-to-hidden connectivity must be square, got {}x{}",
                rows, num_neurons
            )));
        }
        if ih.cols() != num_neurons {
            return Err(BioplnnError::config(format!(
                "Input-to-hidden connectivity must target {} neurons, got {} columns",
                num_neurons,
                ih.cols()
            )));
        }

        let input_map = input_map
            .map(|map| map.for_population(num_neurons))
            .transpose()?;
        let output_map = output_map
            .map(|map| map.for_population(num_neurons))
            .transpose()?;
        if input_map.is_some() && ih.rows() != num_neurons {
            return Err(BioplnnError::config(format!(
                "Input-to-hidden connectivity must be {n}x{n} when an input index map is used, got {}x{}",
                ih.rows(),
                ih.cols(),
                n = num_neurons
            )));
        }

        Ok(Self {
            hh: SparseLinear::new(hh, device),
            ih: SparseLinear::new(ih, device),
            bias: Some(Param::from_tensor(Tensor::zeros([num_neurons], device))),
            input_map: Ignored(input_map),
            output_map: Ignored(output_map),
            dynamics: Ignored(dynamics),
            num_neurons,
        })
    }

    /// Drops the bias term.
    pub fn without_bias(mut self) -> Self {
        self.bias = None;
        self
    }

    pub fn num_neurons(&self) -> usize {
        self.num_neurons
    }

    /// Width of the external input
    pub fn input_size(&self) -> usize {
        match &self.input_map.0 {
            Some(map) => map.len(),
            None => self.ih.rows(),
        }
    }

    /// Width of the reported output
    pub fn output_size(&self) -> usize {
        match &self.output_map.0 {
            Some(map) => map.len(),
            None => self.num_neurons,
        }
    }

    pub fn dynamics(&self) -> CellDynamics {
        self.dynamics.0
    }

    /// Number of recurrent edges
    pub fn recurrent_edges(&self) -> usize {
        self.hh.nnz()
    }

    /// Zero state for a batch.
    pub fn init_state(&self, batch_size: usize, device: &B::Device) -> Tensor<B, 2> {
        Tensor::zeros([batch_size, self.num_neurons], device)
    }

    /// Advances the population by one step.
    ///
    /// # Arguments
    ///
    /// * `state` - Tensor of shape `[batch, num_neurons]`
    /// * `input` - Tensor of shape `[batch, input_size]`
    ///
    /// # Returns
    ///
    /// The next state, `[batch, num_neurons]`.
    pub fn step(&self, state: Tensor<B, 2>, input: Tensor<B, 2>) -> Result<Tensor<B, 2>> {
        let [batch, width] = state.dims();
        if width != self.num_neurons {
            return Err(BioplnnError::shape(
                "topographic state",
                &[batch, self.num_neurons],
                &[batch, width],
            ));
        }
        let input_dims = input.dims();
        if input_dims != [batch, self.input_size()] {
            return Err(BioplnnError::shape(
                "topographic input",
                &[batch, self.input_size()],
                &input_dims,
            ));
        }

        let drive = match &self.input_map.0 {
            Some(map) => map.scatter(input)?,
            None => input,
        };

        let mut pre = self.hh.forward(state.clone()) + self.ih.forward(drive);
        if let Some(bias) = &self.bias {
            pre = pre + bias.val().unsqueeze::<2>();
        }

        Ok(self.dynamics.0.update(state, pre))
    }

    /// Reads the reported neurons out of a state. Pure.
    pub fn read_output(&self, state: Tensor<B, 2>) -> Result<Tensor<B, 2>> {
        match &self.output_map.0 {
            Some(map) => map.gather(state),
            None => {
                let [batch, width] = state.dims();
                if width != self.num_neurons {
                    return Err(BioplnnError::shape(
                        "topographic state",
                        &[batch, self.num_neurons],
                        &[batch, width],
                    ));
                }
                Ok(state)
            }
        }
    }
}
