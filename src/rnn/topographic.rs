use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use tracing::debug;

use super::NetworkOutput;
use crate::cells::TopographicCell;
use crate::error::{BioplnnError, Result};
use crate::readout::Readout;

/// Sparse topographic RNN with a classification readout.
///
/// The cell is unrolled for exactly `num_steps` steps; the readout sees the
/// cell's reported neurons.
///
/// # Example
///
/// ```ignore
/// let net = TopographicRnnConfig::new(10, hh_path, ih_path).init::<Backend>(&device)?;
///
/// // the same input at every step
/// let (logits, state) = net.forward_static(x, None)?;
///
/// // one input per step, [batch, num_steps, width]
/// let (logits, state) = net.forward(seq, None)?;
/// ```
#[derive(Module, Debug)]
pub struct TopographicRNN<B: Backend> {
    cell: TopographicCell<B>,
    readout: Readout<B>,
    num_steps: usize,
    loss_all_timesteps: bool,
    batch_first: bool,
}

impl<B: Backend> TopographicRNN<B> {
    pub fn new(cell: TopographicCell<B>, readout: Readout<B>, num_steps: usize) -> Result<Self> {
        if num_steps == 0 {
            return Err(BioplnnError::config("num_steps must be at least 1"));
        }
        if readout.in_features() != cell.output_size() {
            return Err(BioplnnError::config(format!(
                "Readout expects {} features, cell reports {} neurons",
                readout.in_features(),
                cell.output_size()
            )));
        }
        Ok(Self {
            cell,
            readout,
            num_steps,
            loss_all_timesteps: false,
            batch_first: true,
        })
    }

    /// Set whether sequence input is batch-first (default: true)
    pub fn with_batch_first(mut self, batch_first: bool) -> Self {
        self.batch_first = batch_first;
        self
    }

    /// Set whether logits of every step are returned (default: false)
    pub fn with_loss_all_timesteps(mut self, loss_all_timesteps: bool) -> Self {
        self.loss_all_timesteps = loss_all_timesteps;
        self
    }

    pub fn cell(&self) -> &TopographicCell<B> {
        &self.cell
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    pub fn input_size(&self) -> usize {
        self.cell.input_size()
    }

    /// Averages the channels of an image and flattens it,
    /// `[batch, c, h, w]` to `[batch, h * w]`.
    pub fn flatten_image(x: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch, _, h, w] = x.dims();
        x.mean_dim(1).reshape([batch, h * w])
    }

    /// Presents one input at every step.
    ///
    /// # Arguments
    /// * `x` - Input of shape `[batch, input_size]`
    /// * `state` - Optional initial state `[batch, num_neurons]`
    ///
    /// # Returns
    /// Logits and the final state.
    pub fn forward_static(
        &self,
        x: Tensor<B, 2>,
        state: Option<Tensor<B, 2>>,
    ) -> Result<(NetworkOutput<B>, Tensor<B, 2>)> {
        let [batch, _] = x.dims();
        let device = x.device();
        let (output, state, _) = self.unroll(|_| x.clone(), batch, &device, state, false)?;
        Ok((output, state))
    }

    /// Consumes one input per step.
    ///
    /// # Arguments
    /// * `seq` - `[batch, num_steps, input_size]` if batch-first, otherwise
    ///   `[num_steps, batch, input_size]`
    /// * `state` - Optional initial state `[batch, num_neurons]`
    pub fn forward(
        &self,
        seq: Tensor<B, 3>,
        state: Option<Tensor<B, 2>>,
    ) -> Result<(NetworkOutput<B>, Tensor<B, 2>)> {
        let batch = self.check_sequence(&seq)?;
        let device = seq.device();
        let (output, state, _) =
            self.unroll(|t| self.frame(&seq, t), batch, &device, state, false)?;
        Ok((output, state))
    }

    /// Like [`Self::forward`], also returning the state after every step.
    pub fn forward_trajectory(
        &self,
        seq: Tensor<B, 3>,
        state: Option<Tensor<B, 2>>,
    ) -> Result<(NetworkOutput<B>, Vec<Tensor<B, 2>>)> {
        let batch = self.check_sequence(&seq)?;
        let device = seq.device();
        let (output, _, trajectory) =
            self.unroll(|t| self.frame(&seq, t), batch, &device, state, true)?;
        Ok((output, trajectory))
    }

    fn check_sequence(&self, seq: &Tensor<B, 3>) -> Result<usize> {
        let dims = seq.dims();
        let (batch, steps) = if self.batch_first {
            (dims[0], dims[1])
        } else {
            (dims[1], dims[0])
        };
        if steps != self.num_steps {
            let expected = if self.batch_first {
                [batch, self.num_steps, dims[2]]
            } else {
                [self.num_steps, batch, dims[2]]
            };
            return Err(BioplnnError::shape("topographic sequence", &expected, &dims));
        }
        Ok(batch)
    }

    fn frame(&self, seq: &Tensor<B, 3>, t: usize) -> Tensor<B, 2> {
        if self.batch_first {
            // seq[batch, t, features] -> [batch, features]
            seq.clone().narrow(1, t, 1).squeeze(1)
        } else {
            seq.clone().narrow(0, t, 1).squeeze(0)
        }
    }

    fn unroll(
        &self,
        frame: impl Fn(usize) -> Tensor<B, 2>,
        batch: usize,
        device: &B::Device,
        state: Option<Tensor<B, 2>>,
        keep_trajectory: bool,
    ) -> Result<(NetworkOutput<B>, Tensor<B, 2>, Vec<Tensor<B, 2>>)> {
        let mut state = state.unwrap_or_else(|| self.cell.init_state(batch, device));
        let mut logits = Vec::with_capacity(self.num_steps);
        let mut trajectory = Vec::new();

        for t in 0..self.num_steps {
            state = self.cell.step(state, frame(t))?;
            if keep_trajectory {
                trajectory.push(state.clone());
            }
            if self.loss_all_timesteps || t + 1 == self.num_steps {
                let reported = self.cell.read_output(state.clone())?;
                logits.push(self.readout.forward(reported));
            }
        }

        debug!(batch, num_steps = self.num_steps, "topographic forward");
        let output = NetworkOutput::from_logits(logits, self.loss_all_timesteps)?;
        Ok((output, state, trajectory))
    }
}
