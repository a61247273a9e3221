use burn::module::{Ignored, Module};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use tracing::debug;

use super::layer_stack::{LayerStack, StackState};
use super::NetworkOutput;
use crate::error::{BioplnnError, Result};
use crate::readout::{Readout, ReadoutPooling};

/// Convolutional excitatory/inhibitory RNN with a classification readout.
///
/// The [`LayerStack`] is unrolled for `num_steps` steps; the readout pools
/// the last layer's output at the reported steps.
///
/// # Example
///
/// ```ignore
/// let net = EIRnnConfig::load("ei_rnn.json")?.init::<Backend>(&device)?;
///
/// // a static image presented at every step
/// let (logits, state) = net.forward(images, None, None)?;
///
/// // a modulated network needs a cue
/// let (logits, state) = net.forward(images, Some(cue), None)?;
/// ```
#[derive(Module, Debug)]
pub struct Conv2dEIRNN<B: Backend> {
    stack: LayerStack<B>,
    readout: Readout<B>,
    pooling: Ignored<ReadoutPooling>,
    num_steps: usize,
    loss_all_timesteps: bool,
    batch_first: bool,
}

impl<B: Backend> Conv2dEIRNN<B> {
    pub fn new(
        stack: LayerStack<B>,
        readout: Readout<B>,
        pooling: ReadoutPooling,
        num_steps: usize,
    ) -> Result<Self> {
        if num_steps == 0 {
            return Err(BioplnnError::config("num_steps must be at least 1"));
        }
        if let Some(gate) = stack.modulation() {
            gate.config().steps.validate(num_steps)?;
        }
        let features = pooling.features(stack.output_dims());
        if readout.in_features() != features {
            return Err(BioplnnError::config(format!(
                "Readout expects {} features, {:?} pooling of the last layer gives {}",
                readout.in_features(),
                pooling,
                features
            )));
        }
        Ok(Self {
            stack,
            readout,
            pooling: Ignored(pooling),
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

    pub fn stack(&self) -> &LayerStack<B> {
        &self.stack
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    /// Presents a static image at every step.
    ///
    /// # Arguments
    /// * `x` - Images `[batch, in_channels, h, w]`
    /// * `cue` - Modulation cue `[batch, cue_width]`, required when modulated
    /// * `state` - Carried buffers, filtered through the flush policy
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        cue: Option<Tensor<B, 2>>,
        state: Option<StackState<B>>,
    ) -> Result<(NetworkOutput<B>, StackState<B>)> {
        self.run(&[x], cue, state)
    }

    /// Consumes one frame per step.
    ///
    /// # Arguments
    /// * `x` - `[batch, num_steps, c, h, w]` if batch-first, otherwise
    ///   `[num_steps, batch, c, h, w]`
    pub fn forward_sequence(
        &self,
        x: Tensor<B, 5>,
        cue: Option<Tensor<B, 2>>,
        state: Option<StackState<B>>,
    ) -> Result<(NetworkOutput<B>, StackState<B>)> {
        let dims = x.dims();
        let (time_dim, steps) = if self.batch_first {
            (1, dims[1])
        } else {
            (0, dims[0])
        };
        if steps != self.num_steps {
            let mut expected = dims;
            expected[time_dim] = self.num_steps;
            return Err(BioplnnError::shape("layered sequence", &expected, &dims));
        }

        let frames: Vec<Tensor<B, 4>> = (0..steps)
            .map(|t| x.clone().narrow(time_dim, t, 1).squeeze(time_dim))
            .collect();
        self.run(&frames, cue, state)
    }

    fn run(
        &self,
        frames: &[Tensor<B, 4>],
        cue: Option<Tensor<B, 2>>,
        state: Option<StackState<B>>,
    ) -> Result<(NetworkOutput<B>, StackState<B>)> {
        let (outputs, state) = self
            .stack
            .forward(frames, cue.as_ref(), state, self.num_steps)?;

        let reported: Vec<Tensor<B, 4>> = if self.loss_all_timesteps {
            outputs
        } else {
            outputs.into_iter().last().into_iter().collect()
        };
        let logits = reported
            .into_iter()
            .map(|out| self.readout.forward(self.pooling.0.pool(out)))
            .collect();

        debug!(
            batch = state.batch_size(),
            num_steps = self.num_steps,
            "layered forward"
        );
        let output = NetworkOutput::from_logits(logits, self.loss_all_timesteps)?;
        Ok((output, state))
    }
}
