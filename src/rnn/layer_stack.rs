//! Ordered stack of [`EIConvCell`] layers with feedback and modulation.

use burn::module::{Ignored, Module};
use burn::nn::conv::Conv2d;
use burn::tensor::backend::Backend;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::cells::ei_conv_cell::{check_dims, same_conv};
use crate::cells::{CellDynamics, EIConvCell, EIState, LayerConfig};
use crate::connectivity::FeedbackAdjacency;
use crate::error::{BioplnnError, Result};
use crate::modulation::{ModulationConfig, ModulationGate, ModulationScope};

/// Which buffer groups are zeroed at the start of every invocation.
///
/// A group that is not flushed is taken from the caller's carried
/// [`StackState`], which allows streaming over consecutive calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushPolicy {
    /// Pyramidal and interneuron states
    pub hidden: bool,
    /// Layer outputs
    pub out: bool,
    /// Feedback buffers
    pub fb: bool,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            hidden: true,
            out: true,
            fb: true,
        }
    }
}

impl FlushPolicy {
    /// Carries every buffer group over between calls.
    pub fn streaming() -> Self {
        Self {
            hidden: false,
            out: false,
            fb: false,
        }
    }
}

/// When feedback built from layer outputs is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackResolution {
    /// Step `t` consumes feedback built from the outputs of step `t - 1`
    #[default]
    Stale,
    /// Feedback is built right before the receiving layer updates, from the
    /// outputs of the same step. Every edge must go from a lower to a higher
    /// layer.
    SameStep,
}

/// Layer layout and stack-level behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerStackConfig {
    /// Spatial size `(h, w)` of the first layer's input
    pub in_size: (usize, usize),
    pub in_channels: usize,
    pub layers: Vec<LayerConfig>,
    /// Absent means no feedback
    #[serde(default)]
    pub fb_adjacency: Option<FeedbackAdjacency>,
    #[serde(default)]
    pub modulation: Option<ModulationConfig>,
    #[serde(default)]
    pub flush: FlushPolicy,
    #[serde(default)]
    pub fb_resolution: FeedbackResolution,
    #[serde(default)]
    pub dynamics: CellDynamics,
}

impl LayerStackConfig {
    pub fn new(in_channels: usize, in_size: (usize, usize), layers: Vec<LayerConfig>) -> Self {
        Self {
            in_size,
            in_channels,
            layers,
            fb_adjacency: None,
            modulation: None,
            flush: FlushPolicy::default(),
            fb_resolution: FeedbackResolution::default(),
            dynamics: CellDynamics::default(),
        }
    }

    pub fn with_feedback(mut self, adjacency: FeedbackAdjacency) -> Self {
        self.fb_adjacency = Some(adjacency);
        self
    }

    pub fn with_modulation(mut self, modulation: ModulationConfig) -> Self {
        self.modulation = Some(modulation);
        self
    }

    pub fn with_flush(mut self, flush: FlushPolicy) -> Self {
        self.flush = flush;
        self
    }

    pub fn with_fb_resolution(mut self, resolution: FeedbackResolution) -> Self {
        self.fb_resolution = resolution;
        self
    }

    pub fn with_dynamics(mut self, dynamics: CellDynamics) -> Self {
        self.dynamics = dynamics;
        self
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// The feedback graph, empty when none is configured
    pub fn adjacency(&self) -> FeedbackAdjacency {
        self.fb_adjacency
            .clone()
            .unwrap_or_else(|| FeedbackAdjacency::none(self.layers.len()))
    }

    /// Checks the parts of the layout that need no tensors.
    pub fn validate(&self) -> Result<()> {
        if self.layers.is_empty() {
            return Err(BioplnnError::config("A layer stack needs at least one layer"));
        }
        self.dynamics.validate()?;
        for (i, layer) in self.layers.iter().enumerate() {
            layer.validate(i)?;
        }

        let adjacency = self.adjacency();
        if adjacency.num_layers() != self.layers.len() {
            return Err(BioplnnError::config(format!(
                "Feedback adjacency covers {} layers, stack has {}",
                adjacency.num_layers(),
                self.layers.len()
            )));
        }
        if self.fb_resolution == FeedbackResolution::SameStep && !adjacency.follows_layer_order() {
            return Err(BioplnnError::config(
                "Same-step feedback requires every feedback edge to go from a lower to a higher layer",
            ));
        }

        if let Some(modulation) = &self.modulation {
            let layer = self.layers.get(modulation.layer).ok_or_else(|| {
                BioplnnError::config(format!(
                    "Modulation targets layer {}, stack has {}",
                    modulation.layer,
                    self.layers.len()
                ))
            })?;
            if let ModulationScope::Interneuron(k) = modulation.scope {
                if k >= layer.interneurons.len() {
                    return Err(BioplnnError::config(format!(
                        "Modulation targets interneuron population {} of layer {}, which has {}",
                        k,
                        modulation.layer,
                        layer.interneurons.len()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Builds the stack; every layout error surfaces here.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<LayerStack<B>> {
        self.validate()?;
        let adjacency = self.adjacency();

        let mut layers: Vec<EIConvCell<B>> = Vec::with_capacity(self.layers.len());
        let mut channels = self.in_channels;
        let mut size = self.in_size;
        for (i, config) in self.layers.iter().enumerate() {
            let cell = EIConvCell::new(
                i,
                config,
                channels,
                size,
                adjacency.receives_feedback(i),
                self.dynamics,
                device,
            )?;
            channels = config.pyr_channels;
            size = cell.geometry().out_size();
            debug!(
                layer = i,
                in_size = ?cell.geometry().in_size,
                out_size = ?size,
                pyr_channels = config.pyr_channels,
                "built layer"
            );
            layers.push(cell);
        }

        let feedback = adjacency
            .edges()
            .into_iter()
            .map(|(src, dst)| FeedbackProjection {
                conv: same_conv(
                    layers[src].geometry().pyr_channels,
                    layers[dst].geometry().fb_channels,
                    self.layers[dst].fb_kernel_size,
                    device,
                ),
                src,
                dst,
            })
            .collect::<Vec<_>>();

        let modulation = match &self.modulation {
            Some(config) => {
                let geometry = layers[config.layer].geometry();
                let channels = match config.scope {
                    ModulationScope::Interneuron(k) => geometry.inter_channels[k],
                    _ => geometry.pyr_channels,
                };
                Some(config.init(channels, device)?)
            }
            None => None,
        };

        info!(
            num_layers = layers.len(),
            feedback_edges = feedback.len(),
            modulated = modulation.is_some(),
            resolution = ?self.fb_resolution,
            "initialized layer stack"
        );

        Ok(LayerStack {
            layers,
            feedback,
            modulation,
            adjacency: Ignored(adjacency),
            flush: Ignored(self.flush),
            resolution: Ignored(self.fb_resolution),
        })
    }
}

/// Per-layer buffers of a stack.
#[derive(Debug, Clone)]
pub struct StackState<B: Backend> {
    pub pyr: Vec<Tensor<B, 4>>,
    pub inter: Vec<Vec<Tensor<B, 4>>>,
    /// Pooled layer outputs
    pub out: Vec<Tensor<B, 4>>,
    /// Feedback drive of each layer; `None` for layers without feedback
    pub fb: Vec<Option<Tensor<B, 4>>>,
}

impl<B: Backend> StackState<B> {
    pub fn num_layers(&self) -> usize {
        self.pyr.len()
    }

    pub fn batch_size(&self) -> usize {
        self.pyr.first().map(|p| p.dims()[0]).unwrap_or(0)
    }

    /// Output of the last layer
    pub fn last_output(&self) -> Option<&Tensor<B, 4>> {
        self.out.last()
    }
}

/// Convolution carrying the output of `src` back into `dst`.
#[derive(Module, Debug)]
pub struct FeedbackProjection<B: Backend> {
    conv: Conv2d<B>,
    src: usize,
    dst: usize,
}

/// Layers updated in ascending order each timestep, plus the feedback
/// projections between them and an optional modulation gate.
#[derive(Module, Debug)]
pub struct LayerStack<B: Backend> {
    layers: Vec<EIConvCell<B>>,
    feedback: Vec<FeedbackProjection<B>>,
    modulation: Option<ModulationGate<B>>,
    adjacency: Ignored<FeedbackAdjacency>,
    flush: Ignored<FlushPolicy>,
    resolution: Ignored<FeedbackResolution>,
}

impl<B: Backend> LayerStack<B> {
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, index: usize) -> Option<&EIConvCell<B>> {
        self.layers.get(index)
    }

    pub fn adjacency(&self) -> &FeedbackAdjacency {
        &self.adjacency.0
    }

    pub fn flush_policy(&self) -> FlushPolicy {
        self.flush.0
    }

    pub fn fb_resolution(&self) -> FeedbackResolution {
        self.resolution.0
    }

    pub fn is_modulated(&self) -> bool {
        self.modulation.is_some()
    }

    pub fn modulation(&self) -> Option<&ModulationGate<B>> {
        self.modulation.as_ref()
    }

    /// `[channels, h, w]` expected of each input frame
    pub fn input_dims(&self) -> [usize; 3] {
        let geometry = self.layers[0].geometry();
        [geometry.in_channels, geometry.in_size.0, geometry.in_size.1]
    }

    /// `[channels, h, w]` of the last layer's output
    pub fn output_dims(&self) -> [usize; 3] {
        let geometry = self.layers[self.layers.len() - 1].geometry();
        let (h, w) = geometry.out_size();
        [geometry.pyr_channels, h, w]
    }

    /// Zeroed buffers for a batch.
    pub fn init_state(&self, batch_size: usize, device: &B::Device) -> StackState<B> {
        let mut state = StackState {
            pyr: Vec::with_capacity(self.layers.len()),
            inter: Vec::with_capacity(self.layers.len()),
            out: Vec::with_capacity(self.layers.len()),
            fb: Vec::with_capacity(self.layers.len()),
        };
        for layer in &self.layers {
            let geometry = layer.geometry();
            let (h, w) = geometry.in_size;
            let (out_h, out_w) = geometry.out_size();
            let EIState { pyr, inter } = layer.init_state(batch_size, device);
            state.pyr.push(pyr);
            state.inter.push(inter);
            state
                .out
                .push(Tensor::zeros([batch_size, geometry.pyr_channels, out_h, out_w], device));
            state.fb.push(
                geometry
                    .receives_feedback()
                    .then(|| Tensor::zeros([batch_size, geometry.fb_channels, h, w], device)),
            );
        }
        state
    }

    /// Applies the flush policy to a carried state.
    ///
    /// Flushed groups are zeroed; the others are taken from `carried`, which
    /// must match the stack layout and `batch_size`.
    pub fn prepare_state(
        &self,
        carried: Option<StackState<B>>,
        batch_size: usize,
        device: &B::Device,
    ) -> Result<StackState<B>> {
        let fresh = self.init_state(batch_size, device);
        let Some(carried) = carried else {
            return Ok(fresh);
        };
        check_layout(&fresh, &carried)?;

        let flush = self.flush.0;
        let StackState { pyr, inter, out, fb } = fresh;
        let (pyr, inter) = if flush.hidden {
            (pyr, inter)
        } else {
            (carried.pyr, carried.inter)
        };
        Ok(StackState {
            pyr,
            inter,
            out: if flush.out { out } else { carried.out },
            fb: if flush.fb { fb } else { carried.fb },
        })
    }

    /// Summed feedback drive into `dst` built from the given layer outputs.
    ///
    /// Each source output is bilinearly resampled to the input resolution of
    /// `dst` before its projection. Returns `None` when `dst` receives no
    /// feedback.
    pub fn feedback_into(&self, dst: usize, outs: &[Tensor<B, 4>]) -> Result<Option<Tensor<B, 4>>> {
        let layer = self
            .layers
            .get(dst)
            .ok_or_else(|| BioplnnError::out_of_range("feedback destination", dst, self.layers.len()))?;
        if outs.len() != self.layers.len() {
            return Err(BioplnnError::shape(
                "layer outputs",
                &[self.layers.len()],
                &[outs.len()],
            ));
        }
        let (h, w) = layer.geometry().in_size;

        let mut total: Option<Tensor<B, 4>> = None;
        for projection in self.feedback.iter().filter(|p| p.dst == dst) {
            let source = outs[projection.src].clone();
            let [_, _, source_h, source_w] = source.dims();
            let resampled = if (source_h, source_w) == (h, w) {
                source
            } else {
                interpolate(
                    source,
                    [h, w],
                    InterpolateOptions::new(InterpolateMode::Bilinear),
                )
            };
            let drive = projection.conv.forward(resampled);
            total = Some(match total {
                Some(acc) => acc + drive,
                None => drive,
            });
        }
        Ok(total)
    }

    /// Advances every layer by one timestep.
    ///
    /// # Arguments
    ///
    /// * `timestep` - Index of the step within the current invocation
    /// * `input` - Feedforward input of the first layer `[batch, c, h, w]`
    /// * `cue` - Modulation cue, required when the stack is modulated
    /// * `state` - Buffers from the previous step
    pub fn step(
        &self,
        timestep: usize,
        input: Tensor<B, 4>,
        cue: Option<&Tensor<B, 2>>,
        state: StackState<B>,
    ) -> Result<StackState<B>> {
        let gate = match (&self.modulation, cue) {
            (Some(gate), Some(cue)) => Some((gate, cue)),
            (Some(_), None) => return Err(BioplnnError::MissingCue),
            (None, _) => None,
        };
        if state.num_layers() != self.layers.len() {
            return Err(BioplnnError::shape(
                "stack state layers",
                &[self.layers.len()],
                &[state.num_layers()],
            ));
        }

        let StackState {
            mut pyr,
            mut inter,
            mut out,
            mut fb,
        } = state;

        for (i, layer) in self.layers.iter().enumerate() {
            let ff = if i == 0 {
                input.clone()
            } else {
                out[i - 1].clone()
            };
            let fb_in = match self.resolution.0 {
                FeedbackResolution::Stale => fb[i].clone(),
                FeedbackResolution::SameStep => {
                    let drive = self.feedback_into(i, &out)?;
                    fb[i] = drive.clone();
                    drive
                }
            };

            let previous = EIState {
                pyr: pyr[i].clone(),
                inter: inter[i].clone(),
            };
            let mut next = layer.step(ff, fb_in, previous)?;

            let layer_gate = gate.filter(|(g, _)| g.layer() == i);
            if let Some((gate, cue)) = layer_gate {
                match gate.scope() {
                    ModulationScope::Pyramidal => {
                        next.pyr = gate.apply(next.pyr, cue, timestep)?;
                    }
                    ModulationScope::Interneuron(k) => {
                        let population = next.inter[k].clone();
                        next.inter[k] = gate.apply(population, cue, timestep)?;
                    }
                    _ => {}
                }
            }

            let mut output = layer.output(next.pyr.clone());
            if let Some((gate, cue)) = layer_gate {
                if gate.scope().targets_output() {
                    output = gate.apply(output, cue, timestep)?;
                }
            }

            pyr[i] = next.pyr;
            inter[i] = next.inter;
            out[i] = output;
        }

        if self.resolution.0 == FeedbackResolution::Stale {
            for i in 0..self.layers.len() {
                fb[i] = self.feedback_into(i, &out)?;
            }
        }

        trace!(timestep, "stack step");
        Ok(StackState { pyr, inter, out, fb })
    }

    /// Unrolls the stack for `num_steps` steps.
    ///
    /// `inputs` holds either a single frame presented at every step or one
    /// frame per step. Returns the last layer's output at every step and the
    /// final buffers.
    pub fn forward(
        &self,
        inputs: &[Tensor<B, 4>],
        cue: Option<&Tensor<B, 2>>,
        state: Option<StackState<B>>,
        num_steps: usize,
    ) -> Result<(Vec<Tensor<B, 4>>, StackState<B>)> {
        if num_steps == 0 {
            return Err(BioplnnError::config("num_steps must be at least 1"));
        }
        if inputs.len() != 1 && inputs.len() != num_steps {
            return Err(BioplnnError::shape(
                "stack input frames",
                &[num_steps],
                &[inputs.len()],
            ));
        }
        if self.modulation.is_some() && cue.is_none() {
            return Err(BioplnnError::MissingCue);
        }

        let [channels, h, w] = self.input_dims();
        let batch = inputs[0].dims()[0];
        for frame in inputs {
            check_dims("stack input frame", [batch, channels, h, w], frame.dims())?;
        }

        let device = inputs[0].device();
        let mut state = self.prepare_state(state, batch, &device)?;
        let mut outputs = Vec::with_capacity(num_steps);

        for t in 0..num_steps {
            let frame = if inputs.len() == 1 {
                inputs[0].clone()
            } else {
                inputs[t].clone()
            };
            state = self.step(t, frame, cue, state)?;
            if let Some(last) = state.last_output() {
                outputs.push(last.clone());
            }
        }

        debug!(batch, num_steps, num_layers = self.layers.len(), "stack forward");
        Ok((outputs, state))
    }
}

fn check_layout<B: Backend>(expected: &StackState<B>, actual: &StackState<B>) -> Result<()> {
    if actual.num_layers() != expected.num_layers()
        || actual.fb.len() != expected.fb.len()
        || actual.out.len() != expected.out.len()
    {
        return Err(BioplnnError::shape(
            "carried stack state layers",
            &[expected.num_layers()],
            &[actual.num_layers()],
        ));
    }

    for i in 0..expected.num_layers() {
        check_dims("carried pyramidal state", expected.pyr[i].dims(), actual.pyr[i].dims())?;
        check_dims("carried layer output", expected.out[i].dims(), actual.out[i].dims())?;
        if expected.inter[i].len() != actual.inter[i].len() {
            return Err(BioplnnError::shape(
                "carried interneuron populations",
                &[expected.inter[i].len()],
                &[actual.inter[i].len()],
            ));
        }
        for (e, a) in expected.inter[i].iter().zip(&actual.inter[i]) {
            check_dims("carried interneuron state", e.dims(), a.dims())?;
        }
        match (&expected.fb[i], &actual.fb[i]) {
            (Some(e), Some(a)) => check_dims("carried feedback buffer", e.dims(), a.dims())?,
            (None, None) => {}
            (Some(e), None) => return Err(BioplnnError::shape("carried feedback buffer", &e.dims(), &[])),
            (None, Some(a)) => return Err(BioplnnError::shape("carried feedback buffer", &[], &a.dims())),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cells::InterneuronConfig;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn two_layer_config() -> LayerStackConfig {
        LayerStackConfig::new(
            1,
            (8, 8),
            vec![
                LayerConfig::new(4, vec![InterneuronConfig::new(2, 3)])
                    .with_feedback(3, 3)
                    .with_pool_stride(2),
                LayerConfig::new(6, vec![InterneuronConfig::new(2, 3)]),
            ],
        )
        .with_feedback(FeedbackAdjacency::new(vec![vec![0, 0], vec![1, 0]]).unwrap())
    }

    #[test]
    fn test_stack_dims() {
        let device = Default::default();
        let stack = two_layer_config().init::<TestBackend>(&device).unwrap();

        assert_eq!(stack.num_layers(), 2);
        assert_eq!(stack.input_dims(), [1, 8, 8]);
        assert_eq!(stack.output_dims(), [6, 4, 4]);

        let state = stack.init_state(2, &device);
        assert_eq!(state.fb[0].as_ref().map(|t| t.dims()), Some([2, 3, 8, 8]));
        assert!(state.fb[1].is_none());
    }

    #[test]
    fn test_feedback_upsampled_to_destination() {
        let device = Default::default();
        let stack = two_layer_config().init::<TestBackend>(&device).unwrap();
        let state = stack.init_state(1, &device);

        let fb = stack.feedback_into(0, &state.out).unwrap().unwrap();
        assert_eq!(fb.dims(), [1, 3, 8, 8]);
        assert!(stack.feedback_into(1, &state.out).unwrap().is_none());
    }

    #[test]
    fn test_same_step_requires_layer_order() {
        let config = two_layer_config().with_fb_resolution(FeedbackResolution::SameStep);
        assert!(matches!(config.validate(), Err(BioplnnError::Configuration(_))));
    }

    #[test]
    fn test_missing_cue() {
        let device = Default::default();
        let stack = two_layer_config()
            .with_modulation(ModulationConfig::new(1))
            .init::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::<TestBackend, 4>::ones([1, 1, 8, 8], &device);

        let err = stack.forward(&[x], None, None, 2).unwrap_err();
        assert!(matches!(err, BioplnnError::MissingCue));
    }

    #[test]
    fn test_modulation_layer_checked() {
        let config = two_layer_config().with_modulation(ModulationConfig::new(2));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_carried_batch_mismatch() {
        let device = Default::default();
        let stack = two_layer_config()
            .with_flush(FlushPolicy::streaming())
            .init::<TestBackend>(&device)
            .unwrap();
        let carried = stack.init_state(3, &device);
        let x = Tensor::<TestBackend, 4>::ones([2, 1, 8, 8], &device);

        let err = stack.forward(&[x], None, Some(carried), 1).unwrap_err();
        assert!(matches!(err, BioplnnError::ShapeMismatch { .. }));
    }
}
