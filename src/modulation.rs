//! # Modulation Gate
//!
//! Gates one population of one layer by an external per-sample cue, e.g. a
//! top-down attention signal.
//!
//! | Setting | Choices |
//! |---------|---------|
//! | [`ModulationSteps`] | first step only, every step, one specific step |
//! | [`ModulationOp`] | multiply, add, replace |
//! | [`ModulationKind`] | cue used directly, or linearly projected |
//! | [`ModulationScope`] | layer output, pyramidal, one interneuron population, a channel range of the output |
//!
//! Outside its active steps the gate returns its input untouched.

use burn::module::{Ignored, Module};
use burn::nn::{Linear, LinearConfig};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::activation::Activation;
use crate::error::{BioplnnError, Result};

/// Timesteps at which the gate is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModulationSteps {
    /// Only timestep 0
    #[default]
    First,
    All,
    At(usize),
}

impl ModulationSteps {
    pub fn is_active(&self, timestep: usize) -> bool {
        match self {
            ModulationSteps::First => timestep == 0,
            ModulationSteps::All => true,
            ModulationSteps::At(t) => timestep == *t,
        }
    }

    /// Rejects a step that an unroll of `num_steps` never reaches.
    pub fn validate(&self, num_steps: usize) -> Result<()> {
        if let ModulationSteps::At(t) = self {
            if *t >= num_steps {
                return Err(BioplnnError::config(format!(
                    "Modulation step {} is never reached in {} steps",
                    t, num_steps
                )));
            }
        }
        Ok(())
    }
}

/// How the activated cue is combined with the gated slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModulationOp {
    #[default]
    Multiply,
    Add,
    Replace,
}

/// Where the cue comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModulationKind {
    /// Cue of width 1 or the gated channel count
    #[default]
    Direct,
    /// Learned linear map from `cue_dim` to the gated channel count
    Projected { cue_dim: usize },
}

/// Which tensor of the target layer is gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModulationScope {
    #[default]
    LayerOutput,
    Pyramidal,
    Interneuron(usize),
    /// Channels `start..end` of the layer output
    Channels { start: usize, end: usize },
}

impl ModulationScope {
    /// True for scopes applied after pooling.
    pub fn targets_output(&self) -> bool {
        matches!(
            self,
            ModulationScope::LayerOutput | ModulationScope::Channels { .. }
        )
    }
}

/// Configuration for a [`ModulationGate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModulationConfig {
    /// Index of the gated layer
    pub layer: usize,
    #[serde(default)]
    pub kind: ModulationKind,
    #[serde(default)]
    pub op: ModulationOp,
    #[serde(default)]
    pub activation: Activation,
    #[serde(default)]
    pub scope: ModulationScope,
    #[serde(default)]
    pub steps: ModulationSteps,
}

impl ModulationConfig {
    pub fn new(layer: usize) -> Self {
        Self {
            layer,
            kind: ModulationKind::default(),
            op: ModulationOp::default(),
            activation: Activation::default(),
            scope: ModulationScope::default(),
            steps: ModulationSteps::default(),
        }
    }

    pub fn with_kind(mut self, kind: ModulationKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_op(mut self, op: ModulationOp) -> Self {
        self.op = op;
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_scope(mut self, scope: ModulationScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_steps(mut self, steps: ModulationSteps) -> Self {
        self.steps = steps;
        self
    }

    /// Builds the gate for a scoped tensor with `channels` channels.
    pub fn init<B: Backend>(&self, channels: usize, device: &B::Device) -> Result<ModulationGate<B>> {
        ModulationGate::new(self.clone(), channels, device)
    }
}

/// Cue-driven gate over a channel range of a `[batch, channels, h, w]` tensor.
#[derive(Module, Debug)]
pub struct ModulationGate<B: Backend> {
    projection: Option<Linear<B>>,
    config: Ignored<ModulationConfig>,
    channels: usize,
    start: usize,
    end: usize,
}

impl<B: Backend> ModulationGate<B> {
    /// # Errors
    ///
    /// Returns a configuration error for an empty or out-of-range channel
    /// slice or a zero-width projected cue.
    pub fn new(config: ModulationConfig, channels: usize, device: &B::Device) -> Result<Self> {
        let (start, end) = match config.scope {
            ModulationScope::Channels { start, end } => (start, end),
            _ => (0, channels),
        };
        if start >= end || end > channels {
            return Err(BioplnnError::config(format!(
                "Modulation channel range {}..{} must be non-empty and within {} channels",
                start, end, channels
            )));
        }

        let projection = match config.kind {
            ModulationKind::Direct => None,
            ModulationKind::Projected { cue_dim } => {
                if cue_dim == 0 {
                    return Err(BioplnnError::config("Projected modulation cue_dim must be positive"));
                }
                Some(LinearConfig::new(cue_dim, end - start).init(device))
            }
        };

        Ok(Self {
            projection,
            config: Ignored(config),
            channels,
            start,
            end,
        })
    }

    pub fn config(&self) -> &ModulationConfig {
        &self.config.0
    }

    pub fn layer(&self) -> usize {
        self.config.0.layer
    }

    pub fn scope(&self) -> ModulationScope {
        self.config.0.scope
    }

    pub fn is_active(&self, timestep: usize) -> bool {
        self.config.0.steps.is_active(timestep)
    }

    /// Gates `signal: [batch, channels, h, w]` by `cue: [batch, cue_width]`.
    ///
    /// Returns `signal` itself when `timestep` is outside the active set.
    pub fn apply(&self, signal: Tensor<B, 4>, cue: &Tensor<B, 2>, timestep: usize) -> Result<Tensor<B, 4>> {
        if !self.is_active(timestep) {
            return Ok(signal);
        }

        let [batch, channels, h, w] = signal.dims();
        if channels != self.channels {
            return Err(BioplnnError::shape(
                "modulated signal",
                &[batch, self.channels, h, w],
                &[batch, channels, h, w],
            ));
        }

        let width = self.end - self.start;
        let [cue_batch, cue_width] = cue.dims();
        let projected = match &self.projection {
            Some(linear) => {
                let expected = match self.config.0.kind {
                    ModulationKind::Projected { cue_dim } => cue_dim,
                    ModulationKind::Direct => width,
                };
                if cue_batch != batch || cue_width != expected {
                    return Err(BioplnnError::shape("modulation cue", &[batch, expected], &[cue_batch, cue_width]));
                }
                linear.forward(cue.clone())
            }
            None => {
                if cue_batch != batch || (cue_width != 1 && cue_width != width) {
                    return Err(BioplnnError::shape("modulation cue", &[batch, width], &[cue_batch, cue_width]));
                }
                cue.clone()
            }
        };

        let gate_width = projected.dims()[1];
        let gate = self
            .config
            .0
            .activation
            .forward(projected)
            .reshape([batch, gate_width, 1, 1]);

        let full = self.start == 0 && self.end == channels;
        let range = [0..batch, self.start..self.end, 0..h, 0..w];
        let slice = if full {
            signal.clone()
        } else {
            signal.clone().slice(range.clone())
        };

        let combined = match self.config.0.op {
            ModulationOp::Multiply => slice * gate,
            ModulationOp::Add => slice + gate,
            ModulationOp::Replace => slice.zeros_like() + gate,
        };

        if full {
            Ok(combined)
        } else {
            Ok(signal.slice_assign(range, combined))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_steps() {
        assert!(ModulationSteps::First.is_active(0));
        assert!(!ModulationSteps::First.is_active(1));
        assert!(ModulationSteps::All.is_active(7));
        assert!(ModulationSteps::At(2).is_active(2));
        assert!(!ModulationSteps::At(2).is_active(0));
    }

    #[test]
    fn test_step_within_unroll() {
        assert!(ModulationSteps::At(2).validate(3).is_ok());
        assert!(matches!(
            ModulationSteps::At(3).validate(3),
            Err(BioplnnError::Configuration(_))
        ));
        assert!(ModulationSteps::All.validate(1).is_ok());
        assert!(ModulationSteps::First.validate(1).is_ok());
    }

    #[test]
    fn test_multiply_scalar_cue() {
        let device = Default::default();
        let gate = ModulationConfig::new(0)
            .with_activation(Activation::Identity)
            .init::<TestBackend>(2, &device)
            .unwrap();
        let signal = Tensor::<TestBackend, 4>::ones([1, 2, 2, 2], &device);
        let cue = Tensor::<TestBackend, 2>::from_floats([[3.0]], &device);

        let out = gate.apply(signal, &cue, 0).unwrap();
        assert_eq!(out.sum().into_scalar(), 24.0);
    }

    #[test]
    fn test_channel_slice_only() {
        let device = Default::default();
        let gate = ModulationConfig::new(0)
            .with_op(ModulationOp::Replace)
            .with_scope(ModulationScope::Channels { start: 1, end: 2 })
            .with_steps(ModulationSteps::All)
            .init::<TestBackend>(3, &device)
            .unwrap();
        let signal = Tensor::<TestBackend, 4>::ones([1, 3, 1, 1], &device);
        let cue = Tensor::<TestBackend, 2>::from_floats([[5.0]], &device);

        let out = gate.apply(signal, &cue, 4).unwrap();
        assert_eq!(out.into_data().to_vec::<f32>().unwrap(), vec![1.0, 5.0, 1.0]);
    }

    #[test]
    fn test_rejects_bad_range() {
        let device: <TestBackend as Backend>::Device = Default::default();
        let config = ModulationConfig::new(0).with_scope(ModulationScope::Channels { start: 2, end: 5 });
        assert!(config.init::<TestBackend>(4, &device).is_err());
        let config = ModulationConfig::new(0).with_scope(ModulationScope::Channels { start: 2, end: 2 });
        assert!(config.init::<TestBackend>(4, &device).is_err());
    }

    #[test]
    fn test_cue_width_checked() {
        let device = Default::default();
        let gate = ModulationConfig::new(0).init::<TestBackend>(4, &device).unwrap();
        let signal = Tensor::<TestBackend, 4>::ones([1, 4, 2, 2], &device);
        let cue = Tensor::<TestBackend, 2>::ones([1, 3], &device);

        let err = gate.apply(signal, &cue, 0).unwrap_err();
        assert!(matches!(err, BioplnnError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_projected_cue() {
        let device = Default::default();
        let gate = ModulationConfig::new(0)
            .with_kind(ModulationKind::Projected { cue_dim: 5 })
            .with_op(ModulationOp::Add)
            .init::<TestBackend>(3, &device)
            .unwrap();
        let signal = Tensor::<TestBackend, 4>::zeros([2, 3, 4, 4], &device);
        let cue = Tensor::<TestBackend, 2>::ones([2, 5], &device);

        let out = gate.apply(signal, &cue, 0).unwrap();
        assert_eq!(out.dims(), [2, 3, 4, 4]);
    }
}
