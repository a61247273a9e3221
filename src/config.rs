//! Serializable network configurations.
//!
//! Both configs are plain serde structs that can be written by hand or
//! loaded from JSON, validated once, and turned into modules with `init`.
//!
//! ```ignore
//! let config = EIRnnConfig::load("configs/ei_rnn.json")?;
//! let net = config.init::<Backend>(&device)?;
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cells::{CellDynamics, InterneuronConfig, LayerConfig, TopographicCell};
use crate::connectivity::{ConnectivitySpec, IndexMap};
use crate::error::{BioplnnError, Result};
use crate::readout::{Readout, ReadoutPooling};
use crate::rnn::{Conv2dEIRNN, LayerStackConfig, TopographicRNN};

fn default_true() -> bool {
    true
}

fn default_num_steps() -> usize {
    10
}

fn default_fc_dim() -> usize {
    512
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

fn check_network(num_classes: usize, num_steps: usize, fc_dim: usize, dropout: f64) -> Result<()> {
    if num_classes == 0 {
        return Err(BioplnnError::config("num_classes must be positive"));
    }
    if num_steps == 0 {
        return Err(BioplnnError::config("num_steps must be at least 1"));
    }
    if fc_dim == 0 {
        return Err(BioplnnError::config("fc_dim must be positive"));
    }
    if !(0.0..1.0).contains(&dropout) {
        return Err(BioplnnError::config(format!(
            "Dropout must be in [0, 1), got {}",
            dropout
        )));
    }
    Ok(())
}

/// Configuration of a [`TopographicRNN`] built from artifact files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopographicRnnConfig {
    pub num_classes: usize,
    /// Hidden-to-hidden connectivity artifact
    pub connectivity_hh: PathBuf,
    /// Input-to-hidden connectivity artifact
    pub connectivity_ih: PathBuf,
    #[serde(default)]
    pub input_indices: Option<PathBuf>,
    #[serde(default)]
    pub output_indices: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub batch_first: bool,
    #[serde(default = "default_num_steps")]
    pub num_steps: usize,
    #[serde(default)]
    pub loss_all_timesteps: bool,
    #[serde(default)]
    pub dynamics: CellDynamics,
    #[serde(default = "default_true")]
    pub bias: bool,
    #[serde(default = "default_fc_dim")]
    pub fc_dim: usize,
    #[serde(default)]
    pub dropout: f64,
}

impl TopographicRnnConfig {
    pub fn new(
        num_classes: usize,
        connectivity_hh: impl Into<PathBuf>,
        connectivity_ih: impl Into<PathBuf>,
    ) -> Self {
        Self {
            num_classes,
            connectivity_hh: connectivity_hh.into(),
            connectivity_ih: connectivity_ih.into(),
            input_indices: None,
            output_indices: None,
            batch_first: true,
            num_steps: default_num_steps(),
            loss_all_timesteps: false,
            dynamics: CellDynamics::default(),
            bias: true,
            fc_dim: default_fc_dim(),
            dropout: 0.0,
        }
    }

    pub fn with_indices(mut self, input: Option<PathBuf>, output: Option<PathBuf>) -> Self {
        self.input_indices = input;
        self.output_indices = output;
        self
    }

    pub fn with_num_steps(mut self, num_steps: usize) -> Self {
        self.num_steps = num_steps;
        self
    }

    pub fn with_loss_all_timesteps(mut self, loss_all_timesteps: bool) -> Self {
        self.loss_all_timesteps = loss_all_timesteps;
        self
    }

    pub fn with_batch_first(mut self, batch_first: bool) -> Self {
        self.batch_first = batch_first;
        self
    }

    pub fn with_dynamics(mut self, dynamics: CellDynamics) -> Self {
        self.dynamics = dynamics;
        self
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    pub fn with_fc_dim(mut self, fc_dim: usize) -> Self {
        self.fc_dim = fc_dim;
        self
    }

    pub fn with_dropout(mut self, dropout: f64) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = load_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        check_network(self.num_classes, self.num_steps, self.fc_dim, self.dropout)?;
        self.dynamics.validate()
    }

    /// Loads the artifacts and builds the network.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<TopographicRNN<B>> {
        self.validate()?;
        let hh = ConnectivitySpec::load(&self.connectivity_hh)?;
        let ih = ConnectivitySpec::load(&self.connectivity_ih)?;
        let num_neurons = hh.cols();
        let input_map = self
            .input_indices
            .as_ref()
            .map(|path| IndexMap::load(path, num_neurons))
            .transpose()?;
        let output_map = self
            .output_indices
            .as_ref()
            .map(|path| IndexMap::load(path, num_neurons))
            .transpose()?;
        self.init_with(&hh, &ih, input_map, output_map, device)
    }

    /// Builds the network from in-memory artifacts; the paths are ignored.
    pub fn init_with<B: Backend>(
        &self,
        hh: &ConnectivitySpec,
        ih: &ConnectivitySpec,
        input_map: Option<IndexMap>,
        output_map: Option<IndexMap>,
        device: &B::Device,
    ) -> Result<TopographicRNN<B>> {
        self.validate()?;
        let mut cell = TopographicCell::new(hh, ih, input_map, output_map, self.dynamics, device)?;
        if !self.bias {
            cell = cell.without_bias();
        }
        let readout = Readout::new(
            cell.output_size(),
            self.fc_dim,
            self.num_classes,
            self.dropout,
            device,
        )?;

        info!(
            num_neurons = cell.num_neurons(),
            recurrent_edges = cell.recurrent_edges(),
            input_size = cell.input_size(),
            output_size = cell.output_size(),
            num_steps = self.num_steps,
            "initialized topographic network"
        );

        Ok(TopographicRNN::new(cell, readout, self.num_steps)?
            .with_batch_first(self.batch_first)
            .with_loss_all_timesteps(self.loss_all_timesteps))
    }
}

/// Per-layer parallel lists, the compact way of describing a stack.
///
/// Every list must have one entry per layer; each layer gets a single
/// interneuron population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerLists {
    pub pyr_channels: Vec<usize>,
    pub inter_channels: Vec<usize>,
    pub fb_channels: Vec<usize>,
    pub exc_kernel_sizes: Vec<usize>,
    pub inh_kernel_sizes: Vec<usize>,
    pub fb_kernel_sizes: Vec<usize>,
    pub pool_strides: Vec<usize>,
}

impl LayerLists {
    /// Uniform lists for `num_layers` layers.
    pub fn uniform(num_layers: usize, pyr_channels: usize, inter_channels: usize, kernel_size: usize) -> Self {
        Self {
            pyr_channels: vec![pyr_channels; num_layers],
            inter_channels: vec![inter_channels; num_layers],
            fb_channels: vec![pyr_channels; num_layers],
            exc_kernel_sizes: vec![kernel_size; num_layers],
            inh_kernel_sizes: vec![kernel_size; num_layers],
            fb_kernel_sizes: vec![kernel_size; num_layers],
            pool_strides: vec![1; num_layers],
        }
    }

    pub fn into_layers(self, num_layers: usize) -> Result<Vec<LayerConfig>> {
        let lists = [
            ("pyr_channels", self.pyr_channels.len()),
            ("inter_channels", self.inter_channels.len()),
            ("fb_channels", self.fb_channels.len()),
            ("exc_kernel_sizes", self.exc_kernel_sizes.len()),
            ("inh_kernel_sizes", self.inh_kernel_sizes.len()),
            ("fb_kernel_sizes", self.fb_kernel_sizes.len()),
            ("pool_strides", self.pool_strides.len()),
        ];
        for (name, len) in lists {
            if len != num_layers {
                return Err(BioplnnError::config(format!(
                    "{} has {} entries, expected one per layer ({})",
                    name, len, num_layers
                )));
            }
        }

        Ok((0..num_layers)
            .map(|i| {
                LayerConfig::new(
                    self.pyr_channels[i],
                    vec![InterneuronConfig::new(
                        self.inter_channels[i],
                        self.inh_kernel_sizes[i],
                    )],
                )
                .with_exc_kernel_size(self.exc_kernel_sizes[i])
                .with_feedback(self.fb_channels[i], self.fb_kernel_sizes[i])
                .with_pool_stride(self.pool_strides[i])
            })
            .collect())
    }
}

/// Configuration of a [`Conv2dEIRNN`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EIRnnConfig {
    pub stack: LayerStackConfig,
    pub num_classes: usize,
    #[serde(default = "default_num_steps")]
    pub num_steps: usize,
    #[serde(default)]
    pub loss_all_timesteps: bool,
    #[serde(default = "default_true")]
    pub batch_first: bool,
    #[serde(default = "default_fc_dim")]
    pub fc_dim: usize,
    #[serde(default)]
    pub dropout: f64,
    #[serde(default)]
    pub readout_pooling: ReadoutPooling,
}

impl EIRnnConfig {
    pub fn new(stack: LayerStackConfig, num_classes: usize) -> Self {
        Self {
            stack,
            num_classes,
            num_steps: default_num_steps(),
            loss_all_timesteps: false,
            batch_first: true,
            fc_dim: default_fc_dim(),
            dropout: 0.0,
            readout_pooling: ReadoutPooling::default(),
        }
    }

    /// Builds the layer list from per-layer parallel lists.
    pub fn from_layer_lists(
        in_channels: usize,
        in_size: (usize, usize),
        num_layers: usize,
        lists: LayerLists,
        num_classes: usize,
    ) -> Result<Self> {
        let layers = lists.into_layers(num_layers)?;
        Ok(Self::new(
            LayerStackConfig::new(in_channels, in_size, layers),
            num_classes,
        ))
    }

    pub fn with_num_steps(mut self, num_steps: usize) -> Self {
        self.num_steps = num_steps;
        self
    }

    pub fn with_loss_all_timesteps(mut self, loss_all_timesteps: bool) -> Self {
        self.loss_all_timesteps = loss_all_timesteps;
        self
    }

    pub fn with_batch_first(mut self, batch_first: bool) -> Self {
        self.batch_first = batch_first;
        self
    }

    pub fn with_fc_dim(mut self, fc_dim: usize) -> Self {
        self.fc_dim = fc_dim;
        self
    }

    pub fn with_dropout(mut self, dropout: f64) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_readout_pooling(mut self, pooling: ReadoutPooling) -> Self {
        self.readout_pooling = pooling;
        self
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = load_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        check_network(self.num_classes, self.num_steps, self.fc_dim, self.dropout)?;
        self.stack.validate()?;
        if let Some(modulation) = &self.stack.modulation {
            modulation.steps.validate(self.num_steps)?;
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Conv2dEIRNN<B>> {
        self.validate()?;
        let stack = self.stack.init(device)?;
        let features = self.readout_pooling.features(stack.output_dims());
        let readout = Readout::new(features, self.fc_dim, self.num_classes, self.dropout, device)?;

        info!(
            num_layers = stack.num_layers(),
            readout_features = features,
            num_steps = self.num_steps,
            "initialized layered network"
        );

        Ok(
            Conv2dEIRNN::new(stack, readout, self.readout_pooling, self.num_steps)?
                .with_batch_first(self.batch_first)
                .with_loss_all_timesteps(self.loss_all_timesteps),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_lists_length_checked() {
        let mut lists = LayerLists::uniform(3, 8, 4, 3);
        lists.exc_kernel_sizes.pop();

        let err = EIRnnConfig::from_layer_lists(1, (16, 16), 3, lists, 10).unwrap_err();
        assert!(matches!(err, BioplnnError::Configuration(_)));
    }

    #[test]
    fn test_layer_lists() {
        let lists = LayerLists::uniform(2, 8, 4, 5);
        let config = EIRnnConfig::from_layer_lists(3, (16, 16), 2, lists, 10).unwrap();

        assert_eq!(config.stack.num_layers(), 2);
        assert_eq!(config.stack.layers[1].interneurons[0].kernel_size, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_steps_rejected() {
        let config = TopographicRnnConfig::new(10, "hh.json", "ih.json").with_num_steps(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_defaults() {
        let json = r#"{
            "num_classes": 10,
            "connectivity_hh": "hh.json",
            "connectivity_ih": "ih.json"
        }"#;
        let config: TopographicRnnConfig = serde_json::from_str(json).unwrap();

        assert!(config.batch_first);
        assert!(config.bias);
        assert_eq!(config.num_steps, 10);
        assert_eq!(config.dynamics, CellDynamics::default());
    }
}
