//! Classification head shared by both network paths.

use burn::module::{Ignored, Module};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::activation::Activation;
use crate::error::{BioplnnError, Result};

/// Reduction of a `[batch, c, h, w]` layer output to features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadoutPooling {
    /// Spatial mean per channel, `c` features
    #[default]
    GlobalAverage,
    /// Every unit, `c * h * w` features
    Flatten,
}

impl ReadoutPooling {
    /// Number of features produced from a `[c, h, w]` map
    pub fn features(&self, dims: [usize; 3]) -> usize {
        match self {
            ReadoutPooling::GlobalAverage => dims[0],
            ReadoutPooling::Flatten => dims[0] * dims[1] * dims[2],
        }
    }

    pub fn pool<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        match self {
            ReadoutPooling::GlobalAverage => {
                let [batch, channels, _, _] = x.dims();
                x.flatten::<3>(2, 3).mean_dim(2).reshape([batch, channels])
            }
            ReadoutPooling::Flatten => x.flatten::<2>(1, 3),
        }
    }
}

/// `dropout → Linear(features, fc_dim) → act → dropout → Linear(fc_dim, classes)`
#[derive(Module, Debug)]
pub struct Readout<B: Backend> {
    hidden: Linear<B>,
    out: Linear<B>,
    dropout: Dropout,
    activation: Ignored<Activation>,
}

impl<B: Backend> Readout<B> {
    pub fn new(
        features: usize,
        fc_dim: usize,
        num_classes: usize,
        dropout: f64,
        device: &B::Device,
    ) -> Result<Self> {
        if features == 0 || fc_dim == 0 || num_classes == 0 {
            return Err(BioplnnError::config(format!(
                "Readout sizes must be positive, got features={}, fc_dim={}, num_classes={}",
                features, fc_dim, num_classes
            )));
        }
        if !(0.0..1.0).contains(&dropout) {
            return Err(BioplnnError::config(format!(
                "Dropout must be in [0, 1), got {}",
                dropout
            )));
        }

        Ok(Self {
            hidden: LinearConfig::new(features, fc_dim).init(device),
            out: LinearConfig::new(fc_dim, num_classes).init(device),
            dropout: DropoutConfig::new(dropout).init(),
            activation: Ignored(Activation::Relu),
        })
    }

    pub fn in_features(&self) -> usize {
        self.hidden.weight.val().dims()[0]
    }

    pub fn num_classes(&self) -> usize {
        self.out.weight.val().dims()[1]
    }

    /// `[batch, features]` to `[batch, num_classes]` logits.
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.hidden.forward(self.dropout.forward(x));
        let x = self.activation.0.forward(x);
        self.out.forward(self.dropout.forward(x))
    }
}
