use burn::module::{Ignored, Module};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::tensor::backend::Backend;
use burn::tensor::module::avg_pool2d;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

use super::CellDynamics;
use crate::error::{BioplnnError, Result};

fn default_kernel_size() -> usize {
    3
}

fn default_pool_stride() -> usize {
    1
}

/// One interneuron population of a layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterneuronConfig {
    pub channels: usize,
    #[serde(default = "default_kernel_size")]
    pub kernel_size: usize,
    /// Also driven by the layer's feedforward input
    #[serde(default)]
    pub receives_feedforward: bool,
    /// Inhibited by the layer's other interneuron populations
    #[serde(default)]
    pub cross_inhibition: bool,
}

impl InterneuronConfig {
    pub fn new(channels: usize, kernel_size: usize) -> Self {
        Self {
            channels,
            kernel_size,
            receives_feedforward: false,
            cross_inhibition: false,
        }
    }

    pub fn with_feedforward(mut self, receives_feedforward: bool) -> Self {
        self.receives_feedforward = receives_feedforward;
        self
    }

    pub fn with_cross_inhibition(mut self, cross_inhibition: bool) -> Self {
        self.cross_inhibition = cross_inhibition;
        self
    }
}

/// Populations and kernels of one excitatory/inhibitory layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub pyr_channels: usize,
    pub interneurons: Vec<InterneuronConfig>,
    #[serde(default = "default_kernel_size")]
    pub exc_kernel_size: usize,
    /// Channels of the feedback drive; only used when the layer receives feedback
    #[serde(default)]
    pub fb_channels: usize,
    #[serde(default = "default_kernel_size")]
    pub fb_kernel_size: usize,
    #[serde(default = "default_pool_stride")]
    pub pool_stride: usize,
}

impl LayerConfig {
    pub fn new(pyr_channels: usize, interneurons: Vec<InterneuronConfig>) -> Self {
        Self {
            pyr_channels,
            interneurons,
            exc_kernel_size: default_kernel_size(),
            fb_channels: 0,
            fb_kernel_size: default_kernel_size(),
            pool_stride: default_pool_stride(),
        }
    }

    pub fn with_exc_kernel_size(mut self, kernel_size: usize) -> Self {
        self.exc_kernel_size = kernel_size;
        self
    }

    pub fn with_feedback(mut self, fb_channels: usize, fb_kernel_size: usize) -> Self {
        self.fb_channels = fb_channels;
        self.fb_kernel_size = fb_kernel_size;
        self
    }

    pub fn with_pool_stride(mut self, pool_stride: usize) -> Self {
        self.pool_stride = pool_stride;
        self
    }

    /// Checks everything that does not depend on the neighbouring layers.
    pub fn validate(&self, layer: usize) -> Result<()> {
        if self.pyr_channels == 0 {
            return Err(BioplnnError::config(format!(
                "Layer {} needs at least one pyramidal channel",
                layer
            )));
        }
        if self.interneurons.is_empty() {
            return Err(BioplnnError::config(format!(
                "Layer {} needs at least one interneuron population",
                layer
            )));
        }
        check_kernel(layer, "excitatory", self.exc_kernel_size)?;
        check_kernel(layer, "feedback", self.fb_kernel_size)?;
        if self.pool_stride == 0 {
            return Err(BioplnnError::config(format!(
                "Layer {} pool stride must be at least 1",
                layer
            )));
        }
        for (k, inter) in self.interneurons.iter().enumerate() {
            if inter.channels == 0 {
                return Err(BioplnnError::config(format!(
                    "Layer {} interneuron population {} has no channels",
                    layer, k
                )));
            }
            check_kernel(layer, "inhibitory", inter.kernel_size)?;
            if inter.cross_inhibition && self.interneurons.len() < 2 {
                return Err(BioplnnError::config(format!(
                    "Layer {} interneuron population {} requests cross inhibition but is the only population",
                    layer, k
                )));
            }
        }
        Ok(())
    }
}

fn check_kernel(layer: usize, role: &str, kernel_size: usize) -> Result<()> {
    if kernel_size == 0 || kernel_size % 2 == 0 {
        return Err(BioplnnError::config(format!(
            "Layer {} {} kernel size must be odd, got {}",
            layer, role, kernel_size
        )));
    }
    Ok(())
}

/// Same-padded square convolution.
pub(crate) fn same_conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    device: &B::Device,
) -> Conv2d<B> {
    let pad = kernel_size / 2;
    Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
        .with_padding(PaddingConfig2d::Explicit(pad, pad))
        .init(device)
}

/// Resolved tensor geometry of a layer inside a stack.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerGeometry {
    pub in_channels: usize,
    pub in_size: (usize, usize),
    pub pyr_channels: usize,
    pub inter_channels: Vec<usize>,
    /// Zero when the layer receives no feedback
    pub fb_channels: usize,
    pub pool_stride: usize,
}

impl LayerGeometry {
    pub fn receives_feedback(&self) -> bool {
        self.fb_channels > 0
    }

    /// Spatial size of the pooled output
    pub fn out_size(&self) -> (usize, usize) {
        (
            self.in_size.0 / self.pool_stride,
            self.in_size.1 / self.pool_stride,
        )
    }
}

/// Previous-step state of one layer.
#[derive(Debug, Clone)]
pub struct EIState<B: Backend> {
    /// `[batch, pyr_channels, h, w]`
    pub pyr: Tensor<B, 4>,
    /// One `[batch, channels_k, h, w]` tensor per interneuron population
    pub inter: Vec<Tensor<B, 4>>,
}

impl<B: Backend> EIState<B> {
    pub fn batch_size(&self) -> usize {
        self.pyr.dims()[0]
    }
}

/// Convolutions owned by one interneuron population.
#[derive(Module, Debug)]
pub struct InterneuronUnit<B: Backend> {
    /// Pyramidal excitation of the interneurons
    conv_from_pyr: Conv2d<B>,
    /// Interneuron inhibition of the pyramidal cells
    conv_to_pyr: Conv2d<B>,
    conv_from_input: Option<Conv2d<B>>,
    /// Inhibition from the concatenated other populations
    conv_cross: Option<Conv2d<B>>,
}

/// One excitatory/inhibitory convolutional layer.
///
/// A pyramidal population excites itself and every interneuron population;
/// each interneuron population inhibits the pyramidal cells. All updates read
/// the previous state, so the order of populations does not matter.
///
/// ```text
/// pre_pyr = conv_input(cat[ff, fb]) + conv_exc(pyr) - Σ_k conv_to_pyr_k(inter_k)
/// pre_k   = conv_from_pyr_k(pyr) [+ conv_from_input_k(ff)] [- conv_cross_k(cat[inter_j, j != k])]
/// ```
///
/// The layer output is the pyramidal state average-pooled by `pool_stride`.
#[derive(Module, Debug)]
pub struct EIConvCell<B: Backend> {
    conv_input: Conv2d<B>,
    conv_exc: Conv2d<B>,
    interneurons: Vec<InterneuronUnit<B>>,
    geometry: Ignored<LayerGeometry>,
    dynamics: Ignored<CellDynamics>,
}

impl<B: Backend> EIConvCell<B> {
    /// Builds the convolutions of a layer.
    ///
    /// `fb_channels` of the config is only honoured when `receives_feedback`
    /// is set, in which case it must be non-zero.
    pub fn new(
        layer: usize,
        config: &LayerConfig,
        in_channels: usize,
        in_size: (usize, usize),
        receives_feedback: bool,
        dynamics: CellDynamics,
        device: &B::Device,
    ) -> Result<Self> {
        config.validate(layer)?;
        dynamics.validate()?;
        if in_channels == 0 || in_size.0 == 0 || in_size.1 == 0 {
            return Err(BioplnnError::config(format!(
                "Layer {} input must be non-empty, got {} channels at {}x{}",
                layer, in_channels, in_size.0, in_size.1
            )));
        }
        if in_size.0 < config.pool_stride || in_size.1 < config.pool_stride {
            return Err(BioplnnError::config(format!(
                "Layer {} pool stride {} exceeds its input size {}x{}",
                layer, config.pool_stride, in_size.0, in_size.1
            )));
        }

        let fb_channels = if receives_feedback {
            if config.fb_channels == 0 {
                return Err(BioplnnError::config(format!(
                    "Layer {} receives feedback but has fb_channels = 0",
                    layer
                )));
            }
            config.fb_channels
        } else {
            0
        };

        let pyr = config.pyr_channels;
        let inter_channels: Vec<usize> = config.interneurons.iter().map(|i| i.channels).collect();
        let total_inter: usize = inter_channels.iter().sum();

        let interneurons = config
            .interneurons
            .iter()
            .map(|inter| InterneuronUnit {
                conv_from_pyr: same_conv(pyr, inter.channels, inter.kernel_size, device),
                conv_to_pyr: same_conv(inter.channels, pyr, inter.kernel_size, device),
                conv_from_input: inter
                    .receives_feedforward
                    .then(|| same_conv(in_channels, inter.channels, inter.kernel_size, device)),
                conv_cross: inter.cross_inhibition.then(|| {
                    same_conv(
                        total_inter - inter.channels,
                        inter.channels,
                        inter.kernel_size,
                        device,
                    )
                }),
            })
            .collect();

        Ok(Self {
            conv_input: same_conv(in_channels + fb_channels, pyr, config.exc_kernel_size, device),
            conv_exc: same_conv(pyr, pyr, config.exc_kernel_size, device),
            interneurons,
            geometry: Ignored(LayerGeometry {
                in_channels,
                in_size,
                pyr_channels: pyr,
                inter_channels,
                fb_channels,
                pool_stride: config.pool_stride,
            }),
            dynamics: Ignored(dynamics),
        })
    }

    pub fn geometry(&self) -> &LayerGeometry {
        &self.geometry.0
    }

    /// Zero state for a batch.
    pub fn init_state(&self, batch_size: usize, device: &B::Device) -> EIState<B> {
        let (h, w) = self.geometry.0.in_size;
        EIState {
            pyr: Tensor::zeros([batch_size, self.geometry.0.pyr_channels, h, w], device),
            inter: self
                .geometry
                .0
                .inter_channels
                .iter()
                .map(|&c| Tensor::zeros([batch_size, c, h, w], device))
                .collect(),
        }
    }

    /// Advances all populations of the layer by one step.
    ///
    /// # Arguments
    ///
    /// * `ff` - Feedforward drive `[batch, in_channels, h, w]`
    /// * `fb` - Feedback drive `[batch, fb_channels, h, w]`; zeros are used
    ///   when the layer receives feedback and `None` is passed
    /// * `state` - Previous state of the layer
    pub fn step(
        &self,
        ff: Tensor<B, 4>,
        fb: Option<Tensor<B, 4>>,
        state: EIState<B>,
    ) -> Result<EIState<B>> {
        let geometry = &self.geometry.0;
        let (h, w) = geometry.in_size;
        let batch = state.batch_size();

        check_dims(
            "layer feedforward input",
            [batch, geometry.in_channels, h, w],
            ff.dims(),
        )?;
        check_dims(
            "layer pyramidal state",
            [batch, geometry.pyr_channels, h, w],
            state.pyr.dims(),
        )?;
        if state.inter.len() != geometry.inter_channels.len() {
            return Err(BioplnnError::shape(
                "layer interneuron populations",
                &[geometry.inter_channels.len()],
                &[state.inter.len()],
            ));
        }
        for (inter, &channels) in state.inter.iter().zip(&geometry.inter_channels) {
            check_dims("layer interneuron state", [batch, channels, h, w], inter.dims())?;
        }

        let input = if geometry.receives_feedback() {
            let fb = match fb {
                Some(fb) => {
                    check_dims(
                        "layer feedback input",
                        [batch, geometry.fb_channels, h, w],
                        fb.dims(),
                    )?;
                    fb
                }
                None => Tensor::zeros([batch, geometry.fb_channels, h, w], &ff.device()),
            };
            Tensor::cat(vec![ff.clone(), fb], 1)
        } else {
            if let Some(fb) = fb {
                return Err(BioplnnError::shape("layer feedback input", &[], &fb.dims()));
            }
            ff.clone()
        };

        let EIState { pyr, inter } = state;

        let mut pre_pyr = self.conv_input.forward(input) + self.conv_exc.forward(pyr.clone());
        for (unit, inter_k) in self.interneurons.iter().zip(&inter) {
            pre_pyr = pre_pyr - unit.conv_to_pyr.forward(inter_k.clone());
        }

        let mut next_inter = Vec::with_capacity(inter.len());
        for (k, unit) in self.interneurons.iter().enumerate() {
            let mut pre_k = unit.conv_from_pyr.forward(pyr.clone());
            if let Some(conv) = &unit.conv_from_input {
                pre_k = pre_k + conv.forward(ff.clone());
            }
            if let Some(conv) = &unit.conv_cross {
                let others: Vec<Tensor<B, 4>> = inter
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != k)
                    .map(|(_, t)| t.clone())
                    .collect();
                pre_k = pre_k - conv.forward(Tensor::cat(others, 1));
            }
            next_inter.push(self.dynamics.0.update(inter[k].clone(), pre_k));
        }

        Ok(EIState {
            pyr: self.dynamics.0.update(pyr, pre_pyr),
            inter: next_inter,
        })
    }

    /// Layer output from a pyramidal state: `[batch, pyr_channels, h / s, w / s]`.
    pub fn output(&self, pyr: Tensor<B, 4>) -> Tensor<B, 4> {
        let stride = self.geometry.0.pool_stride;
        if stride == 1 {
            pyr
        } else {
            avg_pool2d(pyr, [stride, stride], [stride, stride], [0, 0], true)
        }
    }
}

pub(crate) fn check_dims(context: &str, expected: [usize; 4], actual: [usize; 4]) -> Result<()> {
    if expected != actual {
        return Err(BioplnnError::shape(context, &expected, &actual));
    }
    Ok(())
}
