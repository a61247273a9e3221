//! Nonlinearities for neuron populations and modulation cues
//!
//! Every population update and every modulation gate takes an [`Activation`]
//! selected by name at configuration time. `lecun_tanh` is not part of Burn's
//! standard library and is implemented here.

use std::fmt;
use std::str::FromStr;

use burn::tensor::{activation, backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::BioplnnError;

/// Elementwise nonlinearity applied to pre-activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Rectified linear unit, the default for rate neurons
    #[default]
    Relu,
    Tanh,
    Sigmoid,
    Gelu,
    Silu,
    /// `1.7159 * tanh(0.666 * x)`
    #[serde(rename = "lecun_tanh")]
    LeCunTanh,
    /// Pass-through
    Identity,
}

impl Activation {
    /// Names accepted by [`Activation::from_str`]
    pub const NAMES: [&'static str; 7] = [
        "relu",
        "tanh",
        "sigmoid",
        "gelu",
        "silu",
        "lecun_tanh",
        "identity",
    ];

    /// Applies the nonlinearity element-wise to a tensor of any rank.
    pub fn forward<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Activation::Relu => activation::relu(x),
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => activation::sigmoid(x),
            Activation::Gelu => activation::gelu(x),
            Activation::Silu => activation::silu(x),
            Activation::LeCunTanh => lecun_tanh(x),
            Activation::Identity => x,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Activation::Relu => "relu",
            Activation::Tanh => "tanh",
            Activation::Sigmoid => "sigmoid",
            Activation::Gelu => "gelu",
            Activation::Silu => "silu",
            Activation::LeCunTanh => "lecun_tanh",
            Activation::Identity => "identity",
        }
    }
}

impl FromStr for Activation {
    type Err = BioplnnError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "relu" => Ok(Activation::Relu),
            "tanh" => Ok(Activation::Tanh),
            "sigmoid" => Ok(Activation::Sigmoid),
            "gelu" => Ok(Activation::Gelu),
            "silu" => Ok(Activation::Silu),
            "lecun_tanh" => Ok(Activation::LeCunTanh),
            "identity" => Ok(Activation::Identity),
            other => Err(BioplnnError::config(format!(
                "Unknown activation: {}. Valid options are {:?}",
                other,
                Activation::NAMES
            ))),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `1.7159 * tanh(0.666 * x)`, close to the identity near the origin.
fn lecun_tanh<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.mul_scalar(0.666).tanh().mul_scalar(1.7159)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Tensor;

    type Backend = NdArray<f32>;

    #[test]
    fn test_relu_clamps_negatives() {
        let device = Default::default();
        let x = Tensor::<Backend, 1>::from_floats([-2.0, -0.5, 0.0, 0.5, 2.0], &device);
        let y = Activation::Relu.forward(x).into_data().to_vec::<f32>().unwrap();

        assert_eq!(y, vec![0.0, 0.0, 0.0, 0.5, 2.0]);
    }

    #[test]
    fn test_default_is_relu() {
        assert_eq!(Activation::default(), Activation::Relu);
    }

    #[test]
    fn test_parse_all_names() {
        for name in Activation::NAMES {
            let act: Activation = name.parse().unwrap();
            assert_eq!(act.name(), name);
        }
    }

    #[test]
    fn test_parse_unknown_name() {
        let err = "softplus".parse::<Activation>().unwrap_err();
        assert!(matches!(err, BioplnnError::Configuration(_)));
    }

    #[test]
    fn test_serde_names_match_parser() {
        let json = serde_json::to_string(&Activation::LeCunTanh).unwrap();
        assert_eq!(json, "\"lecun_tanh\"");
        let back: Activation = serde_json::from_str("\"gelu\"").unwrap();
        assert_eq!(back, Activation::Gelu);
    }

    #[test]
    fn test_lecun_tanh_range() {
        let device = Default::default();

        for &val in &[-10.0f32, -1.0, 0.0, 1.0, 10.0] {
            let x = Tensor::<Backend, 1>::full([1], val, &device);
            let result = Activation::LeCunTanh.forward(x).into_scalar();
            let expected = 1.7159f32 * (0.666f32 * val).tanh();

            assert!(
                (result - expected).abs() < 1e-5,
                "lecun_tanh incorrect at x={}",
                val
            );
        }
    }

    #[test]
    fn test_identity_passes_through() {
        let device = Default::default();
        let x = Tensor::<Backend, 2>::from_floats([[-1.0, 3.0]], &device);
        let y = Activation::Identity.forward(x).into_data().to_vec::<f32>().unwrap();

        assert_eq!(y, vec![-1.0, 3.0]);
    }
}
