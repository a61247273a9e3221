//! # bioplnn - Biologically-Plausible Neural Networks (Rust)
//!
//! Rate-based recurrent neuron models built on the Burn framework.
//!
//! ## Features
//!
//! - **Topographic RNN**: a single neuron sheet wired by arbitrary sparse
//!   connectivity, propagated exactly over its nonzero entries
//! - **EI layers**: convolutional pyramidal/interneuron populations with
//!   excitation and subtractive inhibition
//! - **Layer stacks**: feedforward chains with inter-layer feedback, a
//!   flush policy for streaming use, and an optional modulation gate
//! - **Artifacts**: JSON connectivity and index maps, random topographic
//!   connectivity generation
//!
//! ## Quick Start
//!
//! ```rust
//! use bioplnn::prelude::*;
//!
//! // 8x8 neuron sheet, 6 local synapses per neuron plus a self-synapse
//! let hh = ConnectivitySpec::random_topographic((8, 8), 1.5, 6, true, 42).unwrap();
//!
//! assert_eq!(hh.shape(), (64, 64));
//! assert_eq!(hh.fan_in().len(), 64);
//! ```
//!
//! ## Network-level Usage
//!
//! ```ignore
//! use bioplnn::prelude::*;
//!
//! let config = EIRnnConfig::from_layer_lists(
//!     1, (28, 28), 2, LayerLists::uniform(2, 16, 8, 3), 10,
//! )?;
//! let net = config.init::<Backend>(&device)?;
//! let (logits, state) = net.forward(images, None, None)?;
//! ```

pub mod activation;
pub mod cells;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod modulation;
pub mod readout;
pub mod rnn;

pub use error::{BioplnnError, Result};

pub mod prelude {
    pub use crate::activation::Activation;
    pub use crate::cells::{
        CellDynamics, EIConvCell, EIState, InterneuronConfig, LayerConfig, TopographicCell,
    };
    pub use crate::config::{EIRnnConfig, LayerLists, TopographicRnnConfig};
    pub use crate::connectivity::{ConnectivitySpec, FeedbackAdjacency, IndexMap};
    pub use crate::error::{BioplnnError, Result};
    pub use crate::modulation::{
        ModulationConfig, ModulationGate, ModulationKind, ModulationOp, ModulationScope,
        ModulationSteps,
    };
    pub use crate::readout::{Readout, ReadoutPooling};
    pub use crate::rnn::{
        Conv2dEIRNN, FeedbackResolution, FlushPolicy, LayerStack, LayerStackConfig, NetworkOutput,
        StackState, TopographicRNN,
    };
}
