//! Topographic RNN Example
//!
//! Builds a sparse recurrent sheet with local connectivity, classifies a batch
//! of random "images" and shows how activity spreads over the sheet.

use bioplnn::prelude::*;
use burn::backend::NdArray;
use burn::tensor::{Distribution, Tensor};
use tracing_subscriber::EnvFilter;

type Backend = NdArray<f32>;

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("bioplnn=info".parse()?))
        .init();

    println!("=== Topographic RNN Example ===\n");
    let device = Default::default();

    // 16x16 sheet, 12 local synapses per neuron, plus self-recurrence
    let sheet = (16, 16);
    let num_neurons = sheet.0 * sheet.1;
    let hh = ConnectivitySpec::random_topographic(sheet, 2.0, 12, true, 42)?;
    let ih = ConnectivitySpec::identity(num_neurons, 1.0);

    println!("Connectivity:");
    println!("  Neurons: {}", num_neurons);
    println!("  Recurrent synapses: {}", hh.nnz());
    println!(
        "  Density: {:.2}%",
        100.0 * hh.nnz() as f64 / (num_neurons * num_neurons) as f64
    );
    println!();

    // read out the central 4x4 patch
    let centre: Vec<usize> = (6..10)
        .flat_map(|i| (6..10).map(move |j| i * sheet.1 + j))
        .collect();
    let output_map = IndexMap::new(centre, num_neurons)?;

    let config = TopographicRnnConfig::new(10, "hh.json", "ih.json")
        .with_num_steps(8)
        .with_fc_dim(32)
        .with_dynamics(CellDynamics::new(Activation::Tanh, 0.5)?);
    let net = config.init_with::<Backend>(&hh, &ih, None, Some(output_map), &device)?;

    let images = Tensor::<Backend, 4>::random([4, 3, 16, 16], Distribution::Default, &device);
    let x = TopographicRNN::<Backend>::flatten_image(images);
    let (logits, state) = net.forward_static(x, None)?;

    println!("Static input:");
    println!("  Logits shape: {:?}", logits.dims());
    println!("  Final state shape: {:?}", state.dims());
    println!();

    // a single pulse at the centre, then silence
    let mut pulse = vec![0.0f32; num_neurons];
    pulse[8 * sheet.1 + 8] = 1.0;
    let first = Tensor::<Backend, 1>::from_floats(pulse.as_slice(), &device).reshape([1, 1, num_neurons]);
    let rest = Tensor::<Backend, 3>::zeros([1, 7, num_neurons], &device);
    let seq = Tensor::cat(vec![first, rest], 1);

    let (_, trajectory) = net.forward_trajectory(seq, None)?;
    println!("Pulse propagation (active neurons per step):");
    for (t, state) in trajectory.into_iter().enumerate() {
        let active = state
            .into_data()
            .to_vec::<f32>()
            .map(|v| v.iter().filter(|a| a.abs() > 1e-3).count())
            .unwrap_or(0);
        println!("  t={}: {}", t, active);
    }

    println!("\n=== Example completed ===");
    Ok(())
}
