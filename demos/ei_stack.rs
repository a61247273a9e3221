//! EI Layer Stack Example
//!
//! A three-layer excitatory/inhibitory network with top-down feedback and a
//! cue-driven gate on the middle layer, run on static images and on a short
//! movie.

use bioplnn::prelude::*;
use burn::backend::NdArray;
use burn::tensor::{Distribution, Tensor};
use tracing_subscriber::EnvFilter;

type Backend = NdArray<f32>;

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("bioplnn=info".parse()?))
        .init();

    println!("=== EI Layer Stack Example ===\n");
    let device = Default::default();

    let layers = vec![
        LayerConfig::new(
            16,
            vec![
                InterneuronConfig::new(8, 5),
                InterneuronConfig::new(4, 3).with_feedforward(true),
            ],
        )
        .with_feedback(8, 3)
        .with_pool_stride(2),
        LayerConfig::new(
            24,
            vec![
                InterneuronConfig::new(8, 3).with_cross_inhibition(true),
                InterneuronConfig::new(8, 3).with_cross_inhibition(true),
            ],
        )
        .with_feedback(8, 3)
        .with_pool_stride(2),
        LayerConfig::new(32, vec![InterneuronConfig::new(16, 3)]),
    ];

    // layers 1 and 2 feed back into layer 0, layer 2 into layer 1
    let adjacency = FeedbackAdjacency::new(vec![vec![0, 0, 0], vec![1, 0, 0], vec![1, 1, 0]])?;

    let stack = LayerStackConfig::new(3, (32, 32), layers)
        .with_feedback(adjacency)
        .with_modulation(
            ModulationConfig::new(1)
                .with_kind(ModulationKind::Projected { cue_dim: 4 })
                .with_op(ModulationOp::Multiply)
                .with_activation(Activation::Sigmoid)
                .with_steps(ModulationSteps::All),
        )
        .with_dynamics(CellDynamics::new(Activation::Relu, 0.7)?);

    let config = EIRnnConfig::new(stack, 10)
        .with_num_steps(6)
        .with_fc_dim(64)
        .with_loss_all_timesteps(true);
    let net = config.init::<Backend>(&device)?;

    println!("Network:");
    println!("  Layers: {}", net.stack().num_layers());
    println!("  Input: {:?}", net.stack().input_dims());
    println!("  Last layer output: {:?}", net.stack().output_dims());
    println!();

    let images = Tensor::<Backend, 4>::random([2, 3, 32, 32], Distribution::Default, &device);
    let cue = Tensor::<Backend, 2>::random([2, 4], Distribution::Default, &device);

    let (logits, state) = net.forward(images, Some(cue.clone()), None)?;
    println!("Static images:");
    println!("  Logits shape (all steps): {:?}", logits.dims());
    for (i, out) in state.out.iter().enumerate() {
        println!("  Layer {} output: {:?}", i, out.dims());
    }
    println!();

    let movie = Tensor::<Backend, 5>::random([2, 6, 3, 32, 32], Distribution::Default, &device);
    let (logits, _) = net.forward_sequence(movie, Some(cue), None)?;
    println!("Movie:");
    println!("  Final logits: {:?}", logits.final_logits().dims());

    println!("\n=== Example completed ===");
    Ok(())
}
