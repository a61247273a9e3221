//! Save and Load Example
//!
//! Writes connectivity artifacts and a network config to a directory, builds
//! the network from them, stores the trained-parameter record with Burn's
//! recorder and loads it back into a freshly built network.

use std::path::PathBuf;

use bioplnn::prelude::*;
use burn::backend::NdArray;
use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::{Distribution, Tensor};
use tracing_subscriber::EnvFilter;

type Backend = NdArray<f32>;

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("bioplnn=debug".parse()?))
        .init();

    println!("=== Save/Load Example ===\n");
    let device = Default::default();
    let dir: PathBuf = std::env::temp_dir().join("bioplnn_save_load");
    std::fs::create_dir_all(&dir)?;

    // Artifacts
    let hh_path = dir.join("connectivity_hh.json");
    let ih_path = dir.join("connectivity_ih.json");
    let in_path = dir.join("input_indices.json");
    let config_path = dir.join("topographic.json");

    let num_neurons = 100;
    ConnectivitySpec::random_topographic((10, 10), 1.5, 8, true, 7)?.save(&hh_path)?;
    ConnectivitySpec::identity(num_neurons, 1.0).save(&ih_path)?;
    IndexMap::new((0..10).map(|i| i * 10).collect(), num_neurons)?.save(&in_path)?;

    TopographicRnnConfig::new(5, &hh_path, &ih_path)
        .with_indices(Some(in_path), None)
        .with_num_steps(4)
        .with_fc_dim(16)
        .save(&config_path)?;
    println!("Artifacts written to {}", dir.display());

    // Build from disk
    let config = TopographicRnnConfig::load(&config_path)?;
    let net = config.init::<Backend>(&device)?;
    let x = Tensor::<Backend, 2>::random([2, 10], Distribution::Default, &device);
    let (logits, _) = net.forward_static(x.clone(), None)?;
    println!("  Logits shape: {:?}", logits.dims());

    // Parameters
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let model_path = dir.join("topographic_model");
    net.clone()
        .save_file(model_path.clone(), &recorder)
        .map_err(|e| format!("failed to save model: {:?}", e))?;

    let restored = config
        .init::<Backend>(&device)?
        .load_file(model_path, &recorder, &device)
        .map_err(|e| format!("failed to load model: {:?}", e))?;
    let (restored_logits, _) = restored.forward_static(x, None)?;

    let diff = (logits.final_logits() - restored_logits.final_logits())
        .abs()
        .max()
        .into_scalar();
    println!("  Max logit difference after reload: {}", diff);

    println!("\n=== Save/Load Example completed ===");
    Ok(())
}
