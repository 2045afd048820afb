//! Segment the KITTI road test split with a trained FCN-8s model.
//!
//! ## Usage
//!
//! ```bash
//! # Use the configuration saved next to a training run
//! cargo run --release --bin inference -- --model fcn.mpk --config runs/1700000000/config.json
//!
//! # Segment another directory laid out as `<dir>/image_2/*.png`
//! cargo run --release --bin inference -- --model fcn.mpk --test-dir /datasets/kitti/data_road/testing
//! ```

use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use fcn::{load_model, save_inference_samples, TrainingConfig};
use fcn_demos::{create_device, init_logging, SelectedBackend, BACKEND};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Trained model record (`.mpk`)
    #[arg(short, long)]
    model: PathBuf,

    /// Training configuration the model was built with (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding `image_2/` (defaults to `<data_dir>/data_road/testing`)
    #[arg(long)]
    test_dir: Option<PathBuf>,

    /// Override the directory receiving inference samples
    #[arg(long)]
    runs_dir: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    let mut config = if let Some(config_path) = &args.config {
        let config_str = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
        serde_json::from_str::<TrainingConfig>(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?
    } else {
        TrainingConfig::new()
    };
    if let Some(runs_dir) = args.runs_dir {
        config.runs_dir = runs_dir;
    }
    config.validate().context("Invalid configuration")?;

    let device = create_device();
    tracing::info!(backend = BACKEND.name(), "device ready");

    let model = load_model::<SelectedBackend>(&config.model, &args.model, &device)
        .with_context(|| format!("Failed to load model: {}", args.model.display()))?;

    let test_dir = args.test_dir.unwrap_or_else(|| config.testing_dir());
    let output_dir = save_inference_samples(
        config.runs_dir(),
        &test_dir,
        &model,
        config.image_shape,
        config.normalization,
        &device,
    )
    .context("Failed to save inference samples")?;

    tracing::info!(dir = %output_dir.display(), "inference completed");
    Ok(())
}
