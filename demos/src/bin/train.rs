//! FCN-8s training on KITTI road.
//!
//! Trains on `<data_dir>/data_road/training`, then segments every image of
//! `<data_dir>/data_road/testing` and writes the overlays, the resolved
//! configuration and the loss report to `<runs_dir>/<unix seconds>/`.
//!
//! ## Usage
//!
//! ```bash
//! # Train with the default configuration
//! cargo run --release --bin train
//!
//! # Override a few settings
//! cargo run --release --bin train -- --epochs 5 --batch-size 2 --data-dir /datasets/kitti
//!
//! # Start from a configuration file
//! cargo run --release --bin train -- --config train.json
//! ```

use std::{fs, path::PathBuf};

use anyhow::{ensure, Context, Result};
use burn::{backend::Autodiff, config::Config, module::AutodiffModule, tensor::backend::Backend};
use clap::Parser;
use fcn::{
    adam_trainer,
    dataset::NUM_ROAD_CLASSES,
    load_backbone, preflight, save_inference_samples, save_model, BatchedDataset, RoadDataset,
    SegmentationBatcher, TrainingConfig,
};
use fcn_demos::{create_device, init_logging, SelectedBackend, BACKEND};

type TrainBackend = Autodiff<SelectedBackend>;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override number of epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Override batch size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Override learning rate
    #[arg(long)]
    learning_rate: Option<f64>,

    /// Override the data directory (holding `vgg/` and `data_road/`)
    #[arg(long)]
    data_dir: Option<String>,

    /// Override the directory receiving inference samples
    #[arg(long)]
    runs_dir: Option<String>,

    /// Override the pretrained backbone directory
    #[arg(long)]
    backbone_dir: Option<String>,

    /// Start from a randomly initialized backbone
    #[arg(long)]
    no_pretrained: bool,

    /// Also save the trained model record here
    #[arg(long)]
    model_path: Option<String>,

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

    if let Some(epochs) = args.epochs {
        config.num_epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(learning_rate) = args.learning_rate {
        config.learning_rate = learning_rate;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(runs_dir) = args.runs_dir {
        config.runs_dir = runs_dir;
    }
    if let Some(backbone_dir) = args.backbone_dir {
        config.backbone_dir = Some(backbone_dir);
    }
    if args.no_pretrained {
        config.pretrained_backbone = false;
    }
    if let Some(model_path) = args.model_path {
        config.model_path = Some(model_path);
    }

    ensure!(
        config.model.decoder.num_classes == NUM_ROAD_CLASSES,
        "The road dataset has {NUM_ROAD_CLASSES} classes, config asks for {}",
        config.model.decoder.num_classes
    );
    preflight(&config, BACKEND.is_accelerated()).context("Preflight checks failed")?;

    let device = create_device();
    tracing::info!(backend = BACKEND.name(), "device ready");
    TrainBackend::seed(config.seed);

    let model_config = &config.model;
    let backbone = if config.pretrained_backbone {
        load_backbone::<TrainBackend>(config.backbone_dir(), &model_config.backbone, &device)
            .context("Failed to load the pretrained backbone")?
    } else {
        tracing::warn!("training from a randomly initialized backbone");
        model_config.backbone.init::<TrainBackend>(&device)
    };
    let model = model_config.init_with_backbone(backbone, &device)?;

    let dataset = RoadDataset::load(
        config.training_dir(),
        config.image_shape,
        config.normalization,
    )
    .context("Failed to load the training set")?;
    let source = BatchedDataset::new(dataset, SegmentationBatcher::new(NUM_ROAD_CLASSES));

    let mut trainer = adam_trainer(model, &config.optimizer, config.learning_rate, &device)?;
    let report = trainer
        .fit(&source, config.num_epochs, config.batch_size)
        .context("Training failed")?;
    let model = trainer.into_model();

    if let Some(model_path) = &config.model_path {
        save_model(&model, model_path).context("Failed to save the trained model")?;
    }

    let output_dir = save_inference_samples(
        config.runs_dir(),
        config.testing_dir(),
        &model.valid(),
        config.image_shape,
        config.normalization,
        &device,
    )
    .context("Failed to save inference samples")?;

    config
        .save(output_dir.join("config.json"))
        .context("Failed to save the configuration")?;
    fs::write(
        output_dir.join("report.json"),
        serde_json::to_string_pretty(&report)?,
    )
    .context("Failed to save the training report")?;

    tracing::info!(
        steps = report.total_steps,
        final_loss = ?report.final_loss(),
        dir = %output_dir.display(),
        "training completed"
    );
    Ok(())
}
