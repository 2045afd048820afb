//! FCN-8s command line tools
//!
//! ## Available binaries
//!
//! - `train`: Train on `data_road/training`, then write test-set overlays
//! - `inference`: Write test-set overlays for a saved model
//!
//! ## Usage
//!
//! ```bash
//! # Train with the default configuration
//! cargo run --release --bin train
//!
//! # Train on a GPU with a configuration file
//! cargo run --release --bin train --no-default-features --features wgpu,pretrained -- --config train.json
//!
//! # Segment the test split with a trained model
//! cargo run --release --bin inference -- --model runs/fcn.mpk
//! ```

pub mod backend;
pub mod logging;

pub use backend::{create_device, BackendKind, SelectedBackend, SelectedDevice, BACKEND};
pub use logging::init_logging;
