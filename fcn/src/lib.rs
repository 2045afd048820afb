//! # FCN-Burn
//!
//! FCN-8s semantic segmentation for the KITTI road benchmark, built on the Burn
//! deep learning framework.
//!
//! ## Modules
//!
//! - `config`: `TrainingConfig` with every run constant, plus pixel normalization.
//! - `error`: The `FcnError` enum shared by the whole crate.
//! - `models`: The named-output backbone contract, the skip-fusion decoder and
//!   the assembled `Fcn` model.
//! - `loss`: Pixel-wise softmax cross-entropy.
//! - `training`: The Adam trainer and its per-epoch report.
//! - `dataset`: KITTI road loading, batching and the `BatchSource` abstraction.
//! - `inference`: Writing overlaid test-set predictions to a run directory.
//! - `weights`: Backbone weight loading and model record persistence.
//! - `preflight`: Environment checks run before anything is allocated.

pub mod config;
pub mod dataset;
mod error;
pub mod inference;
pub mod loss;
pub mod models;
pub mod preflight;
pub mod shape;
pub mod training;
pub mod weights;

#[doc(inline)]
pub use config::{Normalization, TrainingConfig};
#[doc(inline)]
pub use dataset::{
    BatchSource, BatchedDataset, RoadDataset, SegmentationBatch, SegmentationBatcher,
    SegmentationItem,
};
#[doc(inline)]
pub use error::{FcnError, FcnResult};
#[doc(inline)]
pub use inference::save_inference_samples;
#[doc(inline)]
pub use loss::{PixelCrossEntropy, PixelCrossEntropyConfig, PixelObjective};
#[doc(inline)]
pub use models::{DecoderConfig, Fcn, FcnConfig, FcnRecord, FeatureBackbone, SkipFusionDecoder};
#[doc(inline)]
pub use preflight::preflight;
#[doc(inline)]
pub use training::{adam_trainer, EpochSummary, Trainer, TrainingReport};
#[doc(inline)]
pub use weights::{load_backbone, load_model, save_model};

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use burn::backend::{Autodiff, NdArray};
    use vgg::VggFcnConfig;

    use crate::{DecoderConfig, FcnConfig};

    pub type TestBackend = NdArray;

    pub type TestAutodiffBackend = Autodiff<TestBackend>;

    /// A VGG layout small enough to run on the CPU in milliseconds.
    pub fn tiny_backbone_config() -> VggFcnConfig {
        VggFcnConfig::new()
            .with_stage_channels([4, 4, 8, 8, 8])
            .with_convs_per_stage([1, 1, 1, 1, 1])
            .with_fc_channels(16)
            .with_fc6_kernel(3)
    }

    pub fn tiny_model_config(num_classes: usize) -> FcnConfig {
        FcnConfig::new()
            .with_backbone(tiny_backbone_config())
            .with_decoder(DecoderConfig::new().with_num_classes(num_classes))
    }

    /// An empty directory under the system temp dir, unique to this process.
    pub fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("fcn-burn-tests")
            .join(format!("{name}-{}", std::process::id()));
        if dir.exists() {
            fs::remove_dir_all(&dir).unwrap();
        }
        fs::create_dir_all(&dir).unwrap();
        dir
    }
}
