//! Run configuration.
//!
//! Every constant of a training run lives in [`TrainingConfig`], which loads
//! from and saves to JSON through Burn's [`Config`] derive.

use std::path::PathBuf;

use burn::{optim::AdamConfig, prelude::*};
use vgg::OUTPUT_STRIDE;

use crate::{
    error::{FcnError, FcnResult},
    models::FcnConfig,
};

/// How raw 8-bit pixel values are mapped before entering the network.
#[derive(Config, Debug, PartialEq, Copy)]
pub enum Normalization {
    /// Keep values in `0..=255`, as expected by the Caffe-converted VGG16.
    Raw,
    /// Scale to `0.0..=1.0`.
    Unit,
    /// Scale to `0.0..=1.0`, then standardize with ImageNet mean and std.
    ImageNet,
}

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

impl Normalization {
    /// Map one 8-bit sample of color `channel` (0 = red).
    pub fn apply(self, value: u8, channel: usize) -> f32 {
        let value = f32::from(value);
        match self {
            Self::Raw => value,
            Self::Unit => value / 255.0,
            Self::ImageNet => (value / 255.0 - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel],
        }
    }

    /// Inverse of [`Normalization::apply`], clamped to the 8-bit range.
    pub fn restore(self, value: f32, channel: usize) -> u8 {
        let value = match self {
            Self::Raw => value,
            Self::Unit => value * 255.0,
            Self::ImageNet => (value * IMAGENET_STD[channel] + IMAGENET_MEAN[channel]) * 255.0,
        };
        value.round().clamp(0.0, 255.0) as u8
    }
}

/// Configuration of a full training run.
#[derive(Config)]
pub struct TrainingConfig {
    /// Model architecture.
    #[config(default = "FcnConfig::new()")]
    pub model: FcnConfig,

    /// Adam moments and epsilon.
    #[config(default = "AdamConfig::new().with_epsilon(1e-8)")]
    pub optimizer: AdamConfig,

    #[config(default = 50)]
    pub num_epochs: usize,

    #[config(default = 5)]
    pub batch_size: usize,

    #[config(default = 1e-3)]
    pub learning_rate: f64,

    /// Training and inference image size as `[height, width]`.
    #[config(default = "[160, 576]")]
    pub image_shape: [usize; 2],

    #[config(default = "Normalization::Raw")]
    pub normalization: Normalization,

    /// Root holding `vgg/` and `data_road/`.
    #[config(default = "String::from(\"data\")")]
    pub data_dir: String,

    /// Where timestamped inference-sample directories are created.
    #[config(default = "String::from(\"runs\")")]
    pub runs_dir: String,

    /// Directory with pretrained backbone weights. `None` means `<data_dir>/vgg`.
    #[config(default = "None")]
    pub backbone_dir: Option<String>,

    /// Start from pretrained backbone weights instead of random initialization.
    #[config(default = true)]
    pub pretrained_backbone: bool,

    /// Where the trained model record is written, if anywhere.
    #[config(default = "None")]
    pub model_path: Option<String>,

    #[config(default = 42)]
    pub seed: u64,
}

impl TrainingConfig {
    /// Reject configurations that cannot produce a meaningful run.
    pub fn validate(&self) -> FcnResult<()> {
        let invalid = |reason: String| Err(FcnError::InvalidConfiguration { reason });

        if self.num_epochs == 0 {
            return invalid("num_epochs must be at least 1".to_string());
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1".to_string());
        }
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            return invalid(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            ));
        }
        let [height, width] = self.image_shape;
        if height == 0 || width == 0 || height % OUTPUT_STRIDE != 0 || width % OUTPUT_STRIDE != 0 {
            return invalid(format!(
                "image_shape sides must be positive multiples of {OUTPUT_STRIDE}, got {height}x{width}"
            ));
        }

        self.model.validate()
    }

    /// `<data_dir>/data_road/training`.
    pub fn training_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("data_road").join("training")
    }

    /// `<data_dir>/data_road/testing`.
    pub fn testing_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("data_road").join("testing")
    }

    pub fn backbone_dir(&self) -> PathBuf {
        self.backbone_dir
            .as_ref()
            .map_or_else(|| PathBuf::from(&self.data_dir).join("vgg"), PathBuf::from)
    }

    pub fn runs_dir(&self) -> PathBuf {
        PathBuf::from(&self.runs_dir)
    }
}

#[cfg(test)]
mod tests {
    use vgg::VggFcnConfig;

    use super::*;

    #[test]
    fn defaults_match_the_reference_run() {
        let config = TrainingConfig::new();

        assert_eq!(config.num_epochs, 50);
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.learning_rate, 1e-3);
        assert_eq!(config.model.backbone.keep_prob, 0.5);
        assert_eq!(config.image_shape, [160, 576]);
        assert_eq!(config.model.decoder.num_classes, 2);
        assert!(config.model.train_backbone);
        assert_eq!(config.normalization, Normalization::Raw);
        assert_eq!(config.backbone_dir(), PathBuf::from("data").join("vgg"));
        assert_eq!(config.optimizer.epsilon, 1e-8);
        assert_eq!(
            config.training_dir(),
            PathBuf::from("data").join("data_road").join("training")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn keep_prob_has_a_single_serialized_source() {
        let config = TrainingConfig::new().with_model(
            FcnConfig::new().with_backbone(VggFcnConfig::new().with_keep_prob(0.8)),
        );

        let json = serde_json::to_string(&config).unwrap();
        let restored: TrainingConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(json.matches("\"keep_prob\"").count(), 1);
        assert_eq!(restored.model.backbone.keep_prob, 0.8);
        assert!(restored.validate().is_ok());
    }

    #[test]
    fn backbone_dir_follows_data_dir() {
        let config = TrainingConfig::new().with_data_dir("/datasets/kitti".to_string());

        assert_eq!(config.backbone_dir(), PathBuf::from("/datasets/kitti/vgg"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let cases = [
            TrainingConfig::new().with_num_epochs(0),
            TrainingConfig::new().with_batch_size(0),
            TrainingConfig::new().with_learning_rate(0.0),
            TrainingConfig::new().with_learning_rate(f64::NAN),
            TrainingConfig::new().with_model(
                FcnConfig::new().with_backbone(VggFcnConfig::new().with_keep_prob(0.0)),
            ),
            TrainingConfig::new().with_model(
                FcnConfig::new().with_backbone(VggFcnConfig::new().with_keep_prob(1.5)),
            ),
            TrainingConfig::new().with_image_shape([160, 570]),
            TrainingConfig::new().with_image_shape([0, 576]),
            TrainingConfig::new()
                .with_model(FcnConfig::new().with_decoder(
                    crate::DecoderConfig::new().with_num_classes(1),
                )),
            TrainingConfig::new().with_model(
                FcnConfig::new().with_decoder(crate::DecoderConfig::new().with_l2_scale(-1.0)),
            ),
            TrainingConfig::new().with_model(
                FcnConfig::new().with_decoder(crate::DecoderConfig::new().with_init_stddev(0.0)),
            ),
        ];

        for config in cases {
            assert!(
                matches!(
                    config.validate(),
                    Err(FcnError::InvalidConfiguration { .. })
                ),
                "accepted {config}"
            );
        }
    }

    #[test]
    fn normalization_restores_pixels() {
        for normalization in [Normalization::Raw, Normalization::Unit, Normalization::ImageNet] {
            for (channel, value) in [(0, 0u8), (1, 128), (2, 255)] {
                let normalized = normalization.apply(value, channel);
                assert_eq!(normalization.restore(normalized, channel), value);
            }
        }
    }

    #[test]
    fn json_round_trip_keeps_overrides() {
        let config = TrainingConfig::new()
            .with_num_epochs(3)
            .with_normalization(Normalization::ImageNet)
            .with_backbone_dir(Some("weights/vgg16".to_string()));

        let restored: TrainingConfig = serde_json::from_str(&config.to_string()).unwrap();

        assert_eq!(restored.num_epochs, 3);
        assert_eq!(restored.normalization, Normalization::ImageNet);
        assert_eq!(restored.backbone_dir(), PathBuf::from("weights/vgg16"));
        assert_eq!(restored.batch_size, 5);
    }
}
