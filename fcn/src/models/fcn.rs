//! # FCN-8s model
//!
//! Couples a [`VggFcn`] backbone with the [`SkipFusionDecoder`]. Construction
//! validates the backbone's named-output contract, and each forward pass
//! checks that the score map matches the input's batch and spatial extent.

use burn::prelude::*;
use vgg::{VggFcn, VggFcnConfig};

use super::{
    backbone::{validate_ports, FeatureBackbone, FeatureTaps, IMAGE_INPUT},
    decoder::{DecoderConfig, SkipFusionDecoder},
};
use crate::{
    error::{FcnError, FcnResult},
    shape::{ensure_matching_axes, SPATIAL_AXES},
};

/// Configuration for the [`Fcn`] model.
#[derive(Config, Debug)]
pub struct FcnConfig {
    /// Backbone layout and dropout.
    #[config(default = "VggFcnConfig::new()")]
    pub backbone: VggFcnConfig,
    /// Decoder classes, initializer and regularization.
    #[config(default = "DecoderConfig::new()")]
    pub decoder: DecoderConfig,
    /// Whether backbone parameters receive gradient updates.
    #[config(default = true)]
    pub train_backbone: bool,
}

impl FcnConfig {
    /// Check the model-level parameters.
    pub fn validate(&self) -> FcnResult<()> {
        let invalid = |reason: String| Err(FcnError::InvalidConfiguration { reason });

        if self.decoder.num_classes < 2 {
            return invalid(format!(
                "num_classes must be at least 2, got {}",
                self.decoder.num_classes
            ));
        }
        if self.decoder.init_stddev.is_nan() || self.decoder.init_stddev <= 0.0 {
            return invalid(format!(
                "init_stddev must be positive, got {}",
                self.decoder.init_stddev
            ));
        }
        if self.decoder.l2_scale.is_nan() || self.decoder.l2_scale < 0.0 {
            return invalid(format!(
                "l2_scale must be non-negative, got {}",
                self.decoder.l2_scale
            ));
        }
        let keep_prob = self.backbone.keep_prob;
        if keep_prob.is_nan() || keep_prob <= 0.0 || keep_prob > 1.0 {
            return invalid(format!(
                "keep_prob must be in (0, 1], got {keep_prob}"
            ));
        }
        let backbone = &self.backbone;
        if backbone.in_channels == 0 || backbone.fc_channels == 0 {
            return invalid(format!(
                "backbone channels must be positive, got in_channels {} and fc_channels {}",
                backbone.in_channels, backbone.fc_channels
            ));
        }
        if let Some(stage) = backbone.stage_channels.iter().position(|&c| c == 0) {
            return invalid(format!("stage_channels[{stage}] must be positive"));
        }
        if let Some(stage) = backbone.convs_per_stage.iter().position(|&n| n == 0) {
            return invalid(format!("convs_per_stage[{stage}] must be at least 1"));
        }
        if backbone.fc6_kernel % 2 == 0 {
            return invalid(format!(
                "fc6_kernel must be odd, got {}",
                backbone.fc6_kernel
            ));
        }
        Ok(())
    }

    /// Build a model with a randomly initialized backbone.
    pub fn init<B: Backend>(&self, device: &B::Device) -> FcnResult<Fcn<B>> {
        self.validate()?;
        self.init_with_backbone(self.backbone.init(device), device)
    }

    /// Build a model around an already loaded backbone.
    ///
    /// The backbone keeps its weights; only the decoder is freshly initialized.
    pub fn init_with_backbone<B: Backend>(
        &self,
        backbone: VggFcn<B>,
        device: &B::Device,
    ) -> FcnResult<Fcn<B>> {
        self.validate()?;
        validate_ports(&FeatureBackbone::<B>::ports(&backbone))?;

        let in_channels = FeatureBackbone::<B>::output_channels(&backbone);
        let decoder = self.decoder.init(in_channels, device);
        let backbone = if self.train_backbone {
            backbone
        } else {
            tracing::info!("backbone parameters frozen");
            backbone.no_grad()
        };

        tracing::debug!(
            ?in_channels,
            num_classes = self.decoder.num_classes,
            "FCN-8s model initialized"
        );

        Ok(Fcn { backbone, decoder })
    }
}

/// VGG16 backbone plus FCN-8s skip-fusion decoder.
#[derive(Module, Debug)]
pub struct Fcn<B: Backend> {
    pub backbone: VggFcn<B>,
    pub decoder: SkipFusionDecoder<B>,
}

impl<B: Backend> Fcn<B> {
    /// Per-pixel class logits `[batch, num_classes, height, width]`.
    ///
    /// # Errors
    ///
    /// Returns [`FcnError::ShapeMismatch`] when a skip fusion fails or the
    /// score map does not cover the input exactly (input sides must be
    /// multiples of 32).
    pub fn forward(&self, images: Tensor<B, 4>) -> FcnResult<Tensor<B, 4>> {
        let image_dims = images.dims();
        let taps = FeatureTaps::from_named(self.backbone.forward_named(images))?;
        let scores = self.decoder.forward(taps)?;

        ensure_matching_axes(
            IMAGE_INPUT,
            image_dims,
            "score_map",
            scores.dims(),
            &SPATIAL_AXES,
        )?;
        Ok(scores)
    }

    pub fn num_classes(&self) -> usize {
        self.decoder.num_classes()
    }

    /// L2 penalty on decoder filters, added to the training objective.
    pub fn regularization(&self) -> Option<Tensor<B, 1>> {
        (self.decoder.l2_scale() > 0.0).then(|| self.decoder.l2_penalty())
    }
}
