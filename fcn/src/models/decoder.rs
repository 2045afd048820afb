//! # Skip-fusion decoder
//!
//! Turns the three backbone taps into a full-resolution class-score map with
//! the FCN-8s top-down pattern:
//!
//! ```text
//! layer7 ─1x1─► score7 ─up x2─┐
//!                              + ─up x2─┐
//! layer4 ─1x1─► score4 ────────┘        + ─up x8─► logits
//! layer3 ─1x1─► score3 ─────────────────┘
//! ```
//!
//! Every fusion point requires exact shape agreement; nothing is broadcast.

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        Initializer, PaddingConfig2d,
    },
    prelude::*,
};

use super::backbone::FeatureTaps;
use crate::{error::FcnResult, shape::ensure_same_dims};

/// Configuration for [`SkipFusionDecoder`].
#[derive(Config, Debug)]
pub struct DecoderConfig {
    /// Number of output classes (at least 2).
    #[config(default = 2)]
    pub num_classes: usize,
    /// Standard deviation of the normal initializer used for every decoder filter.
    #[config(default = 0.01)]
    pub init_stddev: f64,
    /// Coefficient of the L2 penalty on decoder filters. Zero disables it.
    #[config(default = 1e-3)]
    pub l2_scale: f64,
}

impl DecoderConfig {
    /// Build the decoder for taps with `in_channels = [layer3, layer4, layer7]`.
    pub fn init<B: Backend>(&self, in_channels: [usize; 3], device: &B::Device) -> SkipFusionDecoder<B> {
        let [layer3_channels, layer4_channels, layer7_channels] = in_channels;

        SkipFusionDecoder {
            score_layer7: self.projection(layer7_channels, device),
            upsample_layer7: self.upsample(4, 2, device),
            score_layer4: self.projection(layer4_channels, device),
            upsample_fuse4: self.upsample(4, 2, device),
            score_layer3: self.projection(layer3_channels, device),
            upsample_fuse3: self.upsample(16, 8, device),
            num_classes: self.num_classes,
            l2_scale: self.l2_scale,
        }
    }

    fn initializer(&self) -> Initializer {
        Initializer::Normal {
            mean: 0.0,
            std: self.init_stddev,
        }
    }

    /// 1x1 convolution acting as a per-pixel linear classifier.
    fn projection<B: Backend>(&self, in_channels: usize, device: &B::Device) -> Conv2d<B> {
        Conv2dConfig::new([in_channels, self.num_classes], [1, 1])
            .with_padding(PaddingConfig2d::Valid)
            .with_initializer(self.initializer())
            .init(device)
    }

    /// Learned upsampling by `stride` with same padding, so the output is
    /// exactly `stride` times the input in each spatial dimension.
    fn upsample<B: Backend>(&self, kernel: usize, stride: usize, device: &B::Device) -> ConvTranspose2d<B> {
        let padding = (kernel - stride) / 2;
        ConvTranspose2dConfig::new([self.num_classes, self.num_classes], [kernel, kernel])
            .with_stride([stride, stride])
            .with_padding([padding, padding])
            .with_initializer(self.initializer())
            .init(device)
    }
}

/// FCN-8s decoder with lateral skip connections from pool3 and pool4.
#[derive(Module, Debug)]
pub struct SkipFusionDecoder<B: Backend> {
    score_layer7: Conv2d<B>,
    upsample_layer7: ConvTranspose2d<B>,
    score_layer4: Conv2d<B>,
    upsample_fuse4: ConvTranspose2d<B>,
    score_layer3: Conv2d<B>,
    upsample_fuse3: ConvTranspose2d<B>,
    num_classes: usize,
    l2_scale: f64,
}

impl<B: Backend> SkipFusionDecoder<B> {
    /// Produce stride-1 logits `[batch, num_classes, 8 * h3, 8 * w3]`.
    ///
    /// # Errors
    ///
    /// Returns [`FcnError::ShapeMismatch`](crate::FcnError::ShapeMismatch) when
    /// an upsampled map and its lateral projection disagree, e.g. when the mid
    /// feature map is not exactly twice the coarse one.
    pub fn forward(&self, taps: FeatureTaps<B>) -> FcnResult<Tensor<B, 4>> {
        let score7 = self.score_layer7.forward(taps.layer7);
        let score7_up = self.upsample_layer7.forward(score7);

        let score4 = self.score_layer4.forward(taps.layer4);
        let fuse4 = fuse("layer7_score_up2", score7_up, "layer4_score", score4)?;
        let fuse4_up = self.upsample_fuse4.forward(fuse4);

        let score3 = self.score_layer3.forward(taps.layer3);
        let fuse3 = fuse("layer4_fused_up2", fuse4_up, "layer3_score", score3)?;

        Ok(self.upsample_fuse3.forward(fuse3))
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// `l2_scale * sum(w^2) / 2` over every decoder filter, biases excluded.
    pub fn l2_penalty(&self) -> Tensor<B, 1> {
        let conv_sq = |conv: &Conv2d<B>| conv.weight.val().powf_scalar(2.0).sum();
        let deconv_sq = |deconv: &ConvTranspose2d<B>| deconv.weight.val().powf_scalar(2.0).sum();

        let total = conv_sq(&self.score_layer7)
            + conv_sq(&self.score_layer4)
            + conv_sq(&self.score_layer3)
            + deconv_sq(&self.upsample_layer7)
            + deconv_sq(&self.upsample_fuse4)
            + deconv_sq(&self.upsample_fuse3);

        total.mul_scalar(self.l2_scale / 2.0)
    }

    pub fn l2_scale(&self) -> f64 {
        self.l2_scale
    }
}

fn fuse<B: Backend>(
    left_name: &str,
    left: Tensor<B, 4>,
    right_name: &str,
    right: Tensor<B, 4>,
) -> FcnResult<Tensor<B, 4>> {
    ensure_same_dims(left_name, left.dims(), right_name, right.dims())?;
    Ok(left + right)
}

#[cfg(test)]
mod tests {
    use burn::tensor::Distribution;

    use super::*;
    use crate::{tests::TestBackend, FcnError};

    fn taps(
        batch: usize,
        coarse: [usize; 2],
        mid: [usize; 2],
        fine: [usize; 2],
        device: &<TestBackend as Backend>::Device,
    ) -> FeatureTaps<TestBackend> {
        let random = |channels: usize, [h, w]: [usize; 2]| {
            Tensor::<TestBackend, 4>::random(
                [batch, channels, h, w],
                Distribution::Normal(0.0, 1.0),
                device,
            )
        };
        FeatureTaps {
            layer3: random(8, fine),
            layer4: random(12, mid),
            layer7: random(16, coarse),
        }
    }

    #[test]
    fn output_is_full_resolution_with_class_channels() {
        let device = Default::default();
        for (num_classes, batch) in [(2, 1), (3, 2), (7, 3)] {
            let decoder = DecoderConfig::new()
                .with_num_classes(num_classes)
                .init::<TestBackend>([8, 12, 16], &device);

            let logits = decoder
                .forward(taps(batch, [2, 3], [4, 6], [8, 12], &device))
                .expect("matching taps must decode");

            assert_eq!(logits.dims(), [batch, num_classes, 64, 96]);
        }
    }

    #[test]
    fn mid_map_not_twice_coarse_is_rejected() {
        let device = Default::default();
        let decoder = DecoderConfig::new().init::<TestBackend>([8, 12, 16], &device);

        let err = decoder
            .forward(taps(1, [2, 3], [5, 6], [10, 12], &device))
            .unwrap_err();

        match err {
            FcnError::ShapeMismatch {
                left, right, axis, ..
            } => {
                assert_eq!(left, "layer7_score_up2");
                assert_eq!(right, "layer4_score");
                assert_eq!(axis, "height");
            }
            other => panic!("expected ShapeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn fine_map_mismatch_is_rejected_at_second_fusion() {
        let device = Default::default();
        let decoder = DecoderConfig::new().init::<TestBackend>([8, 12, 16], &device);

        let err = decoder
            .forward(taps(1, [2, 3], [4, 6], [8, 13], &device))
            .unwrap_err();

        match err {
            FcnError::ShapeMismatch { right, axis, .. } => {
                assert_eq!(right, "layer3_score");
                assert_eq!(axis, "width");
            }
            other => panic!("expected ShapeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn l2_penalty_is_positive_unless_disabled() {
        let device = Default::default();
        let with = DecoderConfig::new()
            .init::<TestBackend>([8, 12, 16], &device)
            .l2_penalty()
            .into_scalar();

        let without = DecoderConfig::new()
            .with_l2_scale(0.0)
            .init::<TestBackend>([8, 12, 16], &device)
            .l2_penalty()
            .into_scalar();

        assert!(with > 0.0);
        assert_eq!(without, 0.0);
    }
}
