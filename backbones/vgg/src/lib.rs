//! Fully convolutional VGG16 feature extractor.
//!
//! The classifier head of VGG16 is convolutionalized (`fc6` as a large-kernel
//! convolution, `fc7` as a 1x1 convolution) so the network accepts images of
//! any size divisible by 32 and exposes three intermediate activations used by
//! FCN-style decoders:
//!
//! - `layer3`: output of the third pooling stage (stride 8)
//! - `layer4`: output of the fourth pooling stage (stride 16)
//! - `layer7`: output of `fc7` after ReLU and dropout (stride 32)

use core::f64::consts::SQRT_2;

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Initializer, PaddingConfig2d, Relu,
    },
    prelude::*,
};

/// Number of convolution stages (each closed by a 2x2 max-pool).
pub const NUM_STAGES: usize = 5;

/// Total downsampling factor of the feature extractor.
pub const OUTPUT_STRIDE: usize = 32;

/// Configuration of the VGG16-FCN backbone.
#[derive(Config, Debug)]
pub struct VggFcnConfig {
    /// Input image channels.
    #[config(default = 3)]
    pub in_channels: usize,
    /// Output channels of each convolution stage.
    #[config(default = "[64, 128, 256, 512, 512]")]
    pub stage_channels: [usize; NUM_STAGES],
    /// Number of 3x3 convolutions in each stage.
    #[config(default = "[2, 2, 3, 3, 3]")]
    pub convs_per_stage: [usize; NUM_STAGES],
    /// Channels of the convolutionalized fully connected layers.
    #[config(default = 4096)]
    pub fc_channels: usize,
    /// Kernel size of `fc6`. Must be odd so that same padding is symmetric.
    #[config(default = 7)]
    pub fc6_kernel: usize,
    /// Probability of keeping an activation in the `fc6`/`fc7` dropout layers.
    #[config(default = 0.5)]
    pub keep_prob: f64,
}

impl VggFcnConfig {
    /// Initialize a backbone with random weights.
    pub fn init<B: Backend>(&self, device: &B::Device) -> VggFcn<B> {
        let mut stages = Vec::with_capacity(NUM_STAGES);
        let mut channels = self.in_channels;
        for (&out_channels, &num_convs) in self.stage_channels.iter().zip(&self.convs_per_stage) {
            stages.push(VggStage::new(channels, out_channels, num_convs, device));
            channels = out_channels;
        }

        let dropout = DropoutConfig::new(1.0 - self.keep_prob);

        VggFcn {
            stages,
            fc6: conv_block(
                channels,
                self.fc_channels,
                self.fc6_kernel,
                PaddingConfig2d::Same,
                device,
            ),
            fc7: conv_block(
                self.fc_channels,
                self.fc_channels,
                1,
                PaddingConfig2d::Valid,
                device,
            ),
            dropout6: dropout.init(),
            dropout7: dropout.init(),
            relu: Relu::new(),
            keep_prob: self.keep_prob,
        }
    }

    /// Channels of the `layer3`, `layer4` and `layer7` outputs.
    pub fn output_channels(&self) -> [usize; 3] {
        [
            self.stage_channels[2],
            self.stage_channels[3],
            self.fc_channels,
        ]
    }
}

fn conv_block<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    padding: PaddingConfig2d,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
        .with_stride([1, 1])
        .with_padding(padding)
        .with_initializer(Initializer::KaimingNormal {
            gain: SQRT_2,
            fan_out_only: true,
        })
        .init(device)
}

/// One VGG stage: a run of 3x3 convolutions with ReLU, closed by a max-pool.
#[derive(Module, Debug)]
pub struct VggStage<B: Backend> {
    pub convs: Vec<Conv2d<B>>,
    pool: MaxPool2d,
    relu: Relu,
}

impl<B: Backend> VggStage<B> {
    fn new(in_channels: usize, out_channels: usize, num_convs: usize, device: &B::Device) -> Self {
        let convs = (0..num_convs)
            .map(|i| {
                let in_channels = if i == 0 { in_channels } else { out_channels };
                conv_block(
                    in_channels,
                    out_channels,
                    3,
                    PaddingConfig2d::Explicit(1, 1),
                    device,
                )
            })
            .collect();

        Self {
            convs,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, mut x: Tensor<B, 4>) -> Tensor<B, 4> {
        for conv in &self.convs {
            x = self.relu.forward(conv.forward(x));
        }
        self.pool.forward(x)
    }
}

/// Intermediate activations consumed by the segmentation decoder.
#[derive(Debug, Clone)]
pub struct VggFcnOutput<B: Backend> {
    /// Pool3 output, stride 8.
    pub layer3: Tensor<B, 4>,
    /// Pool4 output, stride 16.
    pub layer4: Tensor<B, 4>,
    /// fc7 output, stride 32.
    pub layer7: Tensor<B, 4>,
}

/// VGG16 with a convolutionalized classifier head.
#[derive(Module, Debug)]
pub struct VggFcn<B: Backend> {
    pub stages: Vec<VggStage<B>>,
    pub fc6: Conv2d<B>,
    pub fc7: Conv2d<B>,
    dropout6: Dropout,
    dropout7: Dropout,
    relu: Relu,
    keep_prob: f64,
}

impl<B: Backend> VggFcn<B> {
    /// Run the extractor on `[batch, channels, height, width]` images.
    ///
    /// Dropout only fires on autodiff backends, so running the inner backend
    /// is equivalent to `keep_prob = 1.0`.
    pub fn forward(&self, images: Tensor<B, 4>) -> VggFcnOutput<B> {
        let layer3 = self.stages[..3]
            .iter()
            .fold(images, |x, stage| stage.forward(x));
        let layer4 = self.stages[3].forward(layer3.clone());
        let x = self.stages[4..]
            .iter()
            .fold(layer4.clone(), |x, stage| stage.forward(x));

        let x = self.dropout6.forward(self.relu.forward(self.fc6.forward(x)));
        let layer7 = self.dropout7.forward(self.relu.forward(self.fc7.forward(x)));

        VggFcnOutput {
            layer3,
            layer4,
            layer7,
        }
    }

    /// Probability of keeping an activation in the classifier-head dropout.
    pub fn keep_prob(&self) -> f64 {
        self.keep_prob
    }

    /// Channels of the `layer3`, `layer4` and `layer7` outputs.
    pub fn output_channels(&self) -> [usize; 3] {
        let stage_out = |index: usize| {
            self.stages[index]
                .convs
                .last()
                .map_or(0, |conv| conv.weight.val().dims()[0])
        };
        [stage_out(2), stage_out(3), self.fc7.weight.val().dims()[0]]
    }
}
