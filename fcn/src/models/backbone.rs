//! Named-output contract between a pretrained feature extractor and the decoder.
//!
//! A backbone advertises the ports it provides by name. The model checks the
//! advertised ports once, when it is built, and converts every forward pass
//! into typed [`FeatureTaps`].

use std::collections::BTreeMap;

use burn::prelude::*;
use vgg::VggFcn;

use crate::error::{FcnError, FcnResult};

/// Input images, `[batch, 3, height, width]`.
pub const IMAGE_INPUT: &str = "image_input";
/// Dropout keep probability of the classifier head.
pub const KEEP_PROB: &str = "keep_prob";
/// Stride-8 activation.
pub const LAYER3_OUT: &str = "layer3_out";
/// Stride-16 activation.
pub const LAYER4_OUT: &str = "layer4_out";
/// Stride-32 activation.
pub const LAYER7_OUT: &str = "layer7_out";

/// Every port the segmentation model relies on.
pub const REQUIRED_PORTS: [&str; 5] = [IMAGE_INPUT, KEEP_PROB, LAYER3_OUT, LAYER4_OUT, LAYER7_OUT];

/// A feature extractor exposing named intermediate activations.
pub trait FeatureBackbone<B: Backend> {
    /// Names of the ports this backbone provides.
    fn ports(&self) -> Vec<&'static str>;

    /// Channels of `layer3_out`, `layer4_out` and `layer7_out`.
    fn output_channels(&self) -> [usize; 3];

    /// Keep probability used by the backbone's dropout while training.
    fn keep_prob(&self) -> f64;

    /// Run the backbone and return its activation outputs by name.
    fn forward_named(&self, images: Tensor<B, 4>) -> BTreeMap<&'static str, Tensor<B, 4>>;
}

/// Fail with the first required port missing from `ports`.
pub fn validate_ports(ports: &[&str]) -> FcnResult<()> {
    match REQUIRED_PORTS.iter().find(|name| !ports.contains(name)) {
        None => Ok(()),
        Some(name) => Err(FcnError::MissingBackboneOutput {
            name: (*name).to_string(),
        }),
    }
}

/// The three activations consumed by the decoder.
#[derive(Debug, Clone)]
pub struct FeatureTaps<B: Backend> {
    /// Stride 8.
    pub layer3: Tensor<B, 4>,
    /// Stride 16.
    pub layer4: Tensor<B, 4>,
    /// Stride 32.
    pub layer7: Tensor<B, 4>,
}

impl<B: Backend> FeatureTaps<B> {
    /// Pick the decoder inputs out of a named output map.
    pub fn from_named(mut outputs: BTreeMap<&'static str, Tensor<B, 4>>) -> FcnResult<Self> {
        let mut take = |name: &str| {
            outputs
                .remove(name)
                .ok_or_else(|| FcnError::MissingBackboneOutput {
                    name: name.to_string(),
                })
        };

        Ok(Self {
            layer3: take(LAYER3_OUT)?,
            layer4: take(LAYER4_OUT)?,
            layer7: take(LAYER7_OUT)?,
        })
    }
}

impl<B: Backend> FeatureBackbone<B> for VggFcn<B> {
    fn ports(&self) -> Vec<&'static str> {
        REQUIRED_PORTS.to_vec()
    }

    fn output_channels(&self) -> [usize; 3] {
        VggFcn::output_channels(self)
    }

    fn keep_prob(&self) -> f64 {
        VggFcn::keep_prob(self)
    }

    fn forward_named(&self, images: Tensor<B, 4>) -> BTreeMap<&'static str, Tensor<B, 4>> {
        let output = self.forward(images);
        BTreeMap::from([
            (LAYER3_OUT, output.layer3),
            (LAYER4_OUT, output.layer4),
            (LAYER7_OUT, output.layer7),
        ])
    }
}
