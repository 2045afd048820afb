pub mod backbone;
pub mod decoder;
pub mod fcn;

pub use backbone::{FeatureBackbone, FeatureTaps};
pub use decoder::{DecoderConfig, SkipFusionDecoder};
pub use fcn::{Fcn, FcnConfig, FcnRecord};
