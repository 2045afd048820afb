use std::path::PathBuf;

use thiserror::Error;

/// The error type for FCN construction, training and I/O.
#[derive(Error, Debug)]
pub enum FcnError {
    /// The execution environment cannot run the requested work
    /// (for example, training on a backend without automatic differentiation).
    #[error("Environment precondition failed: {reason}")]
    EnvironmentPrecondition {
        /// What is missing.
        reason: String,
    },

    /// Two tensors that must agree exactly disagree in one dimension.
    #[error(
        "Shape mismatch between `{left}` {left_shape:?} and `{right}` {right_shape:?}: \
         dimension {dim} ({axis}) differs"
    )]
    ShapeMismatch {
        /// Name of the first tensor.
        left: String,
        /// Name of the second tensor.
        right: String,
        /// Index of the first differing dimension.
        dim: usize,
        /// Name of the first differing dimension.
        axis: &'static str,
        /// Full shape of the first tensor.
        left_shape: Vec<usize>,
        /// Full shape of the second tensor.
        right_shape: Vec<usize>,
    },

    /// Configuration parameters are out of range or inconsistent.
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Why the configuration was rejected.
        reason: String,
    },

    /// The backbone does not expose a named output required by the decoder.
    #[error("Backbone does not expose required output `{name}`")]
    MissingBackboneOutput {
        /// The missing output name.
        name: String,
    },

    /// The training objective became NaN or infinite.
    #[error("Non-finite loss {value} at epoch {epoch}, step {step}")]
    NonFiniteLoss {
        /// One-based epoch.
        epoch: usize,
        /// One-based global step.
        step: usize,
        /// The offending loss value.
        value: f32,
    },

    /// A required file or directory does not exist.
    #[error("Missing {what}: {path}")]
    MissingResource {
        /// Human readable description of the resource.
        what: &'static str,
        /// The path that was looked up.
        path: PathBuf,
    },

    /// A weight file exists but could not be decoded into the model.
    #[error("Failed to load weights from {path}: {reason}")]
    WeightLoadingFailed {
        /// The weight file.
        path: PathBuf,
        /// Recorder error message.
        reason: String,
    },

    /// The weight file format is not compiled in.
    #[error("Unsupported weight file format: {format}")]
    UnsupportedWeightFormat {
        /// File extension of the weight file.
        format: String,
    },

    /// Saving a model record failed.
    #[error("Failed to save model to {path}: {reason}")]
    ModelSaveFailed {
        /// Target path.
        path: PathBuf,
        /// Recorder error message.
        reason: String,
    },

    /// Reading a directory failed.
    #[error("Failed to read directory: {path}")]
    DirectoryReadFailed {
        /// The directory.
        path: PathBuf,
        /// The underlying walk error.
        #[source]
        source: walkdir::Error,
    },

    /// Opening, decoding or encoding an image failed.
    #[error("Failed to process image: {path}")]
    ImageOpenFailed {
        /// The image file.
        path: PathBuf,
        /// The underlying image error.
        #[source]
        source: image::ImageError,
    },

    /// The dataset layout is inconsistent.
    #[error("Dataset error: {message}")]
    DatasetError {
        /// The error message.
        message: String,
    },

    /// Any other I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A specialized `Result` type for FCN operations.
pub type FcnResult<T> = Result<T, FcnError>;
