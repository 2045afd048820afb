//! Road predictions on the test split, written as overlays.
//!
//! Each test image is resized to the training shape, segmented, and saved
//! with the pixels predicted as road tinted green.

use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use burn::{prelude::*, tensor::activation::softmax};
use image::{imageops::FilterType, Rgb, RgbImage};

use crate::{
    config::Normalization,
    dataset::{load_rgb, normalize, png_files, ROAD_CLASS},
    error::{FcnError, FcnResult},
    models::Fcn,
};

/// Road probability above which a pixel is painted.
pub const ROAD_THRESHOLD: f32 = 0.5;

/// Overlay color and its alpha out of 255.
pub const OVERLAY_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const OVERLAY_ALPHA: u8 = 127;

/// Blend [`OVERLAY_COLOR`] over every pixel whose road probability exceeds
/// [`ROAD_THRESHOLD`]. `road_probs` is row-major and matches `image` in size.
pub fn overlay_segmentation(image: &RgbImage, road_probs: &[f32]) -> RgbImage {
    let alpha = f32::from(OVERLAY_ALPHA) / 255.0;
    let mut output = image.clone();

    for (pixel, &prob) in output.pixels_mut().zip(road_probs) {
        if prob > ROAD_THRESHOLD {
            for (channel, overlay) in pixel.0.iter_mut().zip(OVERLAY_COLOR.0) {
                let blended = f32::from(*channel) * (1.0 - alpha) + f32::from(overlay) * alpha;
                *channel = blended.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    output
}

/// Segment every PNG in `test_dir/image_2` and write the overlays to a new
/// `runs_dir/<unix seconds>/` directory, which is returned.
pub fn save_inference_samples<B: Backend>(
    runs_dir: impl AsRef<Path>,
    test_dir: impl AsRef<Path>,
    model: &Fcn<B>,
    image_shape: [usize; 2],
    normalization: Normalization,
    device: &B::Device,
) -> FcnResult<PathBuf> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    let output_dir = runs_dir.as_ref().join(timestamp.to_string());

    save_inference_samples_to(&output_dir, test_dir, model, image_shape, normalization, device)?;
    Ok(output_dir)
}

/// Like [`save_inference_samples`], into an explicit directory. An existing
/// directory is replaced.
pub fn save_inference_samples_to<B: Backend>(
    output_dir: &Path,
    test_dir: impl AsRef<Path>,
    model: &Fcn<B>,
    image_shape: [usize; 2],
    normalization: Normalization,
    device: &B::Device,
) -> FcnResult<usize> {
    let image_dir = test_dir.as_ref().join("image_2");
    if !image_dir.is_dir() {
        return Err(FcnError::MissingResource {
            what: "test image directory",
            path: image_dir,
        });
    }

    if output_dir.exists() {
        fs::remove_dir_all(output_dir)?;
    }
    fs::create_dir_all(output_dir)?;
    tracing::info!(dir = %output_dir.display(), "saving test images");

    let files = png_files(&image_dir)?;
    for path in &files {
        let image = load_rgb(path, image_shape, FilterType::Triangle)?;
        let road_probs = road_probabilities(model, &image, normalization, device)?;
        let overlay = overlay_segmentation(&image, &road_probs);

        let target = output_dir.join(path.file_name().unwrap_or_default());
        overlay
            .save(&target)
            .map_err(|source| FcnError::ImageOpenFailed {
                path: target.clone(),
                source,
            })?;
        tracing::debug!(file = %target.display(), "saved overlay");
    }

    tracing::info!(count = files.len(), "inference samples written");
    Ok(files.len())
}

/// Per-pixel softmax probability of the road class, row-major.
pub fn road_probabilities<B: Backend>(
    model: &Fcn<B>,
    image: &RgbImage,
    normalization: Normalization,
    device: &B::Device,
) -> FcnResult<Vec<f32>> {
    let (width, height) = image.dimensions();
    let (height, width) = (height as usize, width as usize);

    let input = Tensor::<B, 3>::from_data(
        TensorData::new(normalize(image, normalization), [height, width, 3]),
        device,
    )
    .permute([2, 0, 1])
    .unsqueeze::<4>();

    let probs = softmax(model.forward(input)?, 1);
    let road = usize::from(ROAD_CLASS);
    probs
        .slice([0..1, road..road + 1, 0..height, 0..width])
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| FcnError::DatasetError {
            message: format!("failed to read road probabilities: {err:?}"),
        })
}
