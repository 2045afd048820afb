//! KITTI road dataset loading and batching.
//!
//! Items are decoded, resized and normalized on the CPU once, at load time.
//! Tensors are only created by [`SegmentationBatcher`], on the device the
//! caller asks for.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    prelude::*,
};
use image::{imageops::FilterType, Rgb, RgbImage};
use walkdir::WalkDir;

use crate::{
    config::Normalization,
    error::{FcnError, FcnResult},
};

/// Ground-truth color of non-road pixels.
pub const BACKGROUND_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// Class index of background pixels; every other color is road.
pub const BACKGROUND_CLASS: u8 = 0;
pub const ROAD_CLASS: u8 = 1;
pub const NUM_ROAD_CLASSES: usize = 2;

/// One preprocessed image with its per-pixel class indices.
#[derive(Debug, Clone)]
pub struct SegmentationItem {
    /// Normalized pixels, `[height, width, 3]` row-major.
    pub image: Vec<f32>,
    /// Class index of each pixel, `[height, width]` row-major.
    pub classes: Vec<u8>,
    pub height: usize,
    pub width: usize,
}

/// A batch of images with matching one-hot label maps.
#[derive(Debug, Clone)]
pub struct SegmentationBatch<B: Backend> {
    /// `[batch, 3, height, width]`.
    pub images: Tensor<B, 4>,
    /// One-hot, `[batch, num_classes, height, width]`.
    pub labels: Tensor<B, 4>,
}

/// Stacks [`SegmentationItem`]s into a [`SegmentationBatch`].
#[derive(Debug, Clone)]
pub struct SegmentationBatcher {
    num_classes: usize,
}

impl SegmentationBatcher {
    pub const fn new(num_classes: usize) -> Self {
        Self { num_classes }
    }
}

impl<B: Backend> Batcher<B, SegmentationItem, SegmentationBatch<B>> for SegmentationBatcher {
    fn batch(&self, items: Vec<SegmentationItem>, device: &B::Device) -> SegmentationBatch<B> {
        let mut images = Vec::with_capacity(items.len());
        let mut labels = Vec::with_capacity(items.len());

        for item in items {
            let image = Tensor::<B, 3>::from_data(
                TensorData::new(item.image, [item.height, item.width, 3]),
                device,
            )
            .permute([2, 0, 1]);

            let mut one_hot = vec![0.0f32; item.classes.len() * self.num_classes];
            for (pixel, &class) in item.classes.iter().enumerate() {
                one_hot[pixel * self.num_classes + usize::from(class)] = 1.0;
            }
            let label = Tensor::<B, 3>::from_data(
                TensorData::new(one_hot, [item.height, item.width, self.num_classes]),
                device,
            )
            .permute([2, 0, 1]);

            images.push(image);
            labels.push(label);
        }

        SegmentationBatch {
            images: Tensor::stack(images, 0),
            labels: Tensor::stack(labels, 0),
        }
    }
}

/// Anything that can be iterated as training batches, once per epoch.
pub trait BatchSource<B: Backend> {
    /// A fresh, finite pass over the data in `batch_size` chunks. The last
    /// batch may be smaller. Batches are built lazily as the iterator advances.
    fn batches<'a>(
        &'a self,
        batch_size: usize,
        device: &'a B::Device,
    ) -> Box<dyn Iterator<Item = SegmentationBatch<B>> + 'a>;

    /// Number of batches one pass yields.
    fn num_batches(&self, batch_size: usize) -> usize;
}

/// Adapts any [`Dataset`] of [`SegmentationItem`]s into a [`BatchSource`],
/// visiting items in index order.
pub struct BatchedDataset<D> {
    dataset: D,
    batcher: SegmentationBatcher,
}

impl<D: Dataset<SegmentationItem>> BatchedDataset<D> {
    pub const fn new(dataset: D, batcher: SegmentationBatcher) -> Self {
        Self { dataset, batcher }
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }
}

impl<B: Backend, D: Dataset<SegmentationItem>> BatchSource<B> for BatchedDataset<D> {
    fn batches<'a>(
        &'a self,
        batch_size: usize,
        device: &'a B::Device,
    ) -> Box<dyn Iterator<Item = SegmentationBatch<B>> + 'a> {
        let len = self.dataset.len();
        let batch_size = batch_size.max(1);

        Box::new((0..len).step_by(batch_size).map(move |start| {
            let end = (start + batch_size).min(len);
            let items: Vec<SegmentationItem> = (start..end)
                .filter_map(|index| self.dataset.get(index))
                .collect();
            Batcher::<B, SegmentationItem, SegmentationBatch<B>>::batch(&self.batcher, items, device)
        }))
    }

    fn num_batches(&self, batch_size: usize) -> usize {
        self.dataset.len().div_ceil(batch_size.max(1))
    }
}

/// KITTI road training images paired with their road ground truth.
///
/// Expects the `data_road/training` layout:
///
/// ```text
/// <dir>/image_2/um_000000.png
/// <dir>/gt_image_2/um_road_000000.png
/// ```
#[derive(Debug, Clone)]
pub struct RoadDataset {
    items: Vec<SegmentationItem>,
    files: Vec<PathBuf>,
}

impl RoadDataset {
    /// Load every image under `dir/image_2` resized to `image_shape`
    /// (`[height, width]`).
    ///
    /// # Errors
    ///
    /// - [`FcnError::MissingResource`] if either sub-directory is absent.
    /// - [`FcnError::DatasetError`] if there are no images, or an image has no
    ///   road ground truth.
    /// - [`FcnError::ImageOpenFailed`] if a file cannot be decoded.
    pub fn load(
        dir: impl AsRef<Path>,
        image_shape: [usize; 2],
        normalization: Normalization,
    ) -> FcnResult<Self> {
        let dir = dir.as_ref();
        let image_dir = require_dir(dir.join("image_2"), "image directory")?;
        let label_dir = require_dir(dir.join("gt_image_2"), "ground-truth directory")?;

        let labels: HashMap<String, PathBuf> = png_files(&label_dir)?
            .into_iter()
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?;
                name.contains("_road_")
                    .then(|| (collapse_label_name(name), path.clone()))
            })
            .collect();

        let files = png_files(&image_dir)?;
        if files.is_empty() {
            return Err(FcnError::DatasetError {
                message: format!("no PNG images in {}", image_dir.display()),
            });
        }

        let mut items = Vec::with_capacity(files.len());
        for image_path in &files {
            let name = file_name(image_path);
            let label_path = labels.get(&name).ok_or_else(|| FcnError::DatasetError {
                message: format!(
                    "no road ground truth for {} in {}",
                    name,
                    label_dir.display()
                ),
            })?;

            let image = load_rgb(image_path, image_shape, FilterType::Triangle)?;
            let label = load_rgb(label_path, image_shape, FilterType::Nearest)?;
            items.push(SegmentationItem {
                image: normalize(&image, normalization),
                classes: road_classes(&label),
                height: image_shape[0],
                width: image_shape[1],
            });
        }

        tracing::info!(
            count = items.len(),
            dir = %dir.display(),
            "loaded road dataset"
        );

        Ok(Self { items, files })
    }

    /// Source image paths, in item order.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

impl Dataset<SegmentationItem> for RoadDataset {
    fn get(&self, index: usize) -> Option<SegmentationItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// `um_road_000000.png` -> `um_000000.png`.
fn collapse_label_name(name: &str) -> String {
    name.replacen("_road_", "_", 1).replacen("_lane_", "_", 1)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn require_dir(path: PathBuf, what: &'static str) -> FcnResult<PathBuf> {
    if path.is_dir() {
        Ok(path)
    } else {
        Err(FcnError::MissingResource { what, path })
    }
}

/// The `.png` files directly inside `dir`, sorted by name.
pub fn png_files(dir: &Path) -> FcnResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|source| FcnError::DirectoryReadFailed {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if entry.file_type().is_file()
            && path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("png"))
        {
            files.push(path.to_path_buf());
        }
    }
    Ok(files)
}

/// Decode `path` as RGB and resize it to `[height, width]`.
pub fn load_rgb(path: &Path, [height, width]: [usize; 2], filter: FilterType) -> FcnResult<RgbImage> {
    let image = image::open(path)
        .map_err(|source| FcnError::ImageOpenFailed {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();

    let (width, height) = (dimension(width)?, dimension(height)?);
    if image.dimensions() == (width, height) {
        return Ok(image);
    }
    Ok(image::imageops::resize(&image, width, height, filter))
}

fn dimension(side: usize) -> FcnResult<u32> {
    u32::try_from(side).map_err(|_| FcnError::InvalidConfiguration {
        reason: format!("image side {side} does not fit in u32"),
    })
}

/// Row-major `[height, width, 3]` floats.
pub fn normalize(image: &RgbImage, normalization: Normalization) -> Vec<f32> {
    image
        .pixels()
        .flat_map(|pixel| {
            let [r, g, b] = pixel.0;
            [
                normalization.apply(r, 0),
                normalization.apply(g, 1),
                normalization.apply(b, 2),
            ]
        })
        .collect()
}

fn road_classes(label: &RgbImage) -> Vec<u8> {
    label
        .pixels()
        .map(|pixel| {
            if *pixel == BACKGROUND_COLOR {
                BACKGROUND_CLASS
            } else {
                ROAD_CLASS
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::tests::{scratch_dir, TestBackend};

    const ROAD: Rgb<u8> = Rgb([255, 0, 255]);

    fn write_png(path: &Path, width: u32, height: u32, color: impl Fn(u32, u32) -> Rgb<u8>) {
        RgbImage::from_fn(width, height, color).save(path).unwrap();
    }

    /// Two 8x4 images; the lower half of each label is road.
    fn kitti_layout(name: &str) -> PathBuf {
        let dir = scratch_dir(name);
        fs::create_dir_all(dir.join("image_2")).unwrap();
        fs::create_dir_all(dir.join("gt_image_2")).unwrap();

        for id in ["000000", "000001"] {
            write_png(
                &dir.join("image_2").join(format!("um_{id}.png")),
                8,
                4,
                |x, _| Rgb([x as u8 * 10, 100, 200]),
            );
            write_png(
                &dir.join("gt_image_2").join(format!("um_road_{id}.png")),
                8,
                4,
                |_, y| if y >= 2 { ROAD } else { BACKGROUND_COLOR },
            );
            write_png(
                &dir.join("gt_image_2").join(format!("um_lane_{id}.png")),
                8,
                4,
                |_, _| BACKGROUND_COLOR,
            );
        }
        dir
    }

    #[test]
    fn label_names_collapse_to_image_names() {
        assert_eq!(collapse_label_name("um_road_000000.png"), "um_000000.png");
        assert_eq!(collapse_label_name("uu_lane_000093.png"), "uu_000093.png");
    }

    #[test]
    fn pairs_images_with_road_ground_truth() {
        let dir = kitti_layout("dataset-pairs");

        let dataset = RoadDataset::load(&dir, [4, 8], Normalization::Raw).unwrap();

        assert_eq!(dataset.len(), 2);
        assert!(dataset.files()[0].ends_with("um_000000.png"));
        let item = dataset.get(0).unwrap();
        assert_eq!((item.height, item.width), (4, 8));
        assert_eq!(item.image.len(), 4 * 8 * 3);
        assert_eq!(&item.image[3..6], &[10.0, 100.0, 200.0]);
        // Top two rows background, bottom two road; the lane file is ignored.
        assert!(item.classes[..16].iter().all(|&c| c == BACKGROUND_CLASS));
        assert!(item.classes[16..].iter().all(|&c| c == ROAD_CLASS));
    }

    #[test]
    fn resizes_to_the_requested_shape() {
        let dir = kitti_layout("dataset-resize");

        let item = RoadDataset::load(&dir, [2, 4], Normalization::Unit)
            .unwrap()
            .get(1)
            .unwrap();

        assert_eq!(item.classes, vec![0, 0, 0, 0, 1, 1, 1, 1]);
        assert!(item.image.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn batches_are_one_hot_and_restartable() {
        let dir = kitti_layout("dataset-batches");
        let source = BatchedDataset::new(
            RoadDataset::load(&dir, [4, 8], Normalization::Raw).unwrap(),
            SegmentationBatcher::new(NUM_ROAD_CLASSES),
        );
        let device = <TestBackend as Backend>::Device::default();

        assert_eq!(BatchSource::<TestBackend>::num_batches(&source, 1), 2);
        assert_eq!(BatchSource::<TestBackend>::num_batches(&source, 5), 1);

        for _ in 0..2 {
            let batches: Vec<SegmentationBatch<TestBackend>> =
                source.batches(1, &device).collect();
            assert_eq!(batches.len(), 2);
            assert_eq!(batches[0].images.dims(), [1, 3, 4, 8]);
            assert_eq!(batches[0].labels.dims(), [1, 2, 4, 8]);

            let per_pixel = batches[0].labels.clone().sum_dim(1);
            let ones = Tensor::<TestBackend, 4>::ones([1, 1, 4, 8], &device);
            assert!(per_pixel.equal(ones).all().into_scalar());

            let road = batches[0]
                .labels
                .clone()
                .slice([0..1, 1..2, 2..4, 0..8])
                .sum()
                .into_scalar();
            assert_eq!(road, 16.0);
        }

        let batches: Vec<SegmentationBatch<TestBackend>> = source.batches(5, &device).collect();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].images.dims(), [2, 3, 4, 8]);
    }

    #[test]
    fn image_without_ground_truth_is_an_error() {
        let dir = kitti_layout("dataset-unlabeled");
        write_png(&dir.join("image_2").join("um_000002.png"), 8, 4, |_, _| {
            Rgb([0, 0, 0])
        });

        match RoadDataset::load(&dir, [4, 8], Normalization::Raw) {
            Err(FcnError::DatasetError { message }) => assert!(message.contains("um_000002.png")),
            other => panic!("expected DatasetError, got {other:?}"),
        }
    }

    #[test]
    fn missing_and_empty_directories_are_reported() {
        let dir = scratch_dir("dataset-missing");
        assert!(matches!(
            RoadDataset::load(&dir, [4, 8], Normalization::Raw),
            Err(FcnError::MissingResource { .. })
        ));

        fs::create_dir_all(dir.join("image_2")).unwrap();
        fs::create_dir_all(dir.join("gt_image_2")).unwrap();
        assert!(matches!(
            RoadDataset::load(&dir, [4, 8], Normalization::Raw),
            Err(FcnError::DatasetError { .. })
        ));
    }

    #[test]
    fn corrupt_image_is_reported() {
        let dir = kitti_layout("dataset-corrupt");
        fs::write(dir.join("image_2").join("um_000001.png"), b"not a png").unwrap();

        assert!(matches!(
            RoadDataset::load(&dir, [4, 8], Normalization::Raw),
            Err(FcnError::ImageOpenFailed { .. })
        ));
    }
}
