//! Pixel-wise softmax cross-entropy.
//!
//! Score and label maps are flattened into a `[pixels, classes]` matrix (one
//! row per pixel) and the loss is the mean over rows of the cross-entropy
//! between each logit row and its one-hot label row.

use burn::{prelude::*, tensor::activation::log_softmax};

use crate::{error::FcnResult, shape::ensure_same_dims};

/// Configuration for [`PixelCrossEntropy`].
#[derive(Config, Debug)]
pub struct PixelCrossEntropyConfig {
    /// Number of classes, i.e. the channel count of both maps.
    pub num_classes: usize,
}

impl PixelCrossEntropyConfig {
    pub fn init(&self) -> PixelCrossEntropy {
        PixelCrossEntropy {
            num_classes: self.num_classes,
        }
    }
}

/// Mean per-pixel softmax cross-entropy against one-hot labels.
#[derive(Debug, Clone)]
pub struct PixelCrossEntropy {
    num_classes: usize,
}

/// Flattened logits and the scalar loss built from them.
#[derive(Debug, Clone)]
pub struct PixelObjective<B: Backend> {
    /// `[pixels, num_classes]`, one row per pixel.
    pub logits: Tensor<B, 2>,
    /// Mean cross-entropy, shape `[1]`.
    pub loss: Tensor<B, 1>,
}

impl PixelCrossEntropy {
    /// Build the objective for a score map and a one-hot label map,
    /// both `[batch, num_classes, height, width]`.
    ///
    /// # Errors
    ///
    /// Returns [`FcnError::ShapeMismatch`](crate::FcnError::ShapeMismatch) if
    /// the maps differ in any dimension or do not carry `num_classes` channels.
    pub fn forward<B: Backend>(
        &self,
        score_map: Tensor<B, 4>,
        label_map: Tensor<B, 4>,
    ) -> FcnResult<PixelObjective<B>> {
        let score_dims = score_map.dims();
        ensure_same_dims("score_map", score_dims, "label_map", label_map.dims())?;

        let [batch, _, height, width] = score_dims;
        ensure_same_dims(
            "score_map",
            score_dims,
            "num_classes",
            [batch, self.num_classes, height, width],
        )?;

        let logits = flatten_pixels(score_map);
        let labels = flatten_pixels(label_map);
        let loss = softmax_cross_entropy(logits.clone(), labels).mean();

        Ok(PixelObjective { logits, loss })
    }
}

/// `[batch, classes, height, width]` to `[batch * height * width, classes]`.
pub fn flatten_pixels<B: Backend>(map: Tensor<B, 4>) -> Tensor<B, 2> {
    let [batch, classes, height, width] = map.dims();
    map.permute([0, 2, 3, 1])
        .reshape([batch * height * width, classes])
}

/// Cross-entropy of each row against one-hot (or soft) `labels`, `[rows]`.
///
/// [`log_softmax`] shifts by the row maximum, so large logits do not overflow.
pub fn softmax_cross_entropy<B: Backend>(logits: Tensor<B, 2>, labels: Tensor<B, 2>) -> Tensor<B, 1> {
    (labels * log_softmax(logits, 1)).sum_dim(1).neg().squeeze(1)
}

#[cfg(test)]
mod tests {
    use burn::tensor::{Distribution, Int};

    use super::*;
    use crate::{tests::TestBackend, FcnError};

    fn one_hot_map(
        classes: &[usize],
        num_classes: usize,
        shape: [usize; 3],
        device: &<TestBackend as Backend>::Device,
    ) -> Tensor<TestBackend, 4> {
        let [batch, height, width] = shape;
        let pixels = batch * height * width;
        let mut data = vec![0.0f32; pixels * num_classes];
        for (pixel, &class) in classes.iter().enumerate() {
            data[pixel * num_classes + class] = 1.0;
        }
        Tensor::<TestBackend, 4>::from_data(
            TensorData::new(data, [batch, height, width, num_classes]),
            device,
        )
        .permute([0, 3, 1, 2])
    }

    #[test]
    fn flatten_puts_one_pixel_per_row() {
        let device = Default::default();
        let map = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(
                vec![1.0f32, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0],
                [1, 2, 2, 2],
            ),
            &device,
        );

        let rows = flatten_pixels(map).into_data().to_vec::<f32>().unwrap();

        assert_eq!(rows, vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0, 4.0, 40.0]);
    }

    #[test]
    fn loss_is_invariant_to_pixel_order() {
        let device = Default::default();
        let scores = Tensor::<TestBackend, 4>::random(
            [2, 3, 2, 2],
            Distribution::Normal(0.0, 3.0),
            &device,
        );
        let labels = one_hot_map(&[0, 2, 1, 1, 0, 2, 2, 1], 3, [2, 2, 2], &device);

        let criterion = PixelCrossEntropyConfig::new(3).init();
        let reference = criterion
            .forward(scores.clone(), labels.clone())
            .unwrap()
            .loss
            .into_scalar();

        let order = Tensor::<TestBackend, 1, Int>::from_ints([5, 2, 7, 0, 3, 6, 1, 4], &device);
        let permuted_logits = flatten_pixels(scores).select(0, order.clone());
        let permuted_labels = flatten_pixels(labels).select(0, order);
        let permuted = softmax_cross_entropy(permuted_logits, permuted_labels)
            .mean()
            .into_scalar();

        assert!((reference - permuted).abs() < 1e-5);
    }

    #[test]
    fn confident_correct_logits_give_near_zero_loss() {
        let device = Default::default();
        let classes = [1, 0, 0, 1];
        let labels = one_hot_map(&classes, 2, [1, 2, 2], &device);
        let scores = labels.clone().mul_scalar(2000.0).sub_scalar(1000.0);

        let loss = PixelCrossEntropyConfig::new(2)
            .init()
            .forward(scores, labels)
            .unwrap()
            .loss
            .into_scalar();

        assert!(loss.is_finite());
        assert!(loss.abs() < 1e-6, "loss = {loss}");
    }

    #[test]
    fn confident_wrong_logits_stay_finite() {
        let device = Default::default();
        let labels = one_hot_map(&[1, 0], 2, [1, 1, 2], &device);
        let scores = labels.clone().mul_scalar(-2000.0).add_scalar(1000.0);

        let loss = PixelCrossEntropyConfig::new(2)
            .init()
            .forward(scores, labels)
            .unwrap()
            .loss
            .into_scalar();

        assert!((loss - 2000.0).abs() < 1e-2, "loss = {loss}");
    }

    #[test]
    fn two_class_rows_match_logistic_loss() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_floats(
            [[0.5, -1.5], [3.0, 3.0], [-40.0, 60.0]],
            &device,
        );
        let labels =
            Tensor::<TestBackend, 2>::from_floats([[1.0, 0.0], [0.0, 1.0], [0.0, 1.0]], &device);

        let losses = softmax_cross_entropy(logits, labels)
            .into_data()
            .to_vec::<f32>()
            .unwrap();

        let logistic = |margin: f32| (1.0 + (-margin).exp()).ln();
        let expected = [logistic(2.0), logistic(0.0), logistic(100.0)];
        for (loss, expected) in losses.iter().zip(expected) {
            assert!((loss - expected).abs() < 1e-5, "{loss} != {expected}");
        }
    }

    #[test]
    fn uniform_logits_give_log_num_classes() {
        let device = Default::default();
        let labels = one_hot_map(&[0, 1, 2, 3], 4, [1, 2, 2], &device);
        let scores = Tensor::<TestBackend, 4>::zeros([1, 4, 2, 2], &device);

        let objective = PixelCrossEntropyConfig::new(4)
            .init()
            .forward(scores, labels)
            .unwrap();

        assert_eq!(objective.logits.dims(), [4, 4]);
        assert!((objective.loss.into_scalar() - 4f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn label_shape_mismatch_is_rejected() {
        let device = Default::default();
        let scores = Tensor::<TestBackend, 4>::zeros([1, 2, 4, 4], &device);
        let labels = Tensor::<TestBackend, 4>::zeros([1, 2, 4, 8], &device);

        let err = PixelCrossEntropyConfig::new(2)
            .init()
            .forward(scores, labels)
            .unwrap_err();

        match err {
            FcnError::ShapeMismatch {
                left, right, axis, ..
            } => {
                assert_eq!(left, "score_map");
                assert_eq!(right, "label_map");
                assert_eq!(axis, "width");
            }
            other => panic!("expected ShapeMismatch, got {other:?}"),
        }
    }
}
