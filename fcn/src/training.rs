//! Adam training loop.
//!
//! The loop is a plain epoch/batch iteration: no shuffling, validation,
//! early stopping or checkpointing. Each batch produces exactly one update.

use burn::{
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};

use crate::{
    dataset::{BatchSource, SegmentationBatch},
    error::{FcnError, FcnResult},
    loss::{PixelCrossEntropy, PixelCrossEntropyConfig},
    models::Fcn,
};

/// Loss statistics of one pass over the batch source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    /// One-based epoch number.
    pub epoch: usize,
    pub steps: usize,
    /// Mean cross-entropy over the epoch's batches.
    pub mean_loss: f32,
    /// Cross-entropy of the epoch's last batch.
    pub last_loss: f32,
}

/// Outcome of [`Trainer::fit`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub epochs: Vec<EpochSummary>,
    pub total_steps: usize,
}

impl TrainingReport {
    /// Cross-entropy of the very last step.
    pub fn final_loss(&self) -> Option<f32> {
        self.epochs.last().map(|epoch| epoch.last_loss)
    }
}

/// Owns the model and optimizer state for the duration of a run.
pub struct Trainer<B: AutodiffBackend, O: Optimizer<Fcn<B>, B>> {
    model: Fcn<B>,
    optimizer: O,
    criterion: PixelCrossEntropy,
    learning_rate: f64,
    device: B::Device,
    epoch: usize,
    step: usize,
}

/// A trainer using Adam with `config`'s moments and epsilon.
pub fn adam_trainer<B: AutodiffBackend>(
    model: Fcn<B>,
    config: &AdamConfig,
    learning_rate: f64,
    device: &B::Device,
) -> FcnResult<Trainer<B, impl Optimizer<Fcn<B>, B>>> {
    Trainer::new(model, config.init::<B, Fcn<B>>(), learning_rate, device)
}

impl<B: AutodiffBackend, O: Optimizer<Fcn<B>, B>> Trainer<B, O> {
    /// # Errors
    ///
    /// - [`FcnError::EnvironmentPrecondition`] if the backend cannot record
    ///   gradients.
    /// - [`FcnError::InvalidConfiguration`] for a non-positive learning rate.
    pub fn new(
        model: Fcn<B>,
        optimizer: O,
        learning_rate: f64,
        device: &B::Device,
    ) -> FcnResult<Self> {
        if !B::ad_enabled() {
            return Err(FcnError::EnvironmentPrecondition {
                reason: "training requires a backend with automatic differentiation".to_string(),
            });
        }
        if learning_rate.is_nan() || learning_rate <= 0.0 {
            return Err(FcnError::InvalidConfiguration {
                reason: format!("learning_rate must be positive, got {learning_rate}"),
            });
        }

        let criterion = PixelCrossEntropyConfig::new(model.num_classes()).init();
        Ok(Self {
            model,
            optimizer,
            criterion,
            learning_rate,
            device: device.clone(),
            epoch: 0,
            step: 0,
        })
    }

    pub fn model(&self) -> &Fcn<B> {
        &self.model
    }

    pub fn into_model(self) -> Fcn<B> {
        self.model
    }

    /// Global step count so far.
    pub fn steps(&self) -> usize {
        self.step
    }

    /// Run one update on `batch` and return its cross-entropy.
    ///
    /// The minimized objective also includes the decoder's L2 penalty when
    /// enabled.
    ///
    /// # Errors
    ///
    /// [`FcnError::NonFiniteLoss`] if the objective is NaN or infinite; the
    /// parameters are left untouched in that case.
    pub fn step(&mut self, batch: SegmentationBatch<B>) -> FcnResult<f32> {
        self.step += 1;

        let scores = self.model.forward(batch.images)?;
        let objective = self.criterion.forward(scores, batch.labels)?;
        let loss: f32 = objective.loss.clone().into_scalar().elem();

        let total = match self.model.regularization() {
            Some(penalty) => objective.loss + penalty,
            None => objective.loss,
        };
        let total_value: f32 = total.clone().into_scalar().elem();
        if !loss.is_finite() || !total_value.is_finite() {
            let value = if loss.is_finite() { total_value } else { loss };
            tracing::error!(epoch = self.epoch, step = self.step, value, "loss is not finite");
            return Err(FcnError::NonFiniteLoss {
                epoch: self.epoch,
                step: self.step,
                value,
            });
        }

        let grads = GradientsParams::from_grads(total.backward(), &self.model);
        self.model = self
            .optimizer
            .step(self.learning_rate, self.model.clone(), grads);

        Ok(loss)
    }

    /// Train for `num_epochs` full passes over `source`.
    ///
    /// # Errors
    ///
    /// Stops at the first failing step. A source that yields no batches is a
    /// [`FcnError::DatasetError`].
    pub fn fit(
        &mut self,
        source: &dyn BatchSource<B>,
        num_epochs: usize,
        batch_size: usize,
    ) -> FcnResult<TrainingReport> {
        if batch_size == 0 {
            return Err(FcnError::InvalidConfiguration {
                reason: "batch_size must be at least 1".to_string(),
            });
        }

        let device = self.device.clone();
        let mut report = TrainingReport::default();

        tracing::info!(
            num_epochs,
            batch_size,
            batches_per_epoch = source.num_batches(batch_size),
            learning_rate = self.learning_rate,
            "starting training"
        );

        for _ in 0..num_epochs {
            self.epoch += 1;
            tracing::info!("EPOCH {} ...", self.epoch);

            let mut losses = Vec::new();
            for batch in source.batches(batch_size, &device) {
                let loss = self.step(batch)?;
                tracing::info!("Loss = {loss:.3}");
                losses.push(loss);
            }

            let Some(&last_loss) = losses.last() else {
                return Err(FcnError::DatasetError {
                    message: "batch source yielded no batches".to_string(),
                });
            };
            let summary = EpochSummary {
                epoch: self.epoch,
                steps: losses.len(),
                mean_loss: losses.iter().sum::<f32>() / losses.len() as f32,
                last_loss,
            };
            tracing::debug!(
                epoch = summary.epoch,
                mean_loss = summary.mean_loss,
                "epoch finished"
            );
            report.total_steps += summary.steps;
            report.epochs.push(summary);
        }

        Ok(report)
    }
}
