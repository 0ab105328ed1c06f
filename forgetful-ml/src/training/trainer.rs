//! SGD training loop, evaluation and batch prediction.

use std::path::PathBuf;
use std::time::Instant;

use burn::{
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::{GradientsParams, Optimizer, SgdConfig, momentum::MomentumConfig},
    tensor::{ElementConversion, Int, Tensor, backend::AutodiffBackend, backend::Backend},
};
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::data::{BatchStream, ImageBatcher, ImageDataset};
use crate::error::ForgetError;
use crate::model::{ClassifierConfig, ImageClassifier, record_file};
use crate::training::callbacks::{CallbackAction, TrainingCallback};
use crate::training::checkpoint::CheckpointManager;
use crate::training::metrics::{ClassificationMetrics, EpochMetrics, TrainingHistory};

/// Hyperparameters of one `fit` call.
#[derive(Debug, Clone, PartialEq)]
pub struct FitOptions {
    pub epochs: usize,
    pub steps_per_epoch: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub momentum: f64,
    pub seed: u64,
    pub augment: bool,
}

impl FitOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            epochs: config.train.epochs,
            steps_per_epoch: config.steps_per_epoch(),
            batch_size: config.train.batch_size,
            learning_rate: config.train.learning_rate,
            momentum: config.train.momentum,
            seed: config.train.seed,
            augment: config.data.augment,
        }
    }
}

/// Per-step hook around optimizer updates.
pub trait StepHook<B: Backend> {
    /// Runs before the forward pass of global step `step`.
    fn before_step(
        &mut self,
        _step: usize,
        model: ImageClassifier<B>,
    ) -> Result<ImageClassifier<B>, ForgetError> {
        Ok(model)
    }

    /// Runs right after the optimizer update of global step `step`.
    fn after_step(
        &mut self,
        _step: usize,
        model: ImageClassifier<B>,
    ) -> Result<ImageClassifier<B>, ForgetError> {
        Ok(model)
    }

    fn on_epoch_end(
        &mut self,
        _epoch: usize,
        _model: &ImageClassifier<B>,
    ) -> Result<(), ForgetError> {
        Ok(())
    }
}

/// A hook that does nothing.
pub struct NoHook;

impl<B: Backend> StepHook<B> for NoHook {}

/// Where `CallbackAction::Checkpoint` saves the model.
pub struct CheckpointTarget {
    pub path: PathBuf,
    pub config: ClassifierConfig,
    pub manager: CheckpointManager,
}

impl CheckpointTarget {
    pub fn new(path: PathBuf, config: ClassifierConfig) -> Self {
        let manager = CheckpointManager::new(&path, 10);
        Self {
            path,
            config,
            manager,
        }
    }
}

/// Runs `fit` with callbacks and an optional checkpoint target.
pub struct Trainer<B: AutodiffBackend> {
    options: FitOptions,
    callbacks: Vec<Box<dyn TrainingCallback>>,
    checkpoint: Option<CheckpointTarget>,
    device: B::Device,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(options: FitOptions, device: B::Device) -> Self {
        Self {
            options,
            callbacks: Vec::new(),
            checkpoint: None,
            device,
        }
    }

    pub fn with_callback(mut self, callback: impl TrainingCallback + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    pub fn with_checkpoint(mut self, target: CheckpointTarget) -> Self {
        self.checkpoint = Some(target);
        self
    }

    pub fn options(&self) -> &FitOptions {
        &self.options
    }

    /// Train for `epochs` epochs of `steps_per_epoch` batches each.
    ///
    /// Every epoch ends with a full pass over `validation`. Returns the final
    /// model (not the best checkpoint) and its history.
    pub fn fit(
        &mut self,
        mut model: ImageClassifier<B>,
        train: &ImageDataset,
        validation: &ImageDataset,
        hook: &mut dyn StepHook<B>,
    ) -> Result<(ImageClassifier<B>, TrainingHistory), ForgetError> {
        let options = self.options.clone();
        if options.steps_per_epoch == 0 {
            return Err(ForgetError::training(format!(
                "no full batch of {} fits in {} training samples",
                options.batch_size,
                train.samples().len()
            )));
        }

        let mut optimizer = SgdConfig::new()
            .with_momentum(Some(
                MomentumConfig::new()
                    .with_momentum(options.momentum)
                    .with_dampening(0.0),
            ))
            .init::<B, ImageClassifier<B>>();
        let loss_fn = CrossEntropyLossConfig::new().init(&self.device);
        let mut stream =
            BatchStream::new(train, options.batch_size, options.seed, options.augment)?;
        let batcher = ImageBatcher::for_dataset(train);

        tracing::info!(
            epochs = options.epochs,
            steps_per_epoch = options.steps_per_epoch,
            batch_size = options.batch_size,
            learning_rate = options.learning_rate,
            "Starting training"
        );

        let started = Instant::now();
        let mut history = TrainingHistory::default();
        let mut step = 0usize;

        for epoch in 1..=options.epochs {
            let mut loss_sum = 0.0;
            let mut correct = 0usize;
            let mut seen = 0usize;

            for _ in 0..options.steps_per_epoch {
                model = hook.before_step(step, model)?;

                let items = stream.next_items()?;
                let batch = batcher.try_batch::<B>(&items, &self.device)?;
                let n = batch.len();

                let logits = model.forward(batch.images);
                let loss = loss_fn.forward(logits.clone(), batch.targets.clone());
                let loss_value: f64 = loss.clone().into_scalar().elem();
                correct += count_correct(logits, batch.targets);
                loss_sum += loss_value * n as f64;
                seen += n;

                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optimizer.step(options.learning_rate, model, grads);
                model = hook.after_step(step, model)?;

                tracing::trace!(epoch, step, loss = loss_value, "Step");
                step += 1;
            }

            let valid =
                evaluate_loss(&model.valid(), validation, options.batch_size, &self.device)?;
            let metrics = EpochMetrics {
                loss: loss_sum / seen as f64,
                accuracy: correct as f64 / seen as f64,
                val_loss: valid.loss,
                val_accuracy: valid.accuracy,
            };
            history.record_epoch(metrics);
            hook.on_epoch_end(epoch, &model)?;

            tracing::info!(
                epoch,
                loss = metrics.loss,
                accuracy = metrics.accuracy,
                val_loss = metrics.val_loss,
                val_accuracy = metrics.val_accuracy,
                "Epoch complete"
            );

            let mut stop = false;
            for callback in &mut self.callbacks {
                match callback.on_epoch_end(epoch, &history) {
                    CallbackAction::Continue => {}
                    CallbackAction::Stop => stop = true,
                    CallbackAction::Checkpoint => {
                        if let Some(target) = &self.checkpoint {
                            model.save(&target.config, &target.path)?;
                            target
                                .manager
                                .record(epoch, metrics.val_loss, &record_file(&target.path))?;
                        }
                    }
                }
            }
            if stop {
                tracing::warn!(epoch, "Training stopped early by callback");
                break;
            }
        }

        history.total_training_time_secs = started.elapsed().as_secs_f64();
        Ok((model, history))
    }
}

fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let n = targets.dims()[0];
    let correct: i64 = logits
        .argmax(1)
        .reshape([n])
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem();
    correct as usize
}

/// Mean loss and top-1 accuracy over a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossAccuracy {
    pub loss: f64,
    pub accuracy: f64,
}

/// Loss weighted by batch size and top-1 accuracy over every sample, in order.
pub fn evaluate_loss<B: Backend>(
    model: &ImageClassifier<B>,
    dataset: &ImageDataset,
    batch_size: usize,
    device: &B::Device,
) -> Result<LossAccuracy, ForgetError> {
    let total = dataset.samples().len();
    if total == 0 {
        return Err(ForgetError::dataset("cannot evaluate on an empty dataset"));
    }
    let batcher = ImageBatcher::for_dataset(dataset);
    let loss_fn = CrossEntropyLossConfig::new().init(device);
    let mut loss_sum = 0.0;
    let mut correct = 0usize;

    for start in (0..total).step_by(batch_size.max(1)) {
        let items = dataset.load_range(start..(start + batch_size).min(total))?;
        let batch = batcher.try_batch::<B>(&items, device)?;
        let n = batch.len();
        let logits = model.forward(batch.images);
        let loss: f64 = loss_fn
            .forward(logits.clone(), batch.targets.clone())
            .into_scalar()
            .elem();
        loss_sum += loss * n as f64;
        correct += count_correct(logits, batch.targets);
    }

    Ok(LossAccuracy {
        loss: loss_sum / total as f64,
        accuracy: correct as f64 / total as f64,
    })
}

/// One classified image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub path: String,
    pub target: usize,
    pub predicted: usize,
    pub probabilities: Vec<f32>,
}

impl Prediction {
    pub fn confidence(&self) -> f32 {
        self.probabilities.get(self.predicted).copied().unwrap_or(0.0)
    }
}

/// Softmax predictions for every sample of `dataset`, in order.
pub fn predict<B: Backend>(
    model: &ImageClassifier<B>,
    dataset: &ImageDataset,
    batch_size: usize,
    device: &B::Device,
) -> Result<Vec<Prediction>, ForgetError> {
    let total = dataset.samples().len();
    let batcher = ImageBatcher::for_dataset(dataset);
    let mut predictions = Vec::with_capacity(total);

    for start in (0..total).step_by(batch_size.max(1)) {
        let items = dataset.load_range(start..(start + batch_size).min(total))?;
        let batch = batcher.try_batch::<B>(&items, device)?;
        let probs = model.forward_probs(batch.images);
        let [_, classes] = probs.dims();
        let values: Vec<f32> = probs
            .into_data()
            .convert::<f32>()
            .to_vec()
            .map_err(|e| ForgetError::model(format!("{e:?}")))?;

        for (item, row) in items.iter().zip(values.chunks_exact(classes)) {
            let predicted = row
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .unwrap_or(0);
            predictions.push(Prediction {
                path: item.path.clone(),
                target: item.label,
                predicted,
                probabilities: row.to_vec(),
            });
        }
    }
    Ok(predictions)
}

/// Classification metrics from predictions.
pub fn score(predictions: &[Prediction], num_classes: usize) -> ClassificationMetrics {
    ClassificationMetrics::from_pairs(
        predictions.iter().map(|p| (p.target, p.predicted)),
        num_classes,
    )
}
