//! The `ForgetModel` orchestrator.
//!
//! Owns the configuration, the data splits, the trained classifier and its
//! pruned counterpart, and sequences build, training, pruning, export and
//! prediction. Operations called before their prerequisites return an error.

use std::path::{Path, PathBuf};

use burn::module::AutodiffModule;
use burn::tensor::backend::AutodiffBackend;

use crate::config::PipelineConfig;
use crate::data::{CelebaDataLoader, DataSource, DataSplits};
use crate::error::ForgetError;
use crate::export::{ExportOptions, serialize, write_artifact};
use crate::model::{ClassifierConfig, ImageClassifier, LayerInfo};
use crate::pruning::{Pruner, PruningSchedule, model_sparsity};
use crate::training::{
    AnomalyDetection, CheckpointTarget, ClassificationMetrics, EarlyStopping, FitOptions,
    ModelCheckpoint, Monitor, NoHook, Prediction, Trainer, TrainingHistory, predict, score,
};

/// Where `prune` left its outputs.
#[derive(Debug, Clone)]
pub struct PruneReport {
    /// Burn record of the stripped, pruned model.
    pub record: PathBuf,
    /// Mobile artifact exported from it.
    pub artifact: PathBuf,
    pub sparsity: f64,
    pub history: TrainingHistory,
}

/// Image classifier pipeline: InceptionV3 transfer learning, pruning, export.
pub struct ForgetModel<B: AutodiffBackend> {
    config: PipelineConfig,
    classifier: ClassifierConfig,
    device: B::Device,
    data: Option<DataSplits>,
    model: Option<ImageClassifier<B>>,
    pruned: Option<ImageClassifier<B>>,
    history: Option<TrainingHistory>,
    predictions: Option<Vec<Prediction>>,
}

impl<B: AutodiffBackend> ForgetModel<B> {
    pub fn new(config: PipelineConfig, device: B::Device) -> Result<Self, ForgetError> {
        config.validate()?;
        let classifier = ClassifierConfig::from_model_config(&config.model);
        tracing::info!(
            img_height = config.data.img_height,
            img_width = config.data.img_width,
            steps_per_epoch = config.steps_per_epoch(),
            epochs = config.train.epochs,
            "Pipeline configured"
        );
        Ok(Self {
            config,
            classifier,
            device,
            data: None,
            model: None,
            pruned: None,
            history: None,
            predictions: None,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn classifier_config(&self) -> &ClassifierConfig {
        &self.classifier
    }

    pub fn steps_per_epoch(&self) -> usize {
        self.config.steps_per_epoch()
    }

    pub fn model(&self) -> Option<&ImageClassifier<B>> {
        self.model.as_ref()
    }

    pub fn pruned_model(&self) -> Option<&ImageClassifier<B>> {
        self.pruned.as_ref()
    }

    pub fn history(&self) -> Option<&TrainingHistory> {
        self.history.as_ref()
    }

    pub fn data(&self) -> Option<&DataSplits> {
        self.data.as_ref()
    }

    /// Load the CelebA splits described by the configuration.
    pub fn load_data(&mut self) -> Result<(), ForgetError> {
        self.load_data_from(&CelebaDataLoader::new())
    }

    pub fn load_data_from(&mut self, source: &dyn DataSource) -> Result<(), ForgetError> {
        let splits = source.load_data(&self.config)?;
        self.set_data(splits);
        Ok(())
    }

    pub fn set_data(&mut self, splits: DataSplits) {
        let (train, validation, test) = splits.sizes();
        tracing::info!(train, validation, test, "Data loaded");
        self.data = Some(splits);
        self.predictions = None;
    }

    fn data_or_err(&self) -> Result<&DataSplits, ForgetError> {
        self.data
            .as_ref()
            .ok_or_else(|| ForgetError::dataset("no data loaded; call load_data first"))
    }

    fn model_or_err(&self) -> Result<&ImageClassifier<B>, ForgetError> {
        self.model
            .as_ref()
            .ok_or_else(|| ForgetError::model("model not built; call build first"))
    }

    /// Backbone plus head, with the leading layers frozen.
    pub fn build(&mut self) -> Result<(), ForgetError> {
        let mut model = self.classifier.init::<B>(&self.device);
        if let Some(weights) = &self.config.model.backbone_weights {
            model = model.load_backbone(weights, &self.device)?;
        } else {
            tracing::warn!("No pretrained backbone weights configured, starting from random init");
        }
        let model = model.freeze();

        let layers = model.layers();
        let frozen = layers.iter().filter(|l| !l.trainable).count();
        let params: usize = layers.iter().map(|l| l.params).sum();
        tracing::info!(layers = layers.len(), frozen, params, "Model built");

        self.model = Some(model);
        self.pruned = None;
        self.predictions = None;
        Ok(())
    }

    pub fn layers(&self) -> Result<Vec<LayerInfo>, ForgetError> {
        Ok(self.model_or_err()?.layers())
    }

    /// Fine-tune and return the `(loss, val_loss)` histories.
    ///
    /// The best weights by validation loss go to `checkpoint_path`; the final
    /// weights to `baseline_path`.
    pub fn train(&mut self) -> Result<(Vec<f64>, Vec<f64>), ForgetError> {
        let model = self.model_or_err()?.clone();
        let data = self.data_or_err()?;
        let train = &self.config.train;

        let options = FitOptions::from_config(&self.config);
        let mut trainer = Trainer::<B>::new(options, self.device.clone())
            .with_callback(ModelCheckpoint::new(Monitor::ValLoss, true))
            .with_callback(AnomalyDetection::default())
            .with_checkpoint(CheckpointTarget::new(
                train.checkpoint_path.clone(),
                self.classifier.clone(),
            ));
        if let Some(patience) = train.early_stopping_patience {
            trainer = trainer.with_callback(EarlyStopping::new(patience, 0.0));
        }

        let (model, history) = trainer.fit(model, &data.train, &data.validation, &mut NoHook)?;
        let baseline = model.save(&self.classifier, &train.baseline_path)?;
        tracing::info!(path = %baseline.display(), "Model saved");

        let losses = (history.loss.clone(), history.val_loss.clone());
        self.model = Some(model);
        self.history = Some(history);
        self.predictions = None;
        Ok(losses)
    }

    /// Replace the model weights with a saved record.
    pub fn load(&mut self, weights: &Path) -> Result<(), ForgetError> {
        let model = self.model_or_err()?.clone();
        let model = model.load(&self.classifier, weights, &self.device)?.freeze();
        self.model = Some(model);
        self.predictions = None;
        tracing::info!(path = %weights.display(), "Weights loaded");
        Ok(())
    }

    /// Wrap the model with a constant-sparsity pruner and load pruned weights into it.
    pub fn load_pruned(&mut self, weights: &Path, factor: f64) -> Result<(), ForgetError> {
        let schedule = PruningSchedule::constant(factor);
        let mut pruner = Pruner::new(schedule, self.config.prune.log_dir.as_deref())?;
        tracing::info!(factor, "Created pruned model with constant sparsity");

        let model = self.model_or_err()?.clone();
        let model = model.load(&self.classifier, weights, &self.device)?.freeze();
        pruner.masks_from_weights(&model)?;
        let sparsity = pruner.current_sparsity();
        if sparsity + 0.05 < factor {
            tracing::warn!(factor, sparsity, "Loaded weights are less sparse than requested");
        }

        self.pruned = Some(pruner.strip(model));
        tracing::info!(path = %weights.display(), sparsity, "Loaded pruned weights");
        Ok(())
    }

    /// Fine-tune under low-magnitude pruning, then save and export the result.
    pub fn prune(&mut self, factor: f64) -> Result<PruneReport, ForgetError> {
        let model = self.model_or_err()?.clone();
        let data = self.data_or_err()?;
        let schedule = PruningSchedule::from_config(&self.config.prune, factor)?;
        let mut pruner = Pruner::new(schedule, self.config.prune.log_dir.as_deref())?;

        let options = FitOptions::from_config(&self.config);
        let mut trainer = Trainer::<B>::new(options, self.device.clone())
            .with_callback(AnomalyDetection::default());
        let (model, history) = trainer.fit(model, &data.train, &data.validation, &mut pruner)?;
        let model = pruner.strip(model);
        let (sparsity, _) = model_sparsity(&model)?;

        let dir = tempfile::Builder::new()
            .prefix("forgetful-pruned-")
            .tempdir()?
            .keep();
        let record = model.save(&self.classifier, &dir.join("pruned"))?;
        tracing::info!(path = %record.display(), sparsity, "Saved pruned model");

        self.pruned = Some(model);
        let artifact = self.export_mobile()?;
        Ok(PruneReport {
            record,
            artifact,
            sparsity,
            history,
        })
    }

    fn export_options(&self) -> ExportOptions {
        ExportOptions {
            granularity: self.config.export.granularity,
            input_height: self.config.data.img_height,
            input_width: self.config.data.img_width,
        }
    }

    /// Serialized mobile artifact of the pruned model.
    pub fn serialize_mobile(&self) -> Result<Vec<u8>, ForgetError> {
        let pruned = self
            .pruned
            .as_ref()
            .ok_or_else(|| ForgetError::model("no pruned model; call prune or load_pruned first"))?;
        serialize(&pruned.valid(), &self.classifier, &self.export_options())
    }

    /// Write the mobile artifact and return its path.
    pub fn export_mobile(&self) -> Result<PathBuf, ForgetError> {
        let bytes = self.serialize_mobile()?;
        write_artifact(&bytes, self.config.export.output_dir.as_deref(), "pruned")
    }

    /// Classify the test split with the current model.
    pub fn predict(&mut self) -> Result<&[Prediction], ForgetError> {
        let model = self.model_or_err()?.valid();
        let data = self.data_or_err()?;
        tracing::info!(samples = data.test.samples().len(), "Running predictions");
        let predictions = predict(&model, &data.test, self.config.train.batch_size, &self.device)?;
        Ok(self.predictions.insert(predictions).as_slice())
    }

    pub fn predictions(&self) -> Option<&[Prediction]> {
        self.predictions.as_deref()
    }

    /// Accuracy, precision, recall and F1 on the test split.
    pub fn evaluate(&mut self) -> Result<ClassificationMetrics, ForgetError> {
        if self.predictions.is_none() {
            self.predict()?;
        }
        let predictions = self.predictions.as_deref().unwrap_or_default();
        let metrics = score(predictions, self.classifier.num_classes);
        tracing::info!(
            accuracy = metrics.accuracy,
            precision = metrics.precision,
            recall = metrics.recall,
            f1 = metrics.f1_score,
            "Evaluation complete"
        );
        Ok(metrics)
    }
}
