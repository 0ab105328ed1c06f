//! Low-magnitude pruning wrapped around training.
//!
//! The pruner keeps one mask per conv and dense kernel. Masks are recomputed
//! on scheduled steps and multiplied into the kernels before every forward
//! pass and after every optimizer update, so pruned weights stay at zero.
//! Biases and batch-norm parameters are never pruned.

use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use burn::tensor::{Tensor, TensorData, backend::Backend};
use serde::{Deserialize, Serialize};

use super::mask::{magnitude_mask, mask_from_zeros, sparsity_of};
use super::schedule::PruningSchedule;
use crate::error::ForgetError;
use crate::model::ImageClassifier;
use crate::training::StepHook;

/// Per-epoch sparsity record written to `sparsity.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparsitySummary {
    pub epoch: usize,
    pub step: i64,
    pub target_sparsity: f64,
    pub overall_sparsity: f64,
    /// Sparsity per layer index.
    pub layers: BTreeMap<usize, f64>,
}

fn to_f32<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>, ForgetError> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| ForgetError::pruning(format!("{e:?}")))
}

fn masked<B: Backend, const D: usize>(weight: Tensor<B, D>, mask: &Tensor<B, D>) -> Tensor<B, D> {
    let require_grad = weight.is_require_grad();
    weight
        .set_require_grad(false)
        .mul(mask.clone())
        .set_require_grad(require_grad)
}

fn mask_tensor<B: Backend, const D: usize>(
    mask: Vec<f32>,
    shape: [usize; D],
    device: &B::Device,
) -> Tensor<B, D> {
    Tensor::from_data(TensorData::new(mask, shape), device)
}

/// Sparsity per prunable layer and over all of them.
pub fn model_sparsity<B: Backend>(
    model: &ImageClassifier<B>,
) -> Result<(f64, BTreeMap<usize, f64>), ForgetError> {
    let mut layers = BTreeMap::new();
    let (mut zeros, mut total) = (0.0, 0usize);
    let mut add = |index: usize, values: Vec<f32>| {
        let s = sparsity_of(&values);
        zeros += s * values.len() as f64;
        total += values.len();
        layers.insert(index, s);
    };
    for conv in model.convs() {
        add(conv.conv_index, to_f32(conv.conv.weight.val())?);
    }
    for (index, dense) in model.denses() {
        add(index, to_f32(dense.weight.val())?);
    }
    let overall = if total == 0 { 0.0 } else { zeros / total as f64 };
    Ok((overall, layers))
}

/// Applies a [`PruningSchedule`] to a classifier during training.
pub struct Pruner<B: Backend> {
    schedule: PruningSchedule,
    conv_masks: HashMap<usize, Tensor<B, 4>>,
    dense_masks: HashMap<usize, Tensor<B, 2>>,
    current_sparsity: f64,
    last_step: i64,
    log_dir: PathBuf,
}

impl<B: Backend> Pruner<B> {
    /// Summaries go to `log_dir`, or to a fresh temp directory when `None`.
    pub fn new(schedule: PruningSchedule, log_dir: Option<&Path>) -> Result<Self, ForgetError> {
        schedule.validate()?;
        let log_dir = match log_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                dir.to_path_buf()
            }
            None => tempfile::Builder::new()
                .prefix("forgetful-prune-")
                .tempdir()?
                .keep(),
        };
        tracing::info!(log_dir = %log_dir.display(), target = schedule.target(), "Pruning enabled");

        Ok(Self {
            schedule,
            conv_masks: HashMap::new(),
            dense_masks: HashMap::new(),
            current_sparsity: 0.0,
            last_step: -1,
            log_dir,
        })
    }

    pub fn schedule(&self) -> &PruningSchedule {
        &self.schedule
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn summary_file(&self) -> PathBuf {
        self.log_dir.join("sparsity.jsonl")
    }

    /// Sparsity of the most recent mask update.
    pub fn current_sparsity(&self) -> f64 {
        self.current_sparsity
    }

    /// Number of kernels holding a mask.
    pub fn mask_count(&self) -> usize {
        self.conv_masks.len() + self.dense_masks.len()
    }

    /// Recompute every mask from current magnitudes.
    pub fn update_masks(
        &mut self,
        model: &ImageClassifier<B>,
        sparsity: f64,
    ) -> Result<(), ForgetError> {
        self.rebuild_masks(model, |weights| magnitude_mask(weights, sparsity))?;
        self.current_sparsity = sparsity;
        tracing::debug!(sparsity, masks = self.mask_count(), "Pruning masks updated");
        Ok(())
    }

    /// Masks that keep exactly the non-zero weights, for already pruned models.
    pub fn masks_from_weights(&mut self, model: &ImageClassifier<B>) -> Result<(), ForgetError> {
        self.rebuild_masks(model, mask_from_zeros)?;
        self.current_sparsity = model_sparsity(model)?.0;
        Ok(())
    }

    fn rebuild_masks(
        &mut self,
        model: &ImageClassifier<B>,
        make: impl Fn(&[f32]) -> Vec<f32>,
    ) -> Result<(), ForgetError> {
        for conv in model.convs() {
            let weight = conv.conv.weight.val();
            let (shape, device) = (weight.dims(), weight.device());
            let mask = make(&to_f32(weight)?);
            self.conv_masks
                .insert(conv.conv_index, mask_tensor(mask, shape, &device));
        }
        for (index, dense) in model.denses() {
            let weight = dense.weight.val();
            let (shape, device) = (weight.dims(), weight.device());
            let mask = make(&to_f32(weight)?);
            self.dense_masks.insert(index, mask_tensor(mask, shape, &device));
        }
        Ok(())
    }

    /// Multiply the masks into the kernels.
    pub fn apply(&self, model: ImageClassifier<B>) -> ImageClassifier<B> {
        if self.mask_count() == 0 {
            return model;
        }
        model
            .map_conv_kernels(&mut |index, w| match self.conv_masks.get(&index) {
                Some(mask) => masked(w, mask),
                None => w,
            })
            .map_dense_kernels(&mut |index, w| match self.dense_masks.get(&index) {
                Some(mask) => masked(w, mask),
                None => w,
            })
    }

    /// Bake the masks in and return the plain classifier.
    pub fn strip(self, model: ImageClassifier<B>) -> ImageClassifier<B> {
        self.apply(model)
    }

    fn write_summary(&self, summary: &SparsitySummary) -> Result<(), ForgetError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.summary_file())?;
        writeln!(file, "{}", serde_json::to_string(summary)?)?;
        Ok(())
    }
}

impl<B: Backend> StepHook<B> for Pruner<B> {
    fn before_step(
        &mut self,
        step: usize,
        model: ImageClassifier<B>,
    ) -> Result<ImageClassifier<B>, ForgetError> {
        let step = step as i64;
        self.last_step = step;
        if self.schedule.prune_in_step(step) {
            self.update_masks(&model, self.schedule.sparsity_at(step))?;
        }
        Ok(self.apply(model))
    }

    fn after_step(
        &mut self,
        _step: usize,
        model: ImageClassifier<B>,
    ) -> Result<ImageClassifier<B>, ForgetError> {
        Ok(self.apply(model))
    }

    fn on_epoch_end(
        &mut self,
        epoch: usize,
        model: &ImageClassifier<B>,
    ) -> Result<(), ForgetError> {
        let (overall, layers) = model_sparsity(model)?;
        let summary = SparsitySummary {
            epoch,
            step: self.last_step,
            target_sparsity: self.current_sparsity,
            overall_sparsity: overall,
            layers,
        };
        self.write_summary(&summary)?;
        tracing::info!(epoch, sparsity = overall, "Pruning summary");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ClassifierConfig;
    use burn::backend::{Autodiff, NdArray};
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn model() -> ImageClassifier<TestBackend> {
        ClassifierConfig::new()
            .with_channel_divisor(32)
            .with_dense1_units(8)
            .with_dense2_units(4)
            .init(&Default::default())
    }

    #[test]
    fn test_apply_reaches_target_sparsity() {
        let dir = TempDir::new().unwrap();
        let model = model();
        let mut pruner = Pruner::new(PruningSchedule::constant(0.5), Some(dir.path())).unwrap();
        pruner.update_masks(&model, 0.5).unwrap();
        assert_eq!(pruner.mask_count(), 94 + 3);

        let pruned = pruner.strip(model);
        let (overall, layers) = model_sparsity(&pruned).unwrap();
        assert!((overall - 0.5).abs() < 0.02, "overall sparsity {overall}");
        assert_eq!(layers.len(), 97);
    }

    #[test]
    fn test_hook_writes_summary() {
        let dir = TempDir::new().unwrap();
        let model = model();
        let mut pruner = Pruner::new(PruningSchedule::constant(0.3), Some(dir.path())).unwrap();
        let model = pruner.before_step(0, model).unwrap();
        let model = pruner.after_step(0, model).unwrap();
        pruner.on_epoch_end(1, &model).unwrap();

        let content = std::fs::read_to_string(pruner.summary_file()).unwrap();
        let first = content.lines().next().unwrap();
        let summary: SparsitySummary = serde_json::from_str(first).unwrap();
        assert_eq!(summary.epoch, 1);
        assert_eq!(summary.target_sparsity, 0.3);
        assert!(summary.overall_sparsity > 0.25);
    }

    #[test]
    fn test_masks_from_weights() {
        let dir = TempDir::new().unwrap();
        let mut pruner = Pruner::new(PruningSchedule::constant(0.6), Some(dir.path())).unwrap();
        let model = model();
        pruner.update_masks(&model, 0.6).unwrap();
        let pruned = pruner.strip(model);

        let mut reloaded = Pruner::new(PruningSchedule::constant(0.6), Some(dir.path())).unwrap();
        reloaded.masks_from_weights(&pruned).unwrap();
        assert!((reloaded.current_sparsity() - 0.6).abs() < 0.02);
    }

    #[test]
    fn test_hook_on_autodiff_backend() {
        type Train = Autodiff<TestBackend>;
        let dir = TempDir::new().unwrap();
        let model: ImageClassifier<Train> = ClassifierConfig::new()
            .with_channel_divisor(32)
            .with_dense1_units(8)
            .with_dense2_units(4)
            .init(&Default::default());
        let mut pruner = Pruner::new(PruningSchedule::constant(0.5), Some(dir.path())).unwrap();

        let model = pruner.before_step(0, model).unwrap();
        assert!(model.head.dense1.weight.val().is_require_grad());
        let model = pruner.after_step(0, model).unwrap();
        let (overall, _) = model_sparsity(&model).unwrap();
        assert!((overall - 0.5).abs() < 0.02, "overall sparsity {overall}");
    }

    #[test]
    fn test_temp_log_dir() {
        let pruner = Pruner::<TestBackend>::new(PruningSchedule::constant(0.2), None).unwrap();
        assert!(pruner.log_dir().is_dir());
        std::fs::remove_dir_all(pruner.log_dir()).unwrap();
    }
}
