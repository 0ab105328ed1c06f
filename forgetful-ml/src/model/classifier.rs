//! The full classifier: InceptionV3 backbone plus dense head.

use std::path::{Path, PathBuf};

use burn::{
    config::Config,
    module::Module,
    nn::Linear,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::{Tensor, activation::softmax, backend::Backend},
};

use super::head::ClassificationHead;
use super::inception::{BasicConv2d, InceptionV3};
use super::layers::{LayerCounter, LayerEntry, LayerInfo, LayerKind, name_layers};
use crate::config::ModelConfig;
use crate::error::ForgetError;

/// Architecture of an [`ImageClassifier`], stored next to its weights.
#[derive(Config, Debug, PartialEq)]
pub struct ClassifierConfig {
    #[config(default = "2")]
    pub num_classes: usize,
    #[config(default = "52")]
    pub frozen_layers: usize,
    #[config(default = "1024")]
    pub dense1_units: usize,
    #[config(default = "512")]
    pub dense2_units: usize,
    #[config(default = "0.5")]
    pub dropout: f64,
    #[config(default = "1")]
    pub channel_divisor: usize,
}

impl ClassifierConfig {
    pub fn from_model_config(model: &ModelConfig) -> Self {
        Self::new()
            .with_num_classes(model.num_classes)
            .with_frozen_layers(model.frozen_layers)
            .with_dense1_units(model.dense1_units)
            .with_dense2_units(model.dense2_units)
            .with_dropout(model.dropout)
            .with_channel_divisor(model.channel_divisor)
    }

    /// Whether weights saved for `other` fit this architecture.
    pub fn same_architecture(&self, other: &Self) -> bool {
        self.num_classes == other.num_classes
            && self.dense1_units == other.dense1_units
            && self.dense2_units == other.dense2_units
            && self.channel_divisor == other.channel_divisor
    }

    /// Build a freshly initialized, unfrozen classifier.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ImageClassifier<B> {
        let mut counter = LayerCounter::after_input();
        let backbone = InceptionV3::new(self.channel_divisor, &mut counter, device);
        let head = ClassificationHead::new(
            backbone.out_channels(),
            self.dense1_units,
            self.dense2_units,
            self.dropout,
            self.num_classes,
            &mut counter,
            device,
        );
        ImageClassifier {
            backbone,
            head,
            frozen_layers: self.frozen_layers,
        }
    }
}

/// InceptionV3 transfer-learning classifier.
#[derive(Module, Debug)]
pub struct ImageClassifier<B: Backend> {
    pub backbone: InceptionV3<B>,
    pub head: ClassificationHead<B>,
    frozen_layers: usize,
}

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

/// File the recorder actually writes for `path`.
pub fn record_file(path: &Path) -> PathBuf {
    path.with_extension("mpk")
}

/// Architecture sidecar written next to the record.
pub fn sidecar_file(path: &Path) -> PathBuf {
    path.with_extension("json")
}

impl<B: Backend> ImageClassifier<B> {
    /// Class logits for images `[N, 3, H, W]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.forward(images))
    }

    /// Softmax class probabilities.
    pub fn forward_probs(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    pub fn frozen_layers(&self) -> usize {
        self.frozen_layers
    }

    /// Exclude the first `frozen_layers` layers from gradient updates.
    pub fn freeze(self) -> Self {
        let frozen = self.frozen_layers;
        Self {
            backbone: self.backbone.freeze(frozen),
            head: self.head.freeze(frozen),
            frozen_layers: frozen,
        }
    }

    /// Flat, Keras-style layer summary.
    pub fn layers(&self) -> Vec<LayerInfo> {
        let mut entries = vec![LayerEntry::new(0, LayerKind::Input, 3).with_name("input_1")];
        self.backbone.layers(&mut entries);
        self.head.layers(&mut entries);
        name_layers(entries, self.frozen_layers)
    }

    /// Total parameter count, batch-norm statistics included.
    pub fn param_count(&self) -> usize {
        self.layers().iter().map(|l| l.params).sum()
    }

    pub fn convs(&self) -> Vec<&BasicConv2d<B>> {
        self.backbone.convs()
    }

    pub fn denses(&self) -> [(usize, &Linear<B>); 3] {
        self.head.denses()
    }

    /// Rewrite every conv kernel, keyed by the conv's layer index.
    pub fn map_conv_kernels<F>(self, f: &mut F) -> Self
    where
        F: FnMut(usize, Tensor<B, 4>) -> Tensor<B, 4>,
    {
        let backbone = self.backbone.map_convs(&mut |mut conv: BasicConv2d<B>| {
            let index = conv.conv_index;
            conv.conv.weight = conv.conv.weight.map(|w| f(index, w));
            conv
        });
        Self { backbone, ..self }
    }

    /// Rewrite every dense kernel, keyed by the dense layer index.
    pub fn map_dense_kernels<F>(self, f: &mut F) -> Self
    where
        F: FnMut(usize, Tensor<B, 2>) -> Tensor<B, 2>,
    {
        let head = self.head.map_denses(&mut |index, mut dense: Linear<B>| {
            dense.weight = dense.weight.map(|w| f(index, w));
            dense
        });
        Self { head, ..self }
    }

    /// Save the weights and the architecture sidecar.
    pub fn save(&self, config: &ClassifierConfig, path: &Path) -> Result<PathBuf, ForgetError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        self.clone()
            .save_file(path.to_path_buf(), &recorder())
            .map_err(ForgetError::record)?;
        config.save(sidecar_file(path))?;
        let file = record_file(path);
        tracing::debug!(path = %file.display(), "Saved model record");
        Ok(file)
    }

    /// Load weights saved by [`ImageClassifier::save`] into this architecture.
    ///
    /// The sidecar, when present, must describe the same architecture.
    pub fn load(
        self,
        config: &ClassifierConfig,
        path: &Path,
        device: &B::Device,
    ) -> Result<Self, ForgetError> {
        let file = record_file(path);
        if !file.exists() {
            return Err(ForgetError::not_found(format!("weights {}", file.display())));
        }
        let sidecar = sidecar_file(path);
        if sidecar.exists() {
            let saved = ClassifierConfig::load(&sidecar)
                .map_err(|e| ForgetError::model(format!("{}: {e}", sidecar.display())))?;
            if !saved.same_architecture(config) {
                return Err(ForgetError::model(format!(
                    "weights {} were saved for a different architecture",
                    file.display()
                )));
            }
        }

        let expected = self.param_count();
        let loaded = self
            .load_file(path.to_path_buf(), &recorder(), device)
            .map_err(ForgetError::record)?;
        if loaded.param_count() != expected {
            return Err(ForgetError::model(format!(
                "weights {} do not match the architecture ({} vs {expected} parameters)",
                file.display(),
                loaded.param_count()
            )));
        }
        tracing::info!(path = %file.display(), "Loaded model weights");
        Ok(loaded)
    }

    /// Replace the backbone with pretrained weights from a burn record.
    pub fn load_backbone(mut self, path: &Path, device: &B::Device) -> Result<Self, ForgetError> {
        self.backbone = self
            .backbone
            .load_file(path.to_path_buf(), &recorder(), device)
            .map_err(ForgetError::record)?;
        tracing::info!(path = %path.display(), "Loaded pretrained backbone");
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn small_config() -> ClassifierConfig {
        ClassifierConfig::new()
            .with_channel_divisor(16)
            .with_dense1_units(16)
            .with_dense2_units(8)
    }

    #[test]
    fn test_layer_summary() {
        let model: ImageClassifier<TestBackend> = small_config().init(&Default::default());
        let layers = model.layers();
        assert!(layers.iter().enumerate().all(|(i, l)| l.index == i));
        assert!(layers[..52].iter().all(|l| !l.trainable));
        assert!(layers[52..].iter().all(|l| l.trainable));

        let last = layers.last().unwrap();
        assert_eq!(last.kind, LayerKind::Dense);
        assert_eq!(last.units, 2);
        assert_eq!(last.activation, Some("softmax"));
        assert_eq!(layers[40].name, "mixed0");
    }

    #[test]
    fn test_probabilities_sum_to_one() {
        let device = Default::default();
        let model: ImageClassifier<TestBackend> = small_config().init(&device);
        let images = Tensor::<TestBackend, 4>::ones([2, 3, 75, 75], &device);
        let probs = model.forward_probs(images);
        assert_eq!(probs.dims(), [2, 2]);
        let sums: Vec<f32> = probs.sum_dim(1).into_data().to_vec().unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("weights.best.inc.blond");
        let device = Default::default();
        let config = small_config();
        let model: ImageClassifier<TestBackend> = config.init(&device);
        let file = model.save(&config, &path).unwrap();
        assert!(file.exists());

        let fresh: ImageClassifier<TestBackend> = config.init(&device);
        let loaded = fresh.load(&config, &path, &device).unwrap();
        let a: Vec<f32> = model.head.output.weight.val().into_data().to_vec().unwrap();
        let b: Vec<f32> = loaded.head.output.weight.val().into_data().to_vec().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_load_rejects_other_architecture() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model");
        let device = Default::default();
        let config = small_config();
        let model: ImageClassifier<TestBackend> = config.init(&device);
        model.save(&config, &path).unwrap();

        let other = small_config().with_dense2_units(4);
        let fresh: ImageClassifier<TestBackend> = other.init(&device);
        assert!(matches!(fresh.load(&other, &path, &device), Err(ForgetError::Model(_))));
    }

    #[test]
    fn test_load_missing_weights() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let config = small_config();
        let model: ImageClassifier<TestBackend> = config.init(&device);
        assert!(matches!(
            model.load(&config, &dir.path().join("absent"), &device),
            Err(ForgetError::NotFound(_))
        ));
    }
}
