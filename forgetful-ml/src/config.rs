//! Pipeline configuration.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment.
//! Keys are matched case-insensitively (`IMG_HEIGHT` and `img_height` are the same key)
//! and the integer hyperparameters accept either strings (`"64"`) or numbers (`64`).

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ForgetError;

/// Smallest input side InceptionV3 accepts.
pub const MIN_IMAGE_SIDE: usize = 75;

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Dataset locations and split sizes.
    #[serde(default)]
    pub data: DataConfig,
    /// Training hyperparameters.
    #[serde(default)]
    pub train: TrainConfig,
    /// Network architecture.
    #[serde(default)]
    pub model: ModelConfig,
    /// Magnitude pruning.
    #[serde(default)]
    pub prune: PruneConfig,
    /// Mobile export.
    #[serde(default)]
    pub export: ExportConfig,
}

/// Dataset configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Folder holding the attribute and partition tables.
    #[serde(default = "default_data_folder")]
    pub data_folder: PathBuf,
    /// Folder holding the image files.
    #[serde(default = "default_images_folder")]
    pub images_folder: PathBuf,
    #[serde(default = "default_img_height", deserialize_with = "usize_from_str_or_int")]
    pub img_height: usize,
    #[serde(default = "default_img_width", deserialize_with = "usize_from_str_or_int")]
    pub img_width: usize,
    #[serde(default = "default_training_samples", deserialize_with = "usize_from_str_or_int")]
    pub training_samples: usize,
    #[serde(default = "default_eval_samples", deserialize_with = "usize_from_str_or_int")]
    pub validation_samples: usize,
    #[serde(default = "default_eval_samples", deserialize_with = "usize_from_str_or_int")]
    pub test_samples: usize,
    /// Attribute table, relative to `data_folder`.
    #[serde(default = "default_attributes_file")]
    pub attributes_file: String,
    /// Partition table, relative to `data_folder`.
    #[serde(default = "default_partition_file")]
    pub partition_file: String,
    /// Binary attribute used as the class label.
    #[serde(default = "default_target_attribute")]
    pub target_attribute: String,
    /// Random horizontal flips on training images.
    #[serde(default = "default_true")]
    pub augment: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_folder: default_data_folder(),
            images_folder: default_images_folder(),
            img_height: default_img_height(),
            img_width: default_img_width(),
            training_samples: default_training_samples(),
            validation_samples: default_eval_samples(),
            test_samples: default_eval_samples(),
            attributes_file: default_attributes_file(),
            partition_file: default_partition_file(),
            target_attribute: default_target_attribute(),
            augment: true,
        }
    }
}

impl DataConfig {
    pub fn attributes_path(&self) -> PathBuf {
        self.data_folder.join(&self.attributes_file)
    }

    pub fn partition_path(&self) -> PathBuf {
        self.data_folder.join(&self.partition_file)
    }
}

fn default_data_folder() -> PathBuf {
    PathBuf::from("data/CelebA/")
}

fn default_images_folder() -> PathBuf {
    PathBuf::from("data/CelebA/img_align_celeba/img_align_celeba/")
}

fn default_img_height() -> usize {
    218
}

fn default_img_width() -> usize {
    178
}

fn default_training_samples() -> usize {
    10_000
}

fn default_eval_samples() -> usize {
    2_000
}

fn default_attributes_file() -> String {
    "list_attr_celeba.csv".to_string()
}

fn default_partition_file() -> String {
    "list_eval_partition.csv".to_string()
}

fn default_target_attribute() -> String {
    "Blond_Hair".to_string()
}

/// Training configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default = "default_batch_size", deserialize_with = "usize_from_str_or_int")]
    pub batch_size: usize,
    #[serde(default = "default_epochs", deserialize_with = "usize_from_str_or_int")]
    pub epochs: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    /// Seed for sampling, shuffling and augmentation.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Where the best weights (by validation loss) are written.
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,
    /// Where the final model is written after training.
    #[serde(default = "default_baseline_path")]
    pub baseline_path: PathBuf,
    /// Stop after this many epochs without validation improvement.
    #[serde(default)]
    pub early_stopping_patience: Option<usize>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            epochs: default_epochs(),
            learning_rate: default_learning_rate(),
            momentum: default_momentum(),
            seed: default_seed(),
            checkpoint_path: default_checkpoint_path(),
            baseline_path: default_baseline_path(),
            early_stopping_patience: None,
        }
    }
}

fn default_batch_size() -> usize {
    64
}

fn default_epochs() -> usize {
    10
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_momentum() -> f64 {
    0.9
}

fn default_seed() -> u64 {
    42
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("weights.best.inc.blond")
}

fn default_baseline_path() -> PathBuf {
    PathBuf::from("baseline")
}

/// Network architecture configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    /// Leading layers (Keras-style enumeration) excluded from training.
    #[serde(default = "default_frozen_layers")]
    pub frozen_layers: usize,
    #[serde(default = "default_dense1_units")]
    pub dense1_units: usize,
    #[serde(default = "default_dense2_units")]
    pub dense2_units: usize,
    #[serde(default = "default_dropout")]
    pub dropout: f64,
    /// Divides every backbone width; 1 is the full InceptionV3.
    #[serde(default = "default_channel_divisor")]
    pub channel_divisor: usize,
    /// Pretrained backbone record (burn `.mpk`), loaded on build.
    #[serde(default)]
    pub backbone_weights: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_classes: default_num_classes(),
            frozen_layers: default_frozen_layers(),
            dense1_units: default_dense1_units(),
            dense2_units: default_dense2_units(),
            dropout: default_dropout(),
            channel_divisor: default_channel_divisor(),
            backbone_weights: None,
        }
    }
}

fn default_num_classes() -> usize {
    2
}

fn default_frozen_layers() -> usize {
    52
}

fn default_dense1_units() -> usize {
    1024
}

fn default_dense2_units() -> usize {
    512
}

fn default_dropout() -> f64 {
    0.5
}

fn default_channel_divisor() -> usize {
    1
}

/// Sparsity schedule family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    #[default]
    Constant,
    Polynomial,
}

/// Magnitude pruning configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruneConfig {
    #[serde(default)]
    pub schedule: ScheduleKind,
    #[serde(default)]
    pub begin_step: i64,
    /// `-1` keeps pruning until training ends.
    #[serde(default = "default_end_step")]
    pub end_step: i64,
    #[serde(default = "default_frequency")]
    pub frequency: i64,
    /// Starting sparsity of the polynomial schedule.
    #[serde(default)]
    pub initial_sparsity: f64,
    /// Exponent of the polynomial schedule.
    #[serde(default = "default_power")]
    pub power: f64,
    /// Directory for per-epoch sparsity summaries; a temp dir when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            schedule: ScheduleKind::Constant,
            begin_step: 0,
            end_step: default_end_step(),
            frequency: default_frequency(),
            initial_sparsity: 0.0,
            power: default_power(),
            log_dir: None,
        }
    }
}

fn default_end_step() -> i64 {
    -1
}

fn default_frequency() -> i64 {
    100
}

fn default_power() -> f64 {
    3.0
}

/// Weight quantization granularity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    #[default]
    PerChannel,
    PerTensor,
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PerChannel => write!(f, "per_channel"),
            Self::PerTensor => write!(f, "per_tensor"),
        }
    }
}

/// Mobile export configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Destination directory; a temp file is created when unset.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub granularity: Granularity,
}

fn default_true() -> bool {
    true
}

fn usize_from_str_or_int<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;

    impl serde::de::Visitor<'_> for Visitor {
        type Value = usize;

        fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("a non-negative integer or a string holding one")
        }

        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<usize, E> {
            usize::try_from(v).map_err(E::custom)
        }

        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<usize, E> {
            usize::try_from(v).map_err(E::custom)
        }

        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<usize, E> {
            v.trim()
                .parse()
                .map_err(|_| E::custom(format!("expected an integer, got {v:?}")))
        }
    }

    deserializer.deserialize_any(Visitor)
}

impl PipelineConfig {
    /// Batches drawn per training epoch.
    pub fn steps_per_epoch(&self) -> usize {
        self.data.training_samples / self.train.batch_size.max(1)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ForgetError> {
        let data = &self.data;
        if data.img_height < MIN_IMAGE_SIDE || data.img_width < MIN_IMAGE_SIDE {
            return Err(ForgetError::config(format!(
                "image size {}x{} is below the {MIN_IMAGE_SIDE}x{MIN_IMAGE_SIDE} minimum",
                data.img_height, data.img_width
            )));
        }
        if data.training_samples == 0 || data.validation_samples == 0 || data.test_samples == 0 {
            return Err(ForgetError::config("sample counts must be greater than 0"));
        }
        if self.train.batch_size == 0 {
            return Err(ForgetError::config("BATCH_SIZE must be greater than 0"));
        }
        if self.train.batch_size > data.training_samples {
            return Err(ForgetError::config(format!(
                "BATCH_SIZE {} exceeds TRAINING_SAMPLES {}",
                self.train.batch_size, data.training_samples
            )));
        }
        if self.train.epochs == 0 {
            return Err(ForgetError::config("EPOCHS must be greater than 0"));
        }
        if self.train.learning_rate <= 0.0 {
            return Err(ForgetError::config("learning_rate must be positive"));
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(ForgetError::config("dropout must be in range [0.0, 1.0)"));
        }
        if self.model.num_classes < 2 {
            return Err(ForgetError::config("num_classes must be at least 2"));
        }
        if self.model.channel_divisor == 0 {
            return Err(ForgetError::config("channel_divisor must be greater than 0"));
        }
        if self.prune.frequency <= 0 {
            return Err(ForgetError::config("prune frequency must be positive"));
        }
        Ok(())
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ForgetError> {
        toml::to_string_pretty(self).map_err(|e| ForgetError::config(e.to_string()))
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (`FORGETFUL_TRAIN__BATCH_SIZE`, `FORGETFUL_DATA__IMG_HEIGHT`, ...)
/// 2. The TOML file at `path`, when given
/// 3. Built-in defaults
pub fn load_config(path: Option<&Path>) -> Result<PipelineConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(PipelineConfig::default()));

    if let Some(path) = path {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Box::new(figment::Error::from(format!("{}: {e}", path.display()))))?;
        figment = figment.merge(Toml::string(&normalize_toml(&content)?));
    }

    // Env keys arrive lower-cased, matching the normalized file keys.
    figment = figment.merge(Env::prefixed("FORGETFUL_").split("__"));

    figment.extract().map_err(Box::new)
}

/// Load configuration from a TOML string on top of the defaults.
pub fn config_from_toml(content: &str) -> Result<PipelineConfig, Box<figment::Error>> {
    Figment::from(Serialized::defaults(PipelineConfig::default()))
        .merge(Toml::string(&normalize_toml(content)?))
        .extract()
        .map_err(Box::new)
}

/// Lower-case every table key so `IMG_HEIGHT` and `img_height` merge into one entry.
fn normalize_toml(content: &str) -> Result<String, Box<figment::Error>> {
    let table: toml::Table = content
        .parse()
        .map_err(|e: toml::de::Error| Box::new(figment::Error::from(e.to_string())))?;
    let normalized = lowercase_keys(toml::Value::Table(table));
    toml::to_string(&normalized).map_err(|e| Box::new(figment::Error::from(e.to_string())))
}

fn lowercase_keys(value: toml::Value) -> toml::Value {
    match value {
        toml::Value::Table(table) => toml::Value::Table(
            table
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), lowercase_keys(v)))
                .collect(),
        ),
        toml::Value::Array(items) => {
            toml::Value::Array(items.into_iter().map(lowercase_keys).collect())
        }
        other => other,
    }
}
