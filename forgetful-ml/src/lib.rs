//! # forgetful-ml
//!
//! Transfer learning on an InceptionV3 backbone with burn, followed by
//! low-magnitude pruning and export to an int8 mobile artifact.
//!
//! The entry point is [`ForgetModel`]:
//!
//! ```no_run
//! use forgetful_ml::{ForgetModel, TrainingBackend, default_device, load_config};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config(None)?;
//! let mut model = ForgetModel::<TrainingBackend>::new(config, default_device())?;
//! model.load_data()?;
//! model.build()?;
//! let (loss, val_loss) = model.train()?;
//! model.prune(0.5)?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod data;
pub mod error;
pub mod export;
pub mod model;
pub mod persistence;
pub mod pipeline;
pub mod pruning;
pub mod training;

pub use backend::{DefaultBackend, TrainingBackend, backend_name, default_device};
pub use config::{PipelineConfig, load_config};
pub use data::{CelebaDataLoader, DataSource, DataSplits, ImageDataset, Sample};
pub use error::ForgetError;
pub use export::MobileModel;
pub use model::{ClassifierConfig, ImageClassifier, LayerInfo, LayerKind};
pub use pipeline::{ForgetModel, PruneReport};
pub use pruning::PruningSchedule;
pub use training::{ClassificationMetrics, Prediction, TrainingHistory};
