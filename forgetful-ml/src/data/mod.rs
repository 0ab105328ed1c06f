//! Data loading: CelebA attribute tables, lazily decoded image datasets and batching.
//!
//! The pipeline only talks to [`DataSource`]; [`CelebaDataLoader`] is the stock
//! implementation and tests plug in their own.

pub mod batch;
pub mod celeba;
pub mod dataset;

pub use batch::{BatchStream, ImageBatch, ImageBatcher};
pub use celeba::CelebaDataLoader;
pub use dataset::{ImageDataset, ImageItem, Sample};

use crate::config::PipelineConfig;
use crate::error::ForgetError;

/// Train / validation / test datasets.
#[derive(Debug, Clone)]
pub struct DataSplits {
    pub train: ImageDataset,
    pub validation: ImageDataset,
    pub test: ImageDataset,
}

impl DataSplits {
    pub fn sizes(&self) -> (usize, usize, usize) {
        use burn::data::dataset::Dataset;
        (self.train.len(), self.validation.len(), self.test.len())
    }
}

/// Produces the three dataset splits for a configuration.
pub trait DataSource {
    fn load_data(&self, config: &PipelineConfig) -> Result<DataSplits, ForgetError>;
}
