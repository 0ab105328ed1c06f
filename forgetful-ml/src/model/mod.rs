//! Network description: InceptionV3 backbone, dense head and layer enumeration.

pub mod classifier;
pub mod head;
pub mod inception;
pub mod layers;

pub use classifier::{ClassifierConfig, ImageClassifier, record_file, sidecar_file};
pub use head::ClassificationHead;
pub use inception::{BasicConv2d, InceptionV3};
pub use layers::{LayerInfo, LayerKind};
