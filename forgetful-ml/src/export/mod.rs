//! Mobile export: batch-norm folding, int8 quantization and the artifact container.

pub mod fold;
pub mod mobile;
pub mod quantize;

pub use fold::{FoldedConv, fold_batch_norm};
pub use mobile::{ExportOptions, MobileArchitecture, MobileModel, serialize, write_artifact};
pub use quantize::{QuantizedTensor, quantize};
