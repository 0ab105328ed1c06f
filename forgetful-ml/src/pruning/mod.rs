//! Magnitude pruning: schedules, masks and the training-time pruner.

pub mod mask;
pub mod pruner;
pub mod schedule;

pub use mask::{magnitude_mask, sparsity_of};
pub use pruner::{Pruner, SparsitySummary, model_sparsity};
pub use schedule::PruningSchedule;
