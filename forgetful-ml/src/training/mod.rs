//! Training: SGD loop, epoch callbacks, checkpoint manifest and metrics.

pub mod callbacks;
pub mod checkpoint;
pub mod metrics;
pub mod trainer;

pub use callbacks::{
    AnomalyDetection, CallbackAction, EarlyStopping, ModelCheckpoint, Monitor, TrainingCallback,
};
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use metrics::{ClassificationMetrics, EpochMetrics, TrainingHistory};
pub use trainer::{
    CheckpointTarget, FitOptions, LossAccuracy, NoHook, Prediction, StepHook, Trainer,
    evaluate_loss, predict, score,
};
