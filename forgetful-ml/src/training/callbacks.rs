//! Epoch-end callbacks: checkpointing, early stopping, anomaly detection.

use serde::{Deserialize, Serialize};

use crate::training::metrics::TrainingHistory;

/// Action a callback can request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
    Checkpoint,
}

/// Trait for training callbacks.
pub trait TrainingCallback: Send {
    /// Called at the end of each epoch (1-based) with the history so far.
    fn on_epoch_end(&mut self, epoch: usize, history: &TrainingHistory) -> CallbackAction;
}

/// Metric a callback watches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Monitor {
    Loss,
    #[default]
    ValLoss,
}

impl Monitor {
    fn latest(&self, history: &TrainingHistory) -> Option<f64> {
        match self {
            Self::Loss => history.loss.last().copied(),
            Self::ValLoss => history.val_loss.last().copied(),
        }
    }
}

/// Requests a checkpoint whenever the monitored loss reaches a new minimum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCheckpoint {
    pub monitor: Monitor,
    pub save_best_only: bool,
    #[serde(skip)]
    best: Option<f64>,
}

impl ModelCheckpoint {
    pub fn new(monitor: Monitor, save_best_only: bool) -> Self {
        Self {
            monitor,
            save_best_only,
            best: None,
        }
    }

    pub fn on_epoch_end(&mut self, epoch: usize, value: f64) -> CallbackAction {
        let improved = value.is_finite() && self.best.is_none_or(|best| value < best);
        if improved {
            tracing::info!(
                epoch,
                monitor = ?self.monitor,
                previous = ?self.best,
                current = value,
                "Monitored loss improved, saving model"
            );
            self.best = Some(value);
            CallbackAction::Checkpoint
        } else if self.save_best_only {
            tracing::debug!(epoch, current = value, best = ?self.best, "No improvement");
            CallbackAction::Continue
        } else {
            CallbackAction::Checkpoint
        }
    }
}

impl TrainingCallback for ModelCheckpoint {
    fn on_epoch_end(&mut self, epoch: usize, history: &TrainingHistory) -> CallbackAction {
        match self.monitor.latest(history) {
            Some(value) => self.on_epoch_end(epoch, value),
            None => CallbackAction::Continue,
        }
    }
}

/// Early stopping callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStopping {
    pub patience: usize,
    pub min_delta: f64,
    pub monitor: Monitor,
    #[serde(skip)]
    counter: usize,
    #[serde(skip)]
    best_loss: Option<f64>,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            monitor: Monitor::ValLoss,
            counter: 0,
            best_loss: None,
        }
    }

    pub fn on_epoch_end(&mut self, _epoch: usize, loss: f64) -> CallbackAction {
        match self.best_loss {
            None => {
                self.best_loss = Some(loss);
                CallbackAction::Continue
            }
            Some(best) if loss < best - self.min_delta => {
                self.best_loss = Some(loss);
                self.counter = 0;
                CallbackAction::Continue
            }
            Some(_) => {
                self.counter += 1;
                if self.counter >= self.patience {
                    CallbackAction::Stop
                } else {
                    CallbackAction::Continue
                }
            }
        }
    }
}

impl TrainingCallback for EarlyStopping {
    fn on_epoch_end(&mut self, epoch: usize, history: &TrainingHistory) -> CallbackAction {
        let loss = self.monitor.latest(history).unwrap_or(f64::MAX);
        self.on_epoch_end(epoch, loss)
    }
}

/// Stops training on non-finite losses or sudden spikes.
#[derive(Debug, Clone)]
pub struct AnomalyDetection {
    pub threshold: f64,
    window: Vec<f64>,
    window_size: usize,
}

impl AnomalyDetection {
    pub fn new(threshold: f64, window_size: usize) -> Self {
        Self {
            threshold,
            window: Vec::new(),
            window_size,
        }
    }

    pub fn on_epoch_end(&mut self, epoch: usize, loss: f64) -> CallbackAction {
        if !loss.is_finite() {
            tracing::error!(epoch, loss, "Non-finite training loss");
            return CallbackAction::Stop;
        }

        self.window.push(loss);
        if self.window.len() > self.window_size {
            self.window.remove(0);
        }

        if self.window.len() >= 3 {
            let mean = self.window.iter().sum::<f64>() / self.window.len() as f64;
            if loss > mean * self.threshold {
                tracing::error!(epoch, loss, mean, "Training loss spiked");
                return CallbackAction::Stop;
            }
        }

        CallbackAction::Continue
    }
}

impl Default for AnomalyDetection {
    fn default() -> Self {
        Self::new(10.0, 5)
    }
}

impl TrainingCallback for AnomalyDetection {
    fn on_epoch_end(&mut self, epoch: usize, history: &TrainingHistory) -> CallbackAction {
        let loss = history.loss.last().copied().unwrap_or(0.0);
        self.on_epoch_end(epoch, loss)
    }
}
