//! Epoch history and classification metrics.

use serde::{Deserialize, Serialize};

/// Per-epoch training history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs_completed: usize,
    pub loss: Vec<f64>,
    pub val_loss: Vec<f64>,
    /// Top-1 categorical accuracy on the training batches.
    pub accuracy: Vec<f64>,
    pub val_accuracy: Vec<f64>,
    /// 1-based epoch with the lowest validation loss.
    pub best_epoch: Option<usize>,
    pub best_val_loss: Option<f64>,
    pub total_training_time_secs: f64,
}

/// Numbers produced by one epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
}

impl TrainingHistory {
    /// Append an epoch; returns `true` when validation loss improved.
    pub fn record_epoch(&mut self, epoch: EpochMetrics) -> bool {
        self.loss.push(epoch.loss);
        self.accuracy.push(epoch.accuracy);
        self.val_loss.push(epoch.val_loss);
        self.val_accuracy.push(epoch.val_accuracy);
        self.epochs_completed += 1;

        let improved = self.best_val_loss.is_none_or(|best| epoch.val_loss < best);
        if improved {
            self.best_val_loss = Some(epoch.val_loss);
            self.best_epoch = Some(self.epochs_completed);
        }
        improved
    }

    pub fn last(&self) -> Option<EpochMetrics> {
        Some(EpochMetrics {
            loss: *self.loss.last()?,
            accuracy: *self.accuracy.last()?,
            val_loss: *self.val_loss.last()?,
            val_accuracy: *self.val_accuracy.last()?,
        })
    }
}

/// Classification metrics over a labelled set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub accuracy: f64,
    /// Precision, recall and F1 of class 1.
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    /// `confusion_matrix[target][predicted]`.
    pub confusion_matrix: Vec<Vec<usize>>,
    pub samples: usize,
}

impl ClassificationMetrics {
    /// Compute from `(target, predicted)` pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (usize, usize)>, num_classes: usize) -> Self {
        let mut confusion = vec![vec![0usize; num_classes]; num_classes];
        let mut samples = 0;
        for (target, predicted) in pairs {
            if target < num_classes && predicted < num_classes {
                confusion[target][predicted] += 1;
            }
            samples += 1;
        }

        let correct: usize = (0..num_classes).map(|c| confusion[c][c]).sum();
        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };

        let positive = 1.min(num_classes.saturating_sub(1));
        let tp = confusion[positive][positive];
        let predicted_pos: usize = (0..num_classes).map(|t| confusion[t][positive]).sum();
        let actual_pos: usize = confusion[positive].iter().sum();
        let precision = ratio(tp, predicted_pos);
        let recall = ratio(tp, actual_pos);
        let f1_score = if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        };

        Self {
            accuracy: ratio(correct, samples),
            precision,
            recall,
            f1_score,
            confusion_matrix: confusion,
            samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch(loss: f64, val_loss: f64) -> EpochMetrics {
        EpochMetrics {
            loss,
            accuracy: 0.5,
            val_loss,
            val_accuracy: 0.5,
        }
    }

    #[test]
    fn test_training_history() {
        let mut history = TrainingHistory::default();
        assert!(history.record_epoch(epoch(0.5, 0.6)));
        assert!(history.record_epoch(epoch(0.3, 0.4)));
        assert!(!history.record_epoch(epoch(0.2, 0.45)));
        assert_eq!(history.epochs_completed, 3);
        assert_eq!(history.best_epoch, Some(2));
        assert_eq!(history.best_val_loss, Some(0.4));
        assert_eq!(history.last().map(|e| e.loss), Some(0.2));
    }

    #[test]
    fn test_classification_metrics() {
        let pairs = vec![(1, 1), (1, 0), (0, 0), (0, 1), (1, 1)];
        let metrics = ClassificationMetrics::from_pairs(pairs, 2);
        assert_eq!(metrics.samples, 5);
        assert!((metrics.accuracy - 0.6).abs() < 1e-9);
        assert!((metrics.precision - 2.0 / 3.0).abs() < 1e-9);
        assert!((metrics.recall - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(metrics.confusion_matrix, vec![vec![1, 1], vec![1, 2]]);
    }

    #[test]
    fn test_empty_metrics() {
        let metrics = ClassificationMetrics::from_pairs(Vec::new(), 2);
        assert_eq!(metrics.accuracy, 0.0);
        assert_eq!(metrics.f1_score, 0.0);
    }
}
