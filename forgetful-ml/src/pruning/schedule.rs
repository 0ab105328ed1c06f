//! Pruning schedules.
//!
//! A schedule answers two questions per optimizer step: whether masks are
//! recomputed at this step, and what sparsity they are recomputed to.
//! `end_step = -1` means pruning never stops.

use serde::{Deserialize, Serialize};

use crate::config::{PruneConfig, ScheduleKind};
use crate::error::ForgetError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PruningSchedule {
    /// Same target sparsity at every pruning step.
    ConstantSparsity {
        target: f64,
        begin_step: i64,
        end_step: i64,
        frequency: i64,
    },

    /// Sparsity rises from `initial` to `target` along
    /// `target + (initial - target) * (1 - p)^power`, `p` the progress in `[0, 1]`.
    PolynomialDecay {
        initial: f64,
        target: f64,
        begin_step: i64,
        end_step: i64,
        power: f64,
        frequency: i64,
    },
}

impl PruningSchedule {
    pub fn constant(target: f64) -> Self {
        Self::ConstantSparsity {
            target,
            begin_step: 0,
            end_step: -1,
            frequency: 100,
        }
    }

    /// Build the configured schedule for a final sparsity of `target`.
    pub fn from_config(config: &PruneConfig, target: f64) -> Result<Self, ForgetError> {
        let schedule = match config.schedule {
            ScheduleKind::Constant => Self::ConstantSparsity {
                target,
                begin_step: config.begin_step,
                end_step: config.end_step,
                frequency: config.frequency,
            },
            ScheduleKind::Polynomial => Self::PolynomialDecay {
                initial: config.initial_sparsity,
                target,
                begin_step: config.begin_step,
                end_step: config.end_step,
                power: config.power,
                frequency: config.frequency,
            },
        };
        schedule.validate()?;
        Ok(schedule)
    }

    fn window(&self) -> (i64, i64, i64) {
        match *self {
            Self::ConstantSparsity {
                begin_step,
                end_step,
                frequency,
                ..
            }
            | Self::PolynomialDecay {
                begin_step,
                end_step,
                frequency,
                ..
            } => (begin_step, end_step, frequency),
        }
    }

    /// Final sparsity this schedule reaches.
    pub fn target(&self) -> f64 {
        match *self {
            Self::ConstantSparsity { target, .. } | Self::PolynomialDecay { target, .. } => target,
        }
    }

    pub fn validate(&self) -> Result<(), ForgetError> {
        let (begin, end, frequency) = self.window();
        let in_unit = |v: f64| (0.0..1.0).contains(&v);

        if !in_unit(self.target()) {
            return Err(ForgetError::pruning(format!(
                "sparsity {} must be in range [0.0, 1.0)",
                self.target()
            )));
        }
        if begin < 0 {
            return Err(ForgetError::pruning("begin_step must be non-negative"));
        }
        if end != -1 && end < begin {
            return Err(ForgetError::pruning("end_step must be -1 or at least begin_step"));
        }
        if frequency <= 0 {
            return Err(ForgetError::pruning("frequency must be positive"));
        }
        if let Self::PolynomialDecay {
            initial, power, ..
        } = *self
        {
            if !in_unit(initial) {
                return Err(ForgetError::pruning("initial sparsity must be in range [0.0, 1.0)"));
            }
            if end <= begin {
                return Err(ForgetError::pruning(
                    "polynomial decay needs an end_step after begin_step",
                ));
            }
            if power <= 0.0 {
                return Err(ForgetError::pruning("power must be positive"));
            }
        }
        Ok(())
    }

    /// Whether masks are recomputed at `step`.
    pub fn prune_in_step(&self, step: i64) -> bool {
        let (begin, end, frequency) = self.window();
        let in_range = step >= begin && (end == -1 || step <= end);
        in_range && (step - begin) % frequency.max(1) == 0
    }

    /// Sparsity masks are recomputed to at `step`.
    pub fn sparsity_at(&self, step: i64) -> f64 {
        match *self {
            Self::ConstantSparsity { target, .. } => target,
            Self::PolynomialDecay {
                initial,
                target,
                begin_step,
                end_step,
                power,
                ..
            } => {
                let span = (end_step - begin_step).max(1) as f64;
                let progress = ((step - begin_step) as f64 / span).clamp(0.0, 1.0);
                target + (initial - target) * (1.0 - progress).powf(power)
            }
        }
    }
}
