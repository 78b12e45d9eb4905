use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::TrainingError;

pub trait LRScheduler: Send {
    /// Advances the schedule and returns the learning rate for the step that
    /// was just scheduled.
    fn step(&mut self) -> f64;

    fn learning_rate(&self) -> f64;

    fn snapshot(&self) -> SchedulerState;

    fn load_snapshot(&mut self, state: &SchedulerState) -> Result<(), TrainingError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub step: usize,
    pub current_lr: f64,
}

/// Cosine annealing with warm restarts: the rate decays from `base_lr` to
/// `min_lr` over one cycle and snaps back at every cycle boundary. The cycle
/// length is the number of batches in one epoch.
pub struct CosineWarmRestarts {
    base_lr: f64,
    min_lr: f64,
    cycle_steps: usize,
    step: usize,
    current_lr: f64,
}

impl CosineWarmRestarts {
    pub fn new(base_lr: f64, min_lr: f64, cycle_steps: usize) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if min_lr < 0.0 || min_lr > base_lr {
            return Err(TrainingError::initialization(
                "scheduler min_lr must be in [0, base_lr]",
            ));
        }
        Ok(Self {
            base_lr,
            min_lr,
            cycle_steps: cycle_steps.max(1),
            step: 0,
            current_lr: base_lr,
        })
    }

    fn compute_lr(&self, step: usize) -> f64 {
        let position = step % self.cycle_steps;
        let progress = position as f64 / self.cycle_steps as f64;
        let cosine = 0.5 * (1.0 + f64::cos(PI * progress));
        self.min_lr + (self.base_lr - self.min_lr) * cosine
    }
}

impl LRScheduler for CosineWarmRestarts {
    fn step(&mut self) -> f64 {
        self.step = self.step.saturating_add(1);
        let lr = self.compute_lr(self.step);
        self.current_lr = lr;
        lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn snapshot(&self) -> SchedulerState {
        SchedulerState {
            step: self.step,
            current_lr: self.current_lr,
        }
    }

    fn load_snapshot(&mut self, state: &SchedulerState) -> Result<(), TrainingError> {
        self.step = state.step;
        self.current_lr = state.current_lr;
        Ok(())
    }
}
