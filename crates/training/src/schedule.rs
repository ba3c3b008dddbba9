//! Linear warmup followed by cosine decay, as a pure function of the global step.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ScheduleError {
    #[error("base_lr must be finite and > 0 (got {0})")]
    BaseLr(f64),
    #[error("floor must be finite and within [0, base_lr] (got {floor}, base_lr {base_lr})")]
    Floor { floor: f64, base_lr: f64 },
    #[error("total_steps must be > 0")]
    NoSteps,
    #[error("warmup_steps {warmup} exceeds total_steps {total}")]
    WarmupTooLong { warmup: usize, total: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulePhase {
    Warmup,
    Decay,
    Done,
}

/// Where the schedule stands at a given step. Derived, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScheduleState {
    pub step: usize,
    pub epoch: usize,
    pub phase: SchedulePhase,
    pub lr: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WarmupCosine {
    pub base_lr: f64,
    pub warmup_steps: usize,
    pub total_steps: usize,
    pub floor: f64,
}

impl WarmupCosine {
    pub fn new(
        base_lr: f64,
        warmup_steps: usize,
        total_steps: usize,
        floor: f64,
    ) -> Result<Self, ScheduleError> {
        if !base_lr.is_finite() || base_lr <= 0.0 {
            return Err(ScheduleError::BaseLr(base_lr));
        }
        if !floor.is_finite() || floor < 0.0 || floor > base_lr {
            return Err(ScheduleError::Floor { floor, base_lr });
        }
        if total_steps == 0 {
            return Err(ScheduleError::NoSteps);
        }
        if warmup_steps > total_steps {
            return Err(ScheduleError::WarmupTooLong {
                warmup: warmup_steps,
                total: total_steps,
            });
        }
        Ok(Self {
            base_lr,
            warmup_steps,
            total_steps,
            floor,
        })
    }

    pub fn from_epochs(
        base_lr: f64,
        warmup_epochs: usize,
        total_epochs: usize,
        steps_per_epoch: usize,
        floor: f64,
    ) -> Result<Self, ScheduleError> {
        Self::new(
            base_lr,
            warmup_epochs * steps_per_epoch,
            total_epochs * steps_per_epoch,
            floor,
        )
    }

    /// Learning rate applied to the update made at global step `step`.
    pub fn rate(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return (self.base_lr * step as f64 / self.warmup_steps as f64).max(0.0);
        }
        let decay_steps = self.total_steps - self.warmup_steps;
        let progress = if decay_steps == 0 {
            1.0
        } else {
            ((step - self.warmup_steps) as f64 / decay_steps as f64).clamp(0.0, 1.0)
        };
        // At progress 0 this is floor + (base - floor) exactly.
        let cosine = 0.5 * (self.base_lr - self.floor) * (1.0 + (PI * progress).cos());
        (self.floor + cosine).max(0.0)
    }

    pub fn state(&self, step: usize, steps_per_epoch: usize) -> ScheduleState {
        let phase = if step < self.warmup_steps {
            SchedulePhase::Warmup
        } else if step < self.total_steps {
            SchedulePhase::Decay
        } else {
            SchedulePhase::Done
        };
        ScheduleState {
            step,
            epoch: step / steps_per_epoch.max(1),
            phase,
            lr: self.rate(step),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fifty_epochs() -> WarmupCosine {
        WarmupCosine::from_epochs(1e-3, 5, 50, 100, 0.0).unwrap()
    }

    #[test]
    fn warmup_then_cosine_landmarks() {
        let s = fifty_epochs();
        assert_eq!(s.warmup_steps, 500);
        assert_eq!(s.total_steps, 5000);
        assert_eq!(s.rate(0), 0.0);
        assert!((s.rate(250) - 5e-4).abs() < 1e-15);
        assert_eq!(s.rate(500), 1e-3);
        assert_eq!(s.rate(5000), 0.0);
        assert_eq!(s.rate(9000), 0.0);
    }

    #[test]
    fn decay_is_non_increasing_and_non_negative() {
        let s = WarmupCosine::new(3e-4, 7, 113, 1e-5).unwrap();
        let mut prev = s.rate(7);
        for step in 8..=200 {
            let r = s.rate(step);
            assert!(r >= 0.0);
            assert!(r <= prev, "step {step}: {r} > {prev}");
            prev = r;
        }
        assert_eq!(s.rate(113), 1e-5);
    }

    #[test]
    fn no_warmup_starts_at_base() {
        let s = WarmupCosine::new(0.01, 0, 10, 0.0).unwrap();
        assert_eq!(s.rate(0), 0.01);
    }

    #[test]
    fn warmup_equal_to_total_ends_at_floor() {
        let s = WarmupCosine::new(0.01, 10, 10, 0.001).unwrap();
        assert_eq!(s.rate(10), 0.001);
    }

    #[test]
    fn state_reports_phase_and_epoch() {
        let s = fifty_epochs();
        let st = s.state(650, 100);
        assert_eq!(st.epoch, 6);
        assert_eq!(st.phase, SchedulePhase::Decay);
        assert_eq!(s.state(499, 100).phase, SchedulePhase::Warmup);
        assert_eq!(s.state(5000, 100).phase, SchedulePhase::Done);
    }

    #[test]
    fn invalid_parameters_rejected() {
        assert_eq!(WarmupCosine::new(0.0, 0, 1, 0.0), Err(ScheduleError::BaseLr(0.0)));
        assert!(matches!(
            WarmupCosine::new(1e-3, 0, 1, 1e-2),
            Err(ScheduleError::Floor { .. })
        ));
        assert_eq!(WarmupCosine::new(1e-3, 0, 0, 0.0), Err(ScheduleError::NoSteps));
        assert!(matches!(
            WarmupCosine::new(1e-3, 5, 4, 0.0),
            Err(ScheduleError::WarmupTooLong { .. })
        ));
    }
}
