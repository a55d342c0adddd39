//! Three-phase sparsity schedule
//!
//! The kept fraction of adapter entries is a pure function of the 0-based
//! iteration index:
//!
//! | Phase  | Iterations                      | Rate |
//! |--------|---------------------------------|------|
//! | Full   | `it < full_iter`                | 1.0 |
//! | Anneal | `full_iter <= it < burnin_iter` | `s + (1 - s) * (1 - (it - full_iter) / (burnin_iter - full_iter))^3` |
//! | Steady | `it >= burnin_iter`             | `s` |

use serde::{Deserialize, Serialize};

use crate::config::ScheduleConfig;

/// Which part of the schedule an iteration falls in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulePhase {
    /// Dense updates, no pruning
    Full,
    /// Cubic decay towards the floor
    Anneal,
    /// Fixed floor density
    Steady,
}

impl std::fmt::Display for SchedulePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SchedulePhase::Full => "full",
            SchedulePhase::Anneal => "anneal",
            SchedulePhase::Steady => "steady",
        };
        f.pad(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SparsitySchedule {
    full_iter: usize,
    burnin_iter: usize,
    sparsity: f64,
    early_stop_loss: f64,
}

impl Default for SparsitySchedule {
    fn default() -> Self {
        Self::from(&ScheduleConfig::default())
    }
}

impl From<&ScheduleConfig> for SparsitySchedule {
    fn from(config: &ScheduleConfig) -> Self {
        Self {
            full_iter: config.full_iter,
            burnin_iter: config.burnin_iter,
            sparsity: config.sparsity,
            early_stop_loss: config.early_stop_loss,
        }
    }
}

impl SparsitySchedule {
    pub fn phase(&self, it: usize) -> SchedulePhase {
        if it < self.full_iter {
            SchedulePhase::Full
        } else if it < self.burnin_iter {
            SchedulePhase::Anneal
        } else {
            SchedulePhase::Steady
        }
    }

    /// Fraction of adapter entries kept at iteration `it`, in `[sparsity, 1]`
    pub fn rate(&self, it: usize) -> f64 {
        match self.phase(it) {
            SchedulePhase::Full => 1.0,
            SchedulePhase::Anneal => {
                let span = (self.burnin_iter - self.full_iter) as f64;
                let progress = (it - self.full_iter) as f64 / span;
                self.sparsity + (1.0 - self.sparsity) * (1.0 - progress).powi(3)
            }
            SchedulePhase::Steady => self.sparsity,
        }
    }

    /// Whether training halts after iteration `it` given its average loss
    pub fn should_stop(&self, it: usize, avg_loss: f64) -> bool {
        it > self.burnin_iter && avg_loss < self.early_stop_loss
    }

    pub fn burnin_iter(&self) -> usize {
        self.burnin_iter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_phase_is_dense() {
        let schedule = SparsitySchedule::default();
        for it in 0..3 {
            assert_eq!(schedule.rate(it), 1.0);
            assert_eq!(schedule.phase(it), SchedulePhase::Full);
        }
    }

    #[test]
    fn test_floor_from_burnin() {
        let schedule = SparsitySchedule::default();
        assert_eq!(schedule.rate(20), 0.05);
        assert_eq!(schedule.rate(69), 0.05);
        assert_eq!(schedule.phase(20), SchedulePhase::Steady);
    }

    #[test]
    fn test_anneal_strictly_decreasing_and_bounded() {
        let schedule = SparsitySchedule::default();
        assert_eq!(schedule.rate(3), 1.0);

        let rates: Vec<f64> = (2..=20).map(|it| schedule.rate(it)).collect();
        for pair in rates.windows(2).skip(1) {
            assert!(pair[1] < pair[0], "{:?}", pair);
        }
        for it in 0..40 {
            let rate = schedule.rate(it);
            assert!((0.05..=1.0).contains(&rate));
        }

        // 0.05 + 0.95 * (1 - 5/17)^3
        let expected = 0.05 + 0.95 * (12.0f64 / 17.0).powi(3);
        assert!((schedule.rate(8) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_should_stop_only_after_burnin() {
        let schedule = SparsitySchedule::default();
        assert!(!schedule.should_stop(20, 0.01));
        assert!(schedule.should_stop(21, 0.01));
        assert!(!schedule.should_stop(21, 0.1));
    }

    #[test]
    fn test_custom_schedule() {
        let schedule = SparsitySchedule::from(&ScheduleConfig {
            full_iter: 1,
            burnin_iter: 3,
            sparsity: 0.5,
            early_stop_loss: 0.2,
        });
        assert_eq!(schedule.rate(0), 1.0);
        assert_eq!(schedule.rate(1), 1.0);
        assert!((schedule.rate(2) - (0.5 + 0.5 * 0.125)).abs() < 1e-12);
        assert_eq!(schedule.rate(3), 0.5);
        assert_eq!(schedule.phase(2).to_string(), "anneal");
    }
}
