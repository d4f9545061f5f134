//! Iteration clock and stopping conditions.

use serde::{Deserialize, Serialize};
use std::fmt;
use tarcnn_core::config::StopConfig;

/// Monotonic (epoch, iteration) counter driving every cadence trigger.
///
/// Persisted inside each checkpoint and restored on resume, so limits and
/// cadences count from the start of the experiment rather than the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationClock {
    /// Completed passes over the collection.
    pub epoch: u64,
    /// Completed optimization steps.
    pub iteration: u64,
}

impl IterationClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one optimization step.
    pub fn advance(&mut self, crossed_epoch: bool) {
        self.iteration += 1;
        if crossed_epoch {
            self.epoch += 1;
        }
    }

    /// True when the current iteration is a positive multiple of `interval`.
    pub fn hits_iteration(&self, interval: u64) -> bool {
        interval > 0 && self.iteration > 0 && self.iteration % interval == 0
    }

    /// True when an epoch boundary was just crossed onto a multiple of `interval`.
    pub fn hits_epoch(&self, interval: u64, crossed_epoch: bool) -> bool {
        crossed_epoch && interval > 0 && self.epoch > 0 && self.epoch % interval == 0
    }

    /// True on iteration 0 or any multiple of `interval`.
    pub fn on_boundary(&self, interval: u64) -> bool {
        interval > 0 && self.iteration % interval == 0
    }
}

impl fmt::Display for IterationClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch {} / iteration {}", self.epoch, self.iteration)
    }
}

/// Why a run reached `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EpochLimit,
    IterationLimit,
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopReason::EpochLimit => "epoch limit reached",
            StopReason::IterationLimit => "iteration limit reached",
            StopReason::Cancelled => "cancelled by operator",
        })
    }
}

/// Epoch and/or iteration limits; the first one the clock reaches wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopCondition {
    pub epochs: Option<u64>,
    pub iterations: Option<u64>,
}

impl StopCondition {
    pub fn from_config(config: &StopConfig) -> Self {
        Self {
            epochs: config.epoch_limit(),
            iterations: config.iterations,
        }
    }

    /// Returns the limit the clock has reached, if any. When both are reached
    /// on the same step the iteration limit is reported.
    pub fn check(&self, clock: &IterationClock) -> Option<StopReason> {
        if self.iterations.is_some_and(|limit| clock.iteration >= limit) {
            return Some(StopReason::IterationLimit);
        }
        if self.epochs.is_some_and(|limit| clock.epoch >= limit) {
            return Some(StopReason::EpochLimit);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_counts_epochs_on_crossing_only() {
        let mut clock = IterationClock::new();
        clock.advance(false);
        clock.advance(true);
        clock.advance(false);
        assert_eq!(clock, IterationClock { epoch: 1, iteration: 3 });
    }

    #[test]
    fn test_iteration_cadence() {
        let mut clock = IterationClock::new();
        assert!(!clock.hits_iteration(2));
        assert!(clock.on_boundary(2));
        clock.advance(false);
        assert!(!clock.hits_iteration(2));
        clock.advance(false);
        assert!(clock.hits_iteration(2));
        assert!(clock.hits_iteration(1));
    }

    #[test]
    fn test_epoch_cadence_requires_crossing() {
        let clock = IterationClock { epoch: 10, iteration: 57 };
        assert!(clock.hits_epoch(10, true));
        assert!(!clock.hits_epoch(10, false));
        assert!(!clock.hits_epoch(3, true));
    }

    #[test]
    fn test_stop_first_limit_wins() {
        let stop = StopCondition {
            epochs: Some(2),
            iterations: Some(100),
        };
        assert_eq!(stop.check(&IterationClock { epoch: 1, iteration: 50 }), None);
        assert_eq!(
            stop.check(&IterationClock { epoch: 2, iteration: 60 }),
            Some(StopReason::EpochLimit)
        );
        let stop = StopCondition {
            epochs: Some(20),
            iterations: Some(5),
        };
        assert_eq!(
            stop.check(&IterationClock { epoch: 1, iteration: 5 }),
            Some(StopReason::IterationLimit)
        );
    }

    #[test]
    fn test_stop_tie_reports_iteration_limit() {
        let stop = StopCondition {
            epochs: Some(2),
            iterations: Some(4),
        };
        assert_eq!(
            stop.check(&IterationClock { epoch: 2, iteration: 4 }),
            Some(StopReason::IterationLimit)
        );
    }

    #[test]
    fn test_zero_epoch_limit_is_ignored() {
        let config = StopConfig {
            epochs: Some(0),
            iterations: Some(3),
        };
        let stop = StopCondition::from_config(&config);
        assert_eq!(stop.check(&IterationClock { epoch: 0, iteration: 2 }), None);
        assert_eq!(stop.check(&IterationClock { epoch: 7, iteration: 2 }), None);
        assert_eq!(
            stop.check(&IterationClock { epoch: 7, iteration: 3 }),
            Some(StopReason::IterationLimit)
        );
    }
}
