//! Step-size schedule policy, chosen once per run from the optimizer family.
//!
//! | Family                          | Decayed scalar | Trigger                  |
//! |---------------------------------|----------------|--------------------------|
//! | momentum SGD, AdaGrad, RMSprop  | `lr`           | every `interval_epochs`  |
//! | Adam                            | `alpha`        | every `interval_epochs`  |
//! | AdaDelta                        | none           | never                    |
//!
//! Each shift multiplies the current value by `factor`.

use crate::error::MlError;
use crate::optimizer::{OptimizerFamily, OptimizerState, StepSizeParam};
use crate::training::clock::IterationClock;
use tarcnn_core::config::ScheduleConfig;

/// The one rule active for a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduleRule {
    Decay {
        param: StepSizeParam,
        interval_epochs: u64,
        factor: f64,
    },
    Disabled,
}

/// A step-size change applied by the policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Shift {
    pub param: StepSizeParam,
    pub from: f64,
    pub to: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulePolicy {
    rule: ScheduleRule,
}

impl SchedulePolicy {
    /// Select the rule for `family`.
    ///
    /// `config.enabled` unset follows the family default; `Some(true)` for a
    /// family with no step-size scalar is a configuration error.
    pub fn for_family(family: &OptimizerFamily, config: &ScheduleConfig) -> Result<Self, MlError> {
        let rule = match (family.step_size_param(), config.enabled) {
            (_, Some(false)) => ScheduleRule::Disabled,
            (None, Some(true)) => {
                return Err(MlError::config(format!(
                    "schedule.enabled = true but {} has no step-size parameter to decay",
                    family.name()
                )));
            }
            (None, None) => ScheduleRule::Disabled,
            (Some(param), _) => ScheduleRule::Decay {
                param,
                interval_epochs: config.interval_epochs,
                factor: config.factor,
            },
        };
        tracing::debug!(family = family.name(), ?rule, "Selected schedule rule");
        Ok(Self { rule })
    }

    pub fn rule(&self) -> &ScheduleRule {
        &self.rule
    }

    /// Whether the clock, just advanced, has reached a decay trigger.
    pub fn is_due(&self, clock: &IterationClock, crossed_epoch: bool) -> bool {
        match self.rule {
            ScheduleRule::Decay { interval_epochs, .. } => clock.hits_epoch(interval_epochs, crossed_epoch),
            ScheduleRule::Disabled => false,
        }
    }

    /// Apply one shift unconditionally. `Disabled` never touches the optimizer.
    pub fn apply(&self, optimizer: &mut dyn OptimizerState) -> Result<Option<Shift>, MlError> {
        let ScheduleRule::Decay { param, factor, .. } = self.rule else {
            return Ok(None);
        };
        let family = optimizer.family();
        if family.step_size_param() != Some(param) {
            return Err(MlError::schedule(format!(
                "rule decays '{param}' but the optimizer is {}",
                family.name()
            )));
        }
        let from = family
            .step_size()
            .ok_or_else(|| MlError::schedule(format!("{} exposes no '{param}'", family.name())))?;
        let to = from * factor;
        optimizer.apply_decay(param, to)?;
        Ok(Some(Shift { param, from, to }))
    }

    /// Apply a shift if one is due at `clock`.
    pub fn on_iteration(
        &self,
        clock: &IterationClock,
        crossed_epoch: bool,
        optimizer: &mut dyn OptimizerState,
    ) -> Result<Option<Shift>, MlError> {
        if !self.is_due(clock, crossed_epoch) {
            return Ok(None);
        }
        let shift = self.apply(optimizer)?;
        if let Some(shift) = shift {
            tracing::info!(
                epoch = clock.epoch,
                iteration = clock.iteration,
                param = %shift.param,
                from = shift.from,
                to = shift.to,
                "Decayed step size"
            );
        }
        Ok(shift)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Snapshot;
    use crate::optimizer::Optimizer;
    use tarcnn_core::OptimizerKind;
    use tarcnn_core::config::OptimizerConfig;

    fn optimizer(kind: OptimizerKind) -> Optimizer {
        Optimizer::from_config(
            &OptimizerConfig {
                kind,
                lr: 0.1,
                ..OptimizerConfig::default()
            },
            4,
        )
    }

    fn policy(opt: &Optimizer, enabled: Option<bool>) -> Result<SchedulePolicy, MlError> {
        SchedulePolicy::for_family(
            opt.family(),
            &ScheduleConfig {
                enabled,
                interval_epochs: 10,
                factor: 0.1,
            },
        )
    }

    #[test]
    fn test_adadelta_is_never_scheduled() {
        let mut opt = optimizer(OptimizerKind::AdaDelta);
        let policy = policy(&opt, None).unwrap();
        assert_eq!(policy.rule(), &ScheduleRule::Disabled);

        let before = opt.snapshot().unwrap();
        let clock = IterationClock { epoch: 10, iteration: 100 };
        assert_eq!(policy.on_iteration(&clock, true, &mut opt).unwrap(), None);
        assert_eq!(policy.apply(&mut opt).unwrap(), None);
        assert_eq!(opt.snapshot().unwrap(), before);
    }

    #[test]
    fn test_adadelta_forced_schedule_is_config_error() {
        let opt = optimizer(OptimizerKind::AdaDelta);
        assert!(matches!(policy(&opt, Some(true)), Err(MlError::Config(_))));
    }

    #[test]
    fn test_adam_decays_alpha() {
        let mut opt = optimizer(OptimizerKind::Adam);
        let policy = policy(&opt, None).unwrap();
        let shift = policy.apply(&mut opt).unwrap().unwrap();
        assert_eq!(shift.param, StepSizeParam::Alpha);
        assert!((shift.to - 0.01).abs() < 1e-12);
        assert!(matches!(opt.family(), OptimizerFamily::Adam { alpha, .. } if (*alpha - 0.01).abs() < 1e-12));
    }

    #[test]
    fn test_rate_families_decay_lr() {
        for kind in [OptimizerKind::Sgd, OptimizerKind::AdaGrad, OptimizerKind::RmsProp] {
            let mut opt = optimizer(kind);
            let shift = policy(&opt, None).unwrap().apply(&mut opt).unwrap().unwrap();
            assert_eq!(shift.param, StepSizeParam::LearningRate);
            assert!((opt.family().step_size().unwrap() - 0.01).abs() < 1e-12);
        }
    }

    #[test]
    fn test_disabled_by_config() {
        let mut opt = optimizer(OptimizerKind::Sgd);
        let policy = policy(&opt, Some(false)).unwrap();
        assert_eq!(policy.apply(&mut opt).unwrap(), None);
        assert_eq!(opt.family().step_size(), Some(0.1));
    }

    #[test]
    fn test_cadence_fires_on_epoch_interval_crossings() {
        let mut opt = optimizer(OptimizerKind::Sgd);
        let policy = policy(&opt, None).unwrap();

        let mid_epoch = IterationClock { epoch: 10, iteration: 21 };
        assert!(!policy.is_due(&mid_epoch, false));
        let off_interval = IterationClock { epoch: 9, iteration: 18 };
        assert!(!policy.is_due(&off_interval, true));

        let boundary = IterationClock { epoch: 10, iteration: 20 };
        assert!(policy.on_iteration(&boundary, true, &mut opt).unwrap().is_some());
        assert!((opt.family().step_size().unwrap() - 0.01).abs() < 1e-12);
    }
}
