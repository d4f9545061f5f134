//! Optimizer families and their per-parameter state.
//!
//! [`OptimizerFamily`] is the single tagged type selecting both the update
//! rule and the schedule rule. The concrete [`Optimizer`] is bound to one
//! trainable unit's parameter vector at setup and is serialized on its own,
//! so a model and its optimizer can be warm-started independently.
//!
//! # Update rules
//!
//! ```text
//! momentum_sgd: v = momentum * v - lr * g;            p += v
//! adagrad:      h += g^2;                             p -= lr * g / (sqrt(h) + eps)
//! rmsprop:      ms = alpha * ms + (1 - alpha) * g^2;  p -= lr * g / (sqrt(ms) + eps)
//! adam:         m += (1 - b1) * (g - m); v += (1 - b2) * (g^2 - v)
//!               p -= alpha * sqrt(1 - b2^t) / (1 - b1^t) * m / (sqrt(v) + eps)
//! adadelta:     msg = rho * msg + (1 - rho) * g^2
//!               dx = sqrt((msdx + eps) / (msg + eps)) * g
//!               msdx = rho * msdx + (1 - rho) * dx^2;  p -= dx
//! ```
//!
//! Every rule first adds the weight-decay term `rate * p` to `g`.

use crate::checkpoint::Snapshot;
use crate::error::MlError;
use serde::{Deserialize, Serialize};
use std::fmt;
use tarcnn_core::OptimizerKind;
use tarcnn_core::config::OptimizerConfig;

/// The scalar that controls a family's effective step size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepSizeParam {
    /// A nominal learning rate (`lr`).
    LearningRate,
    /// Adam's global scale (`alpha`).
    Alpha,
}

impl StepSizeParam {
    pub fn as_str(self) -> &'static str {
        match self {
            StepSizeParam::LearningRate => "lr",
            StepSizeParam::Alpha => "alpha",
        }
    }
}

impl fmt::Display for StepSizeParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optimizer family together with its hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum OptimizerFamily {
    MomentumSgd { lr: f64, momentum: f64 },
    AdaGrad { lr: f64, eps: f64 },
    RmsProp { lr: f64, alpha: f64, eps: f64 },
    Adam { alpha: f64, beta1: f64, beta2: f64, eps: f64 },
    AdaDelta { rho: f64, eps: f64 },
}

impl OptimizerFamily {
    pub fn from_config(config: &OptimizerConfig) -> Self {
        match config.kind {
            OptimizerKind::Sgd => OptimizerFamily::MomentumSgd {
                lr: config.lr,
                momentum: config.momentum,
            },
            OptimizerKind::AdaGrad => OptimizerFamily::AdaGrad {
                lr: config.lr,
                eps: 1e-8,
            },
            OptimizerKind::RmsProp => OptimizerFamily::RmsProp {
                lr: config.lr,
                alpha: 0.99,
                eps: 1e-8,
            },
            OptimizerKind::Adam => OptimizerFamily::Adam {
                alpha: config.lr,
                beta1: 0.9,
                beta2: 0.999,
                eps: 1e-8,
            },
            OptimizerKind::AdaDelta => OptimizerFamily::AdaDelta { rho: 0.95, eps: 1e-6 },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OptimizerFamily::MomentumSgd { .. } => "momentum_sgd",
            OptimizerFamily::AdaGrad { .. } => "adagrad",
            OptimizerFamily::RmsProp { .. } => "rmsprop",
            OptimizerFamily::Adam { .. } => "adam",
            OptimizerFamily::AdaDelta { .. } => "adadelta",
        }
    }

    /// Which scalar controls this family's step size, if any.
    pub fn step_size_param(&self) -> Option<StepSizeParam> {
        match self {
            OptimizerFamily::MomentumSgd { .. }
            | OptimizerFamily::AdaGrad { .. }
            | OptimizerFamily::RmsProp { .. } => Some(StepSizeParam::LearningRate),
            OptimizerFamily::Adam { .. } => Some(StepSizeParam::Alpha),
            OptimizerFamily::AdaDelta { .. } => None,
        }
    }

    /// Current value of the step-size scalar.
    pub fn step_size(&self) -> Option<f64> {
        match self {
            OptimizerFamily::MomentumSgd { lr, .. }
            | OptimizerFamily::AdaGrad { lr, .. }
            | OptimizerFamily::RmsProp { lr, .. } => Some(*lr),
            OptimizerFamily::Adam { alpha, .. } => Some(*alpha),
            OptimizerFamily::AdaDelta { .. } => None,
        }
    }

    /// Overwrite the named step-size scalar. Fails if the family does not
    /// expose `param`.
    pub fn set_step_size(&mut self, param: StepSizeParam, value: f64) -> Result<(), MlError> {
        if !(value.is_finite() && value > 0.0) {
            return Err(MlError::optimizer(format!(
                "{param} must be positive and finite, got {value}"
            )));
        }
        let name = self.name();
        match (self, param) {
            (OptimizerFamily::MomentumSgd { lr, .. }, StepSizeParam::LearningRate)
            | (OptimizerFamily::AdaGrad { lr, .. }, StepSizeParam::LearningRate)
            | (OptimizerFamily::RmsProp { lr, .. }, StepSizeParam::LearningRate) => {
                *lr = value;
                Ok(())
            }
            (OptimizerFamily::Adam { alpha, .. }, StepSizeParam::Alpha) => {
                *alpha = value;
                Ok(())
            }
            _ => Err(MlError::optimizer(format!(
                "{name} has no step-size parameter named '{param}'"
            ))),
        }
    }
}

/// Optimizer contract the run loop and schedule policy depend on.
pub trait OptimizerState: Snapshot + Send {
    fn family(&self) -> &OptimizerFamily;

    /// Number of parameters this optimizer was bound to at setup.
    fn param_count(&self) -> usize;

    /// Apply one update to `params` given their gradients.
    fn update(&mut self, params: &mut [f32], grads: &[f32]) -> Result<(), MlError>;

    /// Set a step-size scalar to `new_value` on behalf of the schedule policy.
    fn apply_decay(&mut self, param: StepSizeParam, new_value: f64) -> Result<(), MlError>;
}

/// Optimizer state for a flat parameter vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Optimizer {
    family: OptimizerFamily,
    weight_decay: f64,
    /// Per-family first slot: velocity, Adam `m`, or AdaDelta `msg`.
    first: Vec<f32>,
    /// Per-family second slot: AdaGrad `h`, RMSprop `ms`, Adam `v`, or AdaDelta `msdx`.
    second: Vec<f32>,
    /// Update count, used by Adam's bias correction.
    t: u64,
}

impl Optimizer {
    /// Bind a fresh optimizer to a unit with `param_count` parameters.
    pub fn setup(family: OptimizerFamily, weight_decay: f64, param_count: usize) -> Self {
        let (first, second) = match family {
            OptimizerFamily::MomentumSgd { .. } => (param_count, 0),
            OptimizerFamily::AdaGrad { .. } | OptimizerFamily::RmsProp { .. } => (0, param_count),
            OptimizerFamily::Adam { .. } | OptimizerFamily::AdaDelta { .. } => {
                (param_count, param_count)
            }
        };
        Self {
            family,
            weight_decay,
            first: vec![0.0; first],
            second: vec![0.0; second],
            t: 0,
        }
    }

    pub fn from_config(config: &OptimizerConfig, param_count: usize) -> Self {
        Self::setup(
            OptimizerFamily::from_config(config),
            config.weight_decay,
            param_count,
        )
    }

    pub fn weight_decay(&self) -> f64 {
        self.weight_decay
    }

    pub fn timestep(&self) -> u64 {
        self.t
    }

    fn bound_len(&self) -> usize {
        self.first.len().max(self.second.len())
    }
}

impl Snapshot for Optimizer {
    fn snapshot(&self) -> Result<Vec<u8>, MlError> {
        Ok(serde_json::to_vec(self)?)
    }

    fn restore(&mut self, bytes: &[u8]) -> Result<(), MlError> {
        let restored: Optimizer = serde_json::from_slice(bytes)
            .map_err(|e| MlError::optimizer(format!("undecodable optimizer state: {e}")))?;
        if restored.family.name() != self.family.name() {
            return Err(MlError::optimizer(format!(
                "checkpoint holds {} state but this run uses {}",
                restored.family.name(),
                self.family.name()
            )));
        }
        let expected = Optimizer::setup(restored.family.clone(), restored.weight_decay, self.param_count());
        if restored.first.len() != expected.first.len() || restored.second.len() != expected.second.len() {
            return Err(MlError::optimizer(format!(
                "checkpoint state is bound to {} parameters but the unit has {}",
                restored.bound_len(),
                self.param_count()
            )));
        }
        *self = restored;
        Ok(())
    }
}

impl OptimizerState for Optimizer {
    fn family(&self) -> &OptimizerFamily {
        &self.family
    }

    fn param_count(&self) -> usize {
        self.bound_len()
    }

    fn update(&mut self, params: &mut [f32], grads: &[f32]) -> Result<(), MlError> {
        if params.len() != self.bound_len() || grads.len() != params.len() {
            return Err(MlError::optimizer(format!(
                "bound to {} parameters, got {} parameters and {} gradients",
                self.bound_len(),
                params.len(),
                grads.len()
            )));
        }
        self.t += 1;
        let wd = self.weight_decay as f32;
        let t = i32::try_from(self.t).unwrap_or(i32::MAX);

        match self.family {
            OptimizerFamily::MomentumSgd { lr, momentum } => {
                let (lr, momentum) = (lr as f32, momentum as f32);
                for ((p, &g), v) in params.iter_mut().zip(grads).zip(self.first.iter_mut()) {
                    let g = g + wd * *p;
                    *v = momentum * *v - lr * g;
                    *p += *v;
                }
            }
            OptimizerFamily::AdaGrad { lr, eps } => {
                let (lr, eps) = (lr as f32, eps as f32);
                for ((p, &g), h) in params.iter_mut().zip(grads).zip(self.second.iter_mut()) {
                    let g = g + wd * *p;
                    *h += g * g;
                    *p -= lr * g / (h.sqrt() + eps);
                }
            }
            OptimizerFamily::RmsProp { lr, alpha, eps } => {
                let (lr, alpha, eps) = (lr as f32, alpha as f32, eps as f32);
                for ((p, &g), ms) in params.iter_mut().zip(grads).zip(self.second.iter_mut()) {
                    let g = g + wd * *p;
                    *ms = alpha * *ms + (1.0 - alpha) * g * g;
                    *p -= lr * g / (ms.sqrt() + eps);
                }
            }
            OptimizerFamily::Adam {
                alpha,
                beta1,
                beta2,
                eps,
            } => {
                let fix1 = 1.0 - beta1.powi(t);
                let fix2 = 1.0 - beta2.powi(t);
                let lr_t = (alpha * fix2.sqrt() / fix1) as f32;
                let (b1, b2, eps) = (beta1 as f32, beta2 as f32, eps as f32);
                for (((p, &g), m), v) in params
                    .iter_mut()
                    .zip(grads)
                    .zip(self.first.iter_mut())
                    .zip(self.second.iter_mut())
                {
                    let g = g + wd * *p;
                    *m += (1.0 - b1) * (g - *m);
                    *v += (1.0 - b2) * (g * g - *v);
                    *p -= lr_t * *m / (v.sqrt() + eps);
                }
            }
            OptimizerFamily::AdaDelta { rho, eps } => {
                let (rho, eps) = (rho as f32, eps as f32);
                for (((p, &g), msg), msdx) in params
                    .iter_mut()
                    .zip(grads)
                    .zip(self.first.iter_mut())
                    .zip(self.second.iter_mut())
                {
                    let g = g + wd * *p;
                    *msg = rho * *msg + (1.0 - rho) * g * g;
                    let dx = ((*msdx + eps) / (*msg + eps)).sqrt() * g;
                    *msdx = rho * *msdx + (1.0 - rho) * dx * dx;
                    *p -= dx;
                }
            }
        }
        Ok(())
    }

    fn apply_decay(&mut self, param: StepSizeParam, new_value: f64) -> Result<(), MlError> {
        self.family.set_step_size(param, new_value)
    }
}
