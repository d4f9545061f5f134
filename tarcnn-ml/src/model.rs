//! Trainable unit contract and the reference per-frame segment scorer.

use crate::checkpoint::Snapshot;
use crate::data::batch::Batch;
use crate::error::MlError;
use crate::optimizer::OptimizerState;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Scalar loss plus named components from one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LossReport {
    pub loss: f64,
    pub components: BTreeMap<String, f64>,
}

impl LossReport {
    pub fn new(loss: f64) -> Self {
        let mut components = BTreeMap::new();
        components.insert("loss".to_string(), loss);
        Self { loss, components }
    }

    pub fn with(mut self, name: &str, value: f64) -> Self {
        self.components.insert(name.to_string(), value);
        self
    }
}

/// The model as seen by the run loop.
///
/// `step` runs forward and backward on one batch and updates parameters in
/// place through the bound optimizer. Units must mask padded positions
/// (see [`crate::data::batch`]) out of their loss.
pub trait TrainableUnit: Snapshot + Send {
    fn param_count(&self) -> usize;

    fn step(&mut self, batch: &Batch, optimizer: &mut dyn OptimizerState) -> Result<LossReport, MlError>;
}

/// Background class index; label `l` maps to class `l + 1`.
pub const BACKGROUND: usize = 0;

const INIT_SCALE: f32 = 1e-3;

/// Per-frame linear softmax classifier over `labels + 1` classes.
///
/// Each valid frame's target is the label of the first segment covering it,
/// or background. Parameters are laid out as `W[dim][classes]` then `b[classes]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentScorer {
    feature_dim: usize,
    classes: usize,
    params: Vec<f32>,
}

impl SegmentScorer {
    pub fn new(feature_dim: usize, num_labels: usize, seed: Option<u64>) -> Result<Self, MlError> {
        if feature_dim == 0 || num_labels == 0 {
            return Err(MlError::model(format!(
                "scorer needs a positive feature dim and label count, got {feature_dim} and {num_labels}"
            )));
        }
        let classes = num_labels + 1;
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut params: Vec<f32> = (0..feature_dim * classes)
            .map(|_| rng.gen_range(-INIT_SCALE..INIT_SCALE))
            .collect();
        params.resize(params.len() + classes, 0.0);
        Ok(Self {
            feature_dim,
            classes,
            params,
        })
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn classes(&self) -> usize {
        self.classes
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    fn logits(&self, x: &[f32], out: &mut [f32]) {
        let (weights, bias) = self.params.split_at(self.feature_dim * self.classes);
        out.copy_from_slice(bias);
        for (d, &xd) in x.iter().enumerate() {
            let row = &weights[d * self.classes..(d + 1) * self.classes];
            for (o, &w) in out.iter_mut().zip(row) {
                *o += xd * w;
            }
        }
    }

    fn target(&self, batch: &Batch, i: usize, t: usize) -> Result<usize, MlError> {
        let t = t as i64;
        let class = batch
            .segments_of(i)
            .iter()
            .find(|s| s[0] <= t && t < s[1])
            .map_or(BACKGROUND, |s| s[2] as usize + 1);
        if class >= self.classes {
            return Err(MlError::model(format!(
                "segment label {} exceeds the scorer's {} labels",
                class - 1,
                self.classes - 1
            )));
        }
        Ok(class)
    }
}

impl TrainableUnit for SegmentScorer {
    fn param_count(&self) -> usize {
        self.params.len()
    }

    fn step(&mut self, batch: &Batch, optimizer: &mut dyn OptimizerState) -> Result<LossReport, MlError> {
        if batch.dim != self.feature_dim {
            return Err(MlError::model(format!(
                "batch feature dim {} does not match scorer dim {}",
                batch.dim, self.feature_dim
            )));
        }
        let k = self.classes;
        let bias_at = self.feature_dim * k;
        let mut grads = vec![0.0_f32; self.params.len()];
        let mut probs = vec![0.0_f32; k];
        let (mut total, mut correct, mut frames) = (0.0_f64, 0usize, 0usize);

        for i in 0..batch.len() {
            for t in 0..batch.frame_lengths[i] {
                let x = batch.frame(i, t);
                let target = self.target(batch, i, t)?;
                self.logits(x, &mut probs);

                let (argmax, max) = probs
                    .iter()
                    .copied()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (c, v)| if v > best.1 { (c, v) } else { best });
                let mut sum = 0.0_f32;
                for p in probs.iter_mut() {
                    *p = (*p - max).exp();
                    sum += *p;
                }
                for p in probs.iter_mut() {
                    *p /= sum;
                }

                total -= f64::from(probs[target].max(f32::MIN_POSITIVE)).ln();
                correct += usize::from(argmax == target);
                frames += 1;

                probs[target] -= 1.0;
                for (d, &xd) in x.iter().enumerate() {
                    for (g, &dl) in grads[d * k..(d + 1) * k].iter_mut().zip(&probs) {
                        *g += xd * dl;
                    }
                }
                for (g, &dl) in grads[bias_at..].iter_mut().zip(&probs) {
                    *g += dl;
                }
            }
        }
        if frames == 0 {
            return Err(MlError::model("batch has no valid frames"));
        }

        let scale = 1.0 / frames as f32;
        grads.iter_mut().for_each(|g| *g *= scale);
        optimizer.update(&mut self.params, &grads)?;

        let loss = total / frames as f64;
        Ok(LossReport::new(loss).with("accuracy", correct as f64 / frames as f64))
    }
}

impl Snapshot for SegmentScorer {
    fn snapshot(&self) -> Result<Vec<u8>, MlError> {
        Ok(serde_json::to_vec(self)?)
    }

    fn restore(&mut self, bytes: &[u8]) -> Result<(), MlError> {
        let restored: SegmentScorer = serde_json::from_slice(bytes)
            .map_err(|e| MlError::model(format!("undecodable scorer state: {e}")))?;
        if restored.feature_dim != self.feature_dim || restored.classes != self.classes {
            return Err(MlError::model(format!(
                "checkpoint scorer is {}x{}, this run expects {}x{}",
                restored.feature_dim, restored.classes, self.feature_dim, self.classes
            )));
        }
        if restored.params.len() != self.params.len() {
            return Err(MlError::model(format!(
                "checkpoint holds {} parameters, expected {}",
                restored.params.len(),
                self.params.len()
            )));
        }
        *self = restored;
        Ok(())
    }
}
