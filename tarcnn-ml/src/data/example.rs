//! Training examples and the collection contract the feeder draws from.

use crate::error::MlError;
use serde::{Deserialize, Serialize};

/// A labelled action segment over frames `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub start: u32,
    pub end: u32,
    pub label: u32,
}

/// One decoded training example: a per-frame feature sequence and its segments.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureExample {
    pub frames: usize,
    pub dim: usize,
    /// Row-major `[frames][dim]`.
    pub features: Vec<f32>,
    pub segments: Vec<Segment>,
}

impl FeatureExample {
    /// Build an example from per-frame rows. All rows must share one width.
    pub fn from_rows(rows: Vec<Vec<f32>>, segments: Vec<Segment>) -> Result<Self, MlError> {
        let frames = rows.len();
        let dim = rows.first().map_or(0, Vec::len);
        if let Some((t, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != dim) {
            return Err(MlError::dataset(format!(
                "frame {t} has {} features, expected {dim}",
                row.len()
            )));
        }
        let example = Self {
            frames,
            dim,
            features: rows.into_iter().flatten().collect(),
            segments,
        };
        example.check_segments()?;
        Ok(example)
    }

    pub fn frame(&self, t: usize) -> &[f32] {
        &self.features[t * self.dim..(t + 1) * self.dim]
    }

    fn check_segments(&self) -> Result<(), MlError> {
        for seg in &self.segments {
            if seg.start >= seg.end || seg.end as usize > self.frames {
                return Err(MlError::dataset(format!(
                    "segment [{}, {}) does not fit in {} frames",
                    seg.start, seg.end, self.frames
                )));
            }
        }
        Ok(())
    }
}

/// A finite, indexable collection of examples.
///
/// `get` may decode lazily; in parallel mode it runs on feeder workers.
pub trait ExampleCollection: Send + Sync + 'static {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Result<FeatureExample, MlError>;
}

/// Examples held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCollection {
    examples: Vec<FeatureExample>,
}

impl InMemoryCollection {
    pub fn new(examples: Vec<FeatureExample>) -> Self {
        Self { examples }
    }
}

impl ExampleCollection for InMemoryCollection {
    fn len(&self) -> usize {
        self.examples.len()
    }

    fn get(&self, index: usize) -> Result<FeatureExample, MlError> {
        self.examples.get(index).cloned().ok_or_else(|| {
            MlError::dataset(format!(
                "index {index} out of range for {} examples",
                self.examples.len()
            ))
        })
    }
}
