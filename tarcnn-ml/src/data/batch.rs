//! Batch assembly with explicit padding.
//!
//! Examples differ in frame count and segment count. A batch pads every
//! example to the longest one so the arrays are rectangular:
//!
//! - feature rows past an example's `frame_lengths[i]` are [`FEATURE_PAD`];
//! - segment rows past `segment_counts[i]` are `[SEGMENT_PAD; 3]`.
//!
//! Real segment coordinates and labels are never negative, so `SEGMENT_PAD`
//! cannot be confused with data. The lengths travel with the batch; masking
//! padded positions out of the loss is the trainable unit's job.

use crate::data::example::FeatureExample;
use crate::error::MlError;

/// Fill value for padded feature frames.
pub const FEATURE_PAD: f32 = 0.0;

/// Fill value for every field of a padded segment row.
pub const SEGMENT_PAD: i64 = -1;

/// A rectangular batch of examples.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Collection indices of the examples, in batch order.
    pub indices: Vec<usize>,
    /// True when this batch completes a pass over the collection.
    pub crosses_epoch: bool,
    pub dim: usize,
    pub max_frames: usize,
    /// `[len][max_frames][dim]`, row-major.
    pub features: Vec<f32>,
    pub frame_lengths: Vec<usize>,
    pub max_segments: usize,
    /// `[len][max_segments]` rows of `[start, end, label]`.
    pub segments: Vec<[i64; 3]>,
    pub segment_counts: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Feature row `t` of example `i` (may be padding).
    pub fn frame(&self, i: usize, t: usize) -> &[f32] {
        let start = (i * self.max_frames + t) * self.dim;
        &self.features[start..start + self.dim]
    }

    /// Real (unpadded) segment rows of example `i`.
    pub fn segments_of(&self, i: usize) -> &[[i64; 3]] {
        let start = i * self.max_segments;
        &self.segments[start..start + self.segment_counts[i]]
    }
}

/// Stack `examples` into one padded batch.
pub fn collate(
    examples: Vec<FeatureExample>,
    indices: Vec<usize>,
    crosses_epoch: bool,
) -> Result<Batch, MlError> {
    if examples.is_empty() {
        return Err(MlError::feeder("cannot collate an empty batch"));
    }
    if examples.len() != indices.len() {
        return Err(MlError::feeder(format!(
            "{} examples for {} indices",
            examples.len(),
            indices.len()
        )));
    }
    let dim = examples[0].dim;
    if let Some((pos, ex)) = examples.iter().enumerate().find(|(_, e)| e.dim != dim) {
        return Err(MlError::dataset(format!(
            "example {} has feature dim {}, batch has {dim}",
            indices[pos], ex.dim
        )));
    }

    let max_frames = examples.iter().map(|e| e.frames).max().unwrap_or(0);
    let max_segments = examples.iter().map(|e| e.segments.len()).max().unwrap_or(0);
    let n = examples.len();

    let mut features = Vec::with_capacity(n * max_frames * dim);
    let mut segments = Vec::with_capacity(n * max_segments);
    let mut frame_lengths = Vec::with_capacity(n);
    let mut segment_counts = Vec::with_capacity(n);

    for ex in &examples {
        features.extend_from_slice(&ex.features);
        features.resize(features.len() + (max_frames - ex.frames) * dim, FEATURE_PAD);
        frame_lengths.push(ex.frames);

        segments.extend(
            ex.segments
                .iter()
                .map(|s| [i64::from(s.start), i64::from(s.end), i64::from(s.label)]),
        );
        segments.resize(segments.len() + (max_segments - ex.segments.len()), [SEGMENT_PAD; 3]);
        segment_counts.push(ex.segments.len());
    }

    Ok(Batch {
        indices,
        crosses_epoch,
        dim,
        max_frames,
        features,
        frame_lengths,
        max_segments,
        segments,
        segment_counts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::example::Segment;
    use pretty_assertions::assert_eq;

    fn example(frames: usize, segments: Vec<Segment>) -> FeatureExample {
        FeatureExample::from_rows(vec![vec![1.0, 1.0]; frames], segments).unwrap()
    }

    #[test]
    fn test_pads_frames_and_segments() {
        let batch = collate(
            vec![
                example(3, vec![Segment { start: 0, end: 2, label: 1 }]),
                example(1, vec![]),
            ],
            vec![4, 7],
            false,
        )
        .unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.max_frames, 3);
        assert_eq!(batch.frame_lengths, vec![3, 1]);
        assert_eq!(batch.frame(1, 0), &[1.0, 1.0]);
        assert_eq!(batch.frame(1, 2), &[FEATURE_PAD, FEATURE_PAD]);
        assert_eq!(batch.max_segments, 1);
        assert_eq!(batch.segments, vec![[0, 2, 1], [SEGMENT_PAD; 3]]);
        assert_eq!(batch.segments_of(1), &[] as &[[i64; 3]]);
        assert_eq!(batch.features.len(), 2 * 3 * 2);
    }

    #[test]
    fn test_rejects_mixed_dims() {
        let a = example(1, vec![]);
        let b = FeatureExample::from_rows(vec![vec![0.0; 3]], vec![]).unwrap();
        assert!(collate(vec![a, b], vec![0, 1], false).is_err());
    }

    #[test]
    fn test_rejects_empty() {
        assert!(collate(vec![], vec![], false).is_err());
    }
}
