//! On-disk feature dataset and label-set filtering.
//!
//! Layout: `<data_dir>/<db>_<fold>_fold_<split>/train/*.json`, one example per
//! file, shaped as
//!
//! ```json
//! {"features": [[0.1, 0.2], [0.3, 0.4]], "segments": [{"start": 0, "end": 2, "label": 3}]}
//! ```
//!
//! Files are indexed at open time and decoded on demand in [`ExampleCollection::get`].

use crate::data::example::{ExampleCollection, FeatureExample, Segment};
use crate::error::MlError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tarcnn_core::{LabelMode, RunConfig, RunIdentity};
use walkdir::WalkDir;

/// Name of the split directory under each fold directory.
pub const TRAIN_SPLIT: &str = "train";

/// Which labels survive into training, and how they are numbered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelFilter {
    /// Keep every segment; labels must already be in `0..num_labels`.
    All { num_labels: usize },
    /// Keep only listed labels, renumbered to their position in `labels`.
    Subset { labels: Vec<u32> },
}

impl LabelFilter {
    pub fn from_config(config: &RunConfig) -> Self {
        match config.experiment.label_mode {
            LabelMode::AllAvailable => LabelFilter::All {
                num_labels: config.model.num_labels,
            },
            LabelMode::PaperReported => LabelFilter::Subset {
                labels: config.experiment.paper_labels.clone(),
            },
        }
    }

    /// Size of the active label set.
    pub fn class_count(&self) -> usize {
        match self {
            LabelFilter::All { num_labels } => *num_labels,
            LabelFilter::Subset { labels } => labels.len(),
        }
    }

    pub fn apply(&self, segments: Vec<Segment>) -> Result<Vec<Segment>, MlError> {
        match self {
            LabelFilter::All { num_labels } => {
                if let Some(seg) = segments.iter().find(|s| s.label as usize >= *num_labels) {
                    return Err(MlError::dataset(format!(
                        "label {} out of range for {num_labels} labels",
                        seg.label
                    )));
                }
                Ok(segments)
            }
            LabelFilter::Subset { labels } => Ok(segments
                .into_iter()
                .filter_map(|seg| {
                    let pos = labels.iter().position(|&l| l == seg.label)?;
                    Some(Segment {
                        label: pos as u32,
                        ..seg
                    })
                })
                .collect()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExampleFile {
    features: Vec<Vec<f32>>,
    #[serde(default)]
    segments: Vec<Segment>,
}

/// Lazily decoded directory of JSON feature files.
#[derive(Debug, Clone)]
pub struct FeatureDirDataset {
    root: PathBuf,
    files: Vec<PathBuf>,
    feature_dim: usize,
    filter: LabelFilter,
}

impl FeatureDirDataset {
    /// Index the training split for `identity` under `data_dir`.
    pub fn open(
        data_dir: &Path,
        identity: &RunIdentity,
        feature_dim: usize,
        filter: LabelFilter,
    ) -> Result<Self, MlError> {
        let root = data_dir.join(identity.data_subdir()).join(TRAIN_SPLIT);
        if !root.is_dir() {
            return Err(MlError::dataset(format!(
                "training split not found at {}",
                root.display()
            )));
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| MlError::dataset(format!("{}: {e}", root.display())))?;
            let path = entry.path();
            if entry.file_type().is_file() && path.extension().is_some_and(|ext| ext == "json") {
                files.push(path.to_path_buf());
            }
        }
        if files.is_empty() {
            return Err(MlError::dataset(format!(
                "no *.json examples in {}",
                root.display()
            )));
        }

        tracing::info!(
            root = %root.display(),
            examples = files.len(),
            classes = filter.class_count(),
            "Indexed feature dataset"
        );
        Ok(Self {
            root,
            files,
            feature_dim,
            filter,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn filter(&self) -> &LabelFilter {
        &self.filter
    }

    fn decode(&self, path: &Path) -> Result<FeatureExample, MlError> {
        let bad = |reason: String| MlError::dataset(format!("{}: {reason}", path.display()));

        let bytes = std::fs::read(path).map_err(|e| bad(e.to_string()))?;
        let file: ExampleFile = serde_json::from_slice(&bytes).map_err(|e| bad(e.to_string()))?;
        if file.features.is_empty() {
            return Err(bad("no frames".into()));
        }
        let segments = self.filter.apply(file.segments).map_err(|e| bad(e.to_string()))?;
        let example =
            FeatureExample::from_rows(file.features, segments).map_err(|e| bad(e.to_string()))?;
        if example.dim != self.feature_dim {
            return Err(bad(format!(
                "feature dim {} does not match configured {}",
                example.dim, self.feature_dim
            )));
        }
        Ok(example)
    }
}

impl ExampleCollection for FeatureDirDataset {
    fn len(&self) -> usize {
        self.files.len()
    }

    fn get(&self, index: usize) -> Result<FeatureExample, MlError> {
        let path = self.files.get(index).ok_or_else(|| {
            MlError::dataset(format!(
                "index {index} out of range for {} examples",
                self.files.len()
            ))
        })?;
        self.decode(path)
    }
}
