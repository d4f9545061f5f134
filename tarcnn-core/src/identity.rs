//! Run identity: deterministic, collision-free names for a run's artifacts.
//!
//! All artifacts of one experiment share a stem of the form
//! `<database>_<fold>_fold_<split>_<label-mode>`. Reading a name from the
//! right recovers every coordinate: the label-mode token comes from a fixed
//! vocabulary, the split and fold are delimiter-bounded decimal integers, and
//! whatever remains is the database. Two distinct coordinate tuples therefore
//! never share a name.

use crate::config::{LabelMode, RunConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Kinds of artifact a run writes to its output directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Model,
    Optimizer,
    Log,
    Plot,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 4] = [
        ArtifactKind::Model,
        ArtifactKind::Optimizer,
        ArtifactKind::Log,
        ArtifactKind::Plot,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Model => "model",
            ArtifactKind::Optimizer => "optimizer",
            ArtifactKind::Log => "log",
            ArtifactKind::Plot => "plot",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The coordinates that identify a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunIdentity {
    pub database: String,
    pub fold: u32,
    pub split_idx: u32,
    pub label_mode: LabelMode,
}

impl RunIdentity {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            database: config.experiment.database.clone(),
            fold: config.experiment.fold,
            split_idx: config.experiment.split_idx,
            label_mode: config.experiment.label_mode,
        }
    }

    /// `<database>_<fold>_fold_<split>_<label-mode>`.
    pub fn stem(&self) -> String {
        format!(
            "{}_{}_fold_{}_{}",
            self.database,
            self.fold,
            self.split_idx,
            self.label_mode.tag()
        )
    }

    /// File name for one artifact of this run.
    pub fn artifact_name(&self, kind: ArtifactKind) -> String {
        let stem = self.stem();
        match kind {
            ArtifactKind::Model => format!("time_axis_rcnn_{stem}_model.ckpt"),
            ArtifactKind::Optimizer => format!("time_axis_rcnn_{stem}_optimizer.ckpt"),
            ArtifactKind::Log => format!("log_{stem}.log"),
            ArtifactKind::Plot => format!("loss_{stem}.png"),
        }
    }

    pub fn artifact_path(&self, out_dir: &Path, kind: ArtifactKind) -> PathBuf {
        out_dir.join(self.artifact_name(kind))
    }

    /// PID file name. Label mode is not part of it, so two label modes of the
    /// same split share one PID file.
    pub fn pid_file_name(&self) -> String {
        format!("{}_{}_fold_{}.pid", self.database, self.fold, self.split_idx)
    }

    /// Subdirectory of the feature tree holding this run's examples.
    pub fn data_subdir(&self) -> String {
        format!("{}_{}_fold_{}", self.database, self.fold, self.split_idx)
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stem())
    }
}

/// Artifact name for `kind` under `config`. Pure and total.
pub fn identity(config: &RunConfig, kind: ArtifactKind) -> String {
    RunIdentity::from_config(config).artifact_name(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(database: &str, fold: u32, split: u32, mode: LabelMode) -> RunConfig {
        let mut config = RunConfig::default();
        config.experiment.database = database.into();
        config.experiment.fold = fold;
        config.experiment.split_idx = split;
        config.experiment.label_mode = mode;
        config
    }

    #[test]
    fn test_model_name_layout() {
        let c = config("BP4D", 3, 1, LabelMode::AllAvailable);
        assert_eq!(
            identity(&c, ArtifactKind::Model),
            "time_axis_rcnn_BP4D_3_fold_1_all_avail_label_model.ckpt"
        );
        assert_eq!(
            identity(&c, ArtifactKind::Optimizer),
            "time_axis_rcnn_BP4D_3_fold_1_all_avail_label_optimizer.ckpt"
        );
        assert_eq!(identity(&c, ArtifactKind::Log), "log_BP4D_3_fold_1_all_avail_label.log");
        assert_eq!(identity(&c, ArtifactKind::Plot), "loss_BP4D_3_fold_1_all_avail_label.png");
    }

    #[test]
    fn test_each_coordinate_changes_name() {
        let base = config("BP4D", 3, 1, LabelMode::AllAvailable);
        let variants = [
            config("DISFA", 3, 1, LabelMode::AllAvailable),
            config("BP4D", 10, 1, LabelMode::AllAvailable),
            config("BP4D", 3, 2, LabelMode::AllAvailable),
            config("BP4D", 3, 1, LabelMode::PaperReported),
        ];
        for kind in ArtifactKind::ALL {
            for other in &variants {
                assert_ne!(identity(&base, kind), identity(other, kind));
            }
        }
    }

    #[test]
    fn test_underscored_database_does_not_collide() {
        let a = config("BP4D_DISFA", 3, 1, LabelMode::AllAvailable);
        let b = config("BP4D", 3, 1, LabelMode::AllAvailable);
        assert_ne!(identity(&a, ArtifactKind::Model), identity(&b, ArtifactKind::Model));
    }

    #[test]
    fn test_ignores_non_identity_fields() {
        let a = config("BP4D", 3, 1, LabelMode::AllAvailable);
        let mut b = a.clone();
        b.data.batch_size = 16;
        b.optimizer.lr = 0.1;
        assert_eq!(RunIdentity::from_config(&a), RunIdentity::from_config(&b));
    }

    #[test]
    fn test_pid_and_data_dir_names() {
        let id = RunIdentity::from_config(&config("BP4D", 3, 2, LabelMode::PaperReported));
        assert_eq!(id.pid_file_name(), "BP4D_3_fold_2.pid");
        assert_eq!(id.data_subdir(), "BP4D_3_fold_2");
        assert_eq!(id.to_string(), "BP4D_3_fold_2_use_paper_num_label");
    }
}
