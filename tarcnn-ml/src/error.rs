//! Error types for the tarcnn-ml crate.

use std::path::PathBuf;
use tarcnn_core::ArtifactKind;
use thiserror::Error;

/// Top-level error type for training-run operations.
#[derive(Debug, Error)]
pub enum MlError {
    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Data feeder error: {0}")]
    Feeder(String),

    #[error("Malformed {kind} checkpoint at {}: {reason}", path.display())]
    MalformedCheckpoint {
        kind: ArtifactKind,
        path: PathBuf,
        reason: String,
    },

    #[error("Failed to write {kind} checkpoint to {}: {source}", path.display())]
    CheckpointWrite {
        kind: ArtifactKind,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Optimizer error: {0}")]
    Optimizer(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Core error: {0}")]
    Core(#[from] tarcnn_core::CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl MlError {
    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    pub fn feeder(msg: impl Into<String>) -> Self {
        Self::Feeder(msg.into())
    }

    pub fn malformed(kind: ArtifactKind, path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MalformedCheckpoint {
            kind,
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn schedule(msg: impl Into<String>) -> Self {
        Self::Schedule(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    pub fn optimizer(msg: impl Into<String>) -> Self {
        Self::Optimizer(msg.into())
    }

    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Stage of the run this error belongs to, for operator-facing reports.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Dataset(_) => "dataset",
            Self::Feeder(_) => "data feeder",
            Self::MalformedCheckpoint { kind, .. } | Self::CheckpointWrite { kind, .. } => {
                match kind {
                    ArtifactKind::Model => "model checkpoint",
                    ArtifactKind::Optimizer => "optimizer checkpoint",
                    ArtifactKind::Log => "log report",
                    ArtifactKind::Plot => "plot report",
                }
            }
            Self::Schedule(_) => "schedule policy",
            Self::Model(_) => "trainable unit",
            Self::Optimizer(_) => "optimizer",
            Self::Config(_) | Self::Core(_) => "configuration",
            Self::Training(_) | Self::Io(_) | Self::Serde(_) => "run loop",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_reports_artifact_and_path() {
        let err = MlError::malformed(ArtifactKind::Optimizer, "/out/x_optimizer.ckpt", "checksum mismatch");
        assert_eq!(
            err.to_string(),
            "Malformed optimizer checkpoint at /out/x_optimizer.ckpt: checksum mismatch"
        );
        assert_eq!(err.stage(), "optimizer checkpoint");
    }

    #[test]
    fn test_feeder_stage() {
        assert_eq!(MlError::feeder("worker crashed").stage(), "data feeder");
    }

    #[test]
    fn test_io_and_serde_failures_belong_to_run_loop() {
        let io = MlError::from(std::io::Error::other("disk gone"));
        assert_eq!(io.stage(), "run loop");
        let serde = MlError::from(serde_json::from_str::<u32>("nope").unwrap_err());
        assert_eq!(serde.stage(), "run loop");
        assert_eq!(MlError::training("stalled").stage(), "run loop");
    }
}
