//! Checkpoint store: model and optimizer snapshots, keyed by run identity.
//!
//! Each artifact is one file in the output directory, overwritten in place
//! on every trigger. A file is a JSON envelope around the opaque payload; the
//! envelope pins the artifact kind, the run identity, the clock at save time,
//! and a SHA-256 of the payload. Resume is all-or-nothing per artifact: a
//! missing file is a cold start, anything that fails verification is fatal.

use crate::error::MlError;
use crate::training::clock::IterationClock;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tarcnn_core::persistence;
use tarcnn_core::{ArtifactKind, RunIdentity};

/// Envelope format understood by this build.
pub const CHECKPOINT_FORMAT: u32 = 1;

/// Serializable state that checkpoints can capture and restore.
///
/// `restore` must leave `self` untouched when it returns an error.
pub trait Snapshot {
    fn snapshot(&self) -> Result<Vec<u8>, MlError>;
    fn restore(&mut self, bytes: &[u8]) -> Result<(), MlError>;
}

/// On-disk checkpoint envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointEnvelope {
    pub format: u32,
    pub kind: ArtifactKind,
    pub identity: String,
    pub clock: IterationClock,
    pub saved_at: DateTime<Utc>,
    pub sha256: String,
    pub payload: String,
}

/// What a successful resume recovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resumed {
    pub clock: IterationClock,
    pub saved_at: DateTime<Utc>,
}

fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Restore `target` from the checkpoint at `path`, if one exists.
///
/// Returns `Ok(None)` when there is no file. Every verification failure is
/// reported as [`MlError::MalformedCheckpoint`] and leaves `target` as it was.
pub fn try_resume<T: Snapshot + ?Sized>(
    target: &mut T,
    path: &Path,
    kind: ArtifactKind,
    identity: &RunIdentity,
) -> Result<Option<Resumed>, MlError> {
    let Some(raw) = persistence::load_bytes(path)? else {
        return Ok(None);
    };

    let envelope: CheckpointEnvelope = serde_json::from_slice(&raw)
        .map_err(|e| MlError::malformed(kind, path, format!("unreadable envelope: {e}")))?;
    if envelope.format != CHECKPOINT_FORMAT {
        return Err(MlError::malformed(
            kind,
            path,
            format!("unsupported format {} (expected {CHECKPOINT_FORMAT})", envelope.format),
        ));
    }
    if envelope.kind != kind {
        return Err(MlError::malformed(
            kind,
            path,
            format!("file holds a {} checkpoint", envelope.kind),
        ));
    }
    let stem = identity.stem();
    if envelope.identity != stem {
        return Err(MlError::malformed(
            kind,
            path,
            format!("file belongs to run {}, not {stem}", envelope.identity),
        ));
    }
    let payload = BASE64
        .decode(envelope.payload.as_bytes())
        .map_err(|e| MlError::malformed(kind, path, format!("payload is not base64: {e}")))?;
    if digest(&payload) != envelope.sha256 {
        return Err(MlError::malformed(kind, path, "payload checksum mismatch"));
    }
    target
        .restore(&payload)
        .map_err(|e| MlError::malformed(kind, path, e.to_string()))?;

    Ok(Some(Resumed {
        clock: envelope.clock,
        saved_at: envelope.saved_at,
    }))
}

/// Write `source` to `path` atomically, replacing any previous checkpoint.
pub fn save<T: Snapshot + ?Sized>(
    source: &T,
    path: &Path,
    kind: ArtifactKind,
    identity: &RunIdentity,
    clock: IterationClock,
) -> Result<(), MlError> {
    let payload = source.snapshot()?;
    let envelope = CheckpointEnvelope {
        format: CHECKPOINT_FORMAT,
        kind,
        identity: identity.stem(),
        clock,
        saved_at: Utc::now(),
        sha256: digest(&payload),
        payload: BASE64.encode(&payload),
    };
    persistence::atomic_write_json(path, &envelope).map_err(|source| MlError::CheckpointWrite {
        kind,
        path: path.to_path_buf(),
        source,
    })
}

/// Checkpoint store for one run: fixed output directory and identity.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    out_dir: PathBuf,
    identity: RunIdentity,
}

impl CheckpointStore {
    pub fn new(out_dir: impl Into<PathBuf>, identity: RunIdentity) -> Self {
        Self {
            out_dir: out_dir.into(),
            identity,
        }
    }

    pub fn identity(&self) -> &RunIdentity {
        &self.identity
    }

    pub fn path(&self, kind: ArtifactKind) -> PathBuf {
        self.identity.artifact_path(&self.out_dir, kind)
    }

    pub fn try_resume_model<T: Snapshot + ?Sized>(&self, unit: &mut T) -> Result<Option<Resumed>, MlError> {
        self.resume_logged(unit, ArtifactKind::Model)
    }

    pub fn try_resume_optimizer<T: Snapshot + ?Sized>(
        &self,
        state: &mut T,
    ) -> Result<Option<Resumed>, MlError> {
        self.resume_logged(state, ArtifactKind::Optimizer)
    }

    pub fn save_model<T: Snapshot + ?Sized>(&self, unit: &T, clock: IterationClock) -> Result<(), MlError> {
        save(unit, &self.path(ArtifactKind::Model), ArtifactKind::Model, &self.identity, clock)
    }

    pub fn save_optimizer<T: Snapshot + ?Sized>(
        &self,
        state: &T,
        clock: IterationClock,
    ) -> Result<(), MlError> {
        save(
            state,
            &self.path(ArtifactKind::Optimizer),
            ArtifactKind::Optimizer,
            &self.identity,
            clock,
        )
    }

    fn resume_logged<T: Snapshot + ?Sized>(
        &self,
        target: &mut T,
        kind: ArtifactKind,
    ) -> Result<Option<Resumed>, MlError> {
        let path = self.path(kind);
        let resumed = try_resume(target, &path, kind, &self.identity)?;
        match &resumed {
            Some(r) => tracing::info!(
                artifact = %kind,
                path = %path.display(),
                epoch = r.clock.epoch,
                iteration = r.clock.iteration,
                "Loaded snapshot"
            ),
            None => tracing::info!(artifact = %kind, path = %path.display(), "No snapshot found, cold start"),
        }
        Ok(resumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarcnn_core::LabelMode;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Default)]
    struct Counter {
        value: u64,
    }

    impl Snapshot for Counter {
        fn snapshot(&self) -> Result<Vec<u8>, MlError> {
            Ok(self.value.to_le_bytes().to_vec())
        }

        fn restore(&mut self, bytes: &[u8]) -> Result<(), MlError> {
            let raw: [u8; 8] = bytes
                .try_into()
                .map_err(|_| MlError::model(format!("expected 8 bytes, got {}", bytes.len())))?;
            self.value = u64::from_le_bytes(raw);
            Ok(())
        }
    }

    fn identity(database: &str) -> RunIdentity {
        RunIdentity {
            database: database.into(),
            fold: 3,
            split_idx: 1,
            label_mode: LabelMode::AllAvailable,
        }
    }

    #[test]
    fn test_missing_file_is_cold_start() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), identity("BP4D"));
        let mut unit = Counter { value: 7 };
        assert!(store.try_resume_model(&mut unit).unwrap().is_none());
        assert_eq!(unit.value, 7);
    }

    #[test]
    fn test_save_then_resume_restores_state_and_clock() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), identity("BP4D"));
        let clock = IterationClock { epoch: 2, iteration: 40 };
        store.save_model(&Counter { value: 99 }, clock).unwrap();

        let mut fresh = Counter::default();
        let resumed = store.try_resume_model(&mut fresh).unwrap().unwrap();
        assert_eq!(fresh.value, 99);
        assert_eq!(resumed.clock, clock);
        assert_eq!(fresh.snapshot().unwrap(), Counter { value: 99 }.snapshot().unwrap());
    }

    #[test]
    fn test_model_and_optimizer_are_independent() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), identity("BP4D"));
        store.save_optimizer(&Counter { value: 5 }, IterationClock::new()).unwrap();

        let mut model = Counter { value: 1 };
        let mut optimizer = Counter::default();
        assert!(store.try_resume_model(&mut model).unwrap().is_none());
        assert!(store.try_resume_optimizer(&mut optimizer).unwrap().is_some());
        assert_eq!(model.value, 1);
        assert_eq!(optimizer.value, 5);
    }

    #[test]
    fn test_garbage_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), identity("BP4D"));
        std::fs::write(store.path(ArtifactKind::Model), b"\x00\x01 not a checkpoint").unwrap();

        let mut unit = Counter { value: 3 };
        let err = store.try_resume_model(&mut unit).unwrap_err();
        assert!(matches!(
            err,
            MlError::MalformedCheckpoint {
                kind: ArtifactKind::Model,
                ..
            }
        ));
        assert_eq!(unit.value, 3);
    }

    #[test]
    fn test_truncated_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), identity("BP4D"));
        store.save_model(&Counter { value: 11 }, IterationClock::new()).unwrap();
        let path = store.path(ArtifactKind::Model);
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        assert!(store.try_resume_model(&mut Counter::default()).is_err());
    }

    #[test]
    fn test_tampered_payload_fails_checksum() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), identity("BP4D"));
        store.save_model(&Counter { value: 11 }, IterationClock::new()).unwrap();
        let path = store.path(ArtifactKind::Model);

        let mut envelope: CheckpointEnvelope =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        envelope.payload = BASE64.encode(12u64.to_le_bytes());
        std::fs::write(&path, serde_json::to_vec(&envelope).unwrap()).unwrap();

        let err = store.try_resume_model(&mut Counter::default()).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_rejects_wrong_kind_and_identity() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), identity("BP4D"));
        let optimizer_path = store.path(ArtifactKind::Optimizer);
        save(
            &Counter { value: 1 },
            &optimizer_path,
            ArtifactKind::Model,
            store.identity(),
            IterationClock::new(),
        )
        .unwrap();
        assert!(store.try_resume_optimizer(&mut Counter::default()).is_err());

        let other = identity("DISFA");
        let model_path = store.path(ArtifactKind::Model);
        save(&Counter { value: 1 }, &model_path, ArtifactKind::Model, &other, IterationClock::new())
            .unwrap();
        let err = store.try_resume_model(&mut Counter::default()).unwrap_err();
        assert!(err.to_string().contains("DISFA"));
    }

    #[test]
    fn test_rejected_payload_is_malformed() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), identity("BP4D"));
        struct Wide(Vec<u8>);
        impl Snapshot for Wide {
            fn snapshot(&self) -> Result<Vec<u8>, MlError> {
                Ok(self.0.clone())
            }
            fn restore(&mut self, _bytes: &[u8]) -> Result<(), MlError> {
                unreachable!()
            }
        }
        store.save_model(&Wide(vec![0; 3]), IterationClock::new()).unwrap();
        let err = store.try_resume_model(&mut Counter::default()).unwrap_err();
        assert!(err.to_string().contains("expected 8 bytes"));
    }

    #[test]
    fn test_overwrite_keeps_only_latest() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), identity("BP4D"));
        for value in 1..=3 {
            store
                .save_model(&Counter { value }, IterationClock { epoch: 0, iteration: value })
                .unwrap();
        }
        let mut fresh = Counter::default();
        let resumed = store.try_resume_model(&mut fresh).unwrap().unwrap();
        assert_eq!(fresh.value, 3);
        assert_eq!(resumed.clock.iteration, 3);
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }
}
