//! PID file for a running training process.

use anyhow::Context;
use std::path::{Path, PathBuf};
use tarcnn_core::RunIdentity;

/// Holds `<dir>/<db>_<fold>_fold_<split>.pid` for the lifetime of the run.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(dir: &Path, identity: &RunIdentity) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create PID directory {}", dir.display()))?;
        let path = dir.join(identity.pid_file_name());
        std::fs::write(&path, std::process::id().to_string())
            .with_context(|| format!("Failed to write PID file {}", path.display()))?;
        tracing::debug!(path = %path.display(), "Wrote PID file");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove PID file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarcnn_core::RunConfig;
    use tempfile::TempDir;

    #[test]
    fn test_writes_pid_and_removes_on_drop() {
        let tmp = TempDir::new().unwrap();
        let identity = RunIdentity::from_config(&RunConfig::default());
        let pid = PidFile::create(&tmp.path().join("pid"), &identity).unwrap();
        let path = pid.path().to_path_buf();
        assert_eq!(path.file_name().unwrap(), "BP4D_3_fold_1.pid");
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
        drop(pid);
        assert!(!path.exists());
    }
}
