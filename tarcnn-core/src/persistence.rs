//! Shared persistence utilities: atomic file writes, JSON load/save.
//!
//! Every artifact a run leaves in its output directory goes through
//! [`atomic_write`], so a crash mid-write leaves either the previous file or
//! the new one, never a truncated mix.

use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Atomically write JSON data to a file.
///
/// Serializes `data` to pretty-printed JSON and hands it to [`atomic_write`].
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Atomically write raw bytes to a file.
///
/// Writes to a `.tmp` sibling, flushes it to disk, then renames it over the
/// target path. Creates parent directories if they don't exist.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = tmp_sibling(path);
    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

/// Temporary sibling used by [`atomic_write`]: the full file name plus `.tmp`.
///
/// Appending keeps `a_model.ckpt` and `a_optimizer.ckpt` from sharing a
/// temporary file, which `Path::with_extension` would not.
pub fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name: OsString = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Read a file's bytes.
///
/// Returns `Ok(None)` if the file doesn't exist.
pub fn load_bytes(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Load and deserialize JSON from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
/// Returns `Err` on I/O errors or deserialization failures.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    let Some(data) = load_bytes(path)? else {
        return Ok(None);
    };
    let value =
        serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestData {
        name: String,
        count: u32,
    }

    #[test]
    fn test_atomic_write_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.json");

        let data = TestData {
            name: "hello".into(),
            count: 42,
        };

        atomic_write_json(&path, &data).unwrap();
        let loaded: Option<TestData> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(data));
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("dir").join("test.json");

        atomic_write_json(&path, &"nested").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_load_json_nonexistent() {
        let result: io::Result<Option<TestData>> = load_json(Path::new("/nonexistent/file.json"));
        assert!(result.unwrap().is_none());
    }

    #[test]
    fn test_load_json_invalid_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"{not json").unwrap();

        let err = load_json::<TestData>(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_atomic_write_overwrites_in_place() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("raw.bin");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(load_bytes(&path).unwrap().unwrap(), b"second");
    }

    #[test]
    fn test_atomic_write_no_tmp_leftover() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clean_model.ckpt");

        atomic_write(&path, b"payload").unwrap();
        assert!(!tmp_sibling(&path).exists());
    }

    #[test]
    fn test_tmp_sibling_keeps_full_name() {
        let a = tmp_sibling(Path::new("/out/run_model.ckpt"));
        let b = tmp_sibling(Path::new("/out/run_optimizer.ckpt"));
        assert_eq!(a, PathBuf::from("/out/run_model.ckpt.tmp"));
        assert_ne!(a, b);
    }
}
