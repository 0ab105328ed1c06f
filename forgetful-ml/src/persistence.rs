//! Crash-safe writes for checkpoint manifests and exported artifacts.

use std::io::{self, Write};
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;

use crate::error::ForgetError;

/// Write `bytes` to `path` through a temp file in the same directory.
///
/// Readers see either the previous file or the complete new one.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ForgetError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| ForgetError::Io(e.error))?;
    Ok(())
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ForgetError> {
    write_atomic(path, &serde_json::to_vec_pretty(value)?)
}

/// `Ok(None)` when `path` does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ForgetError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_manifest_in_new_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoints").join("manifest.json");
        write_json(&path, &vec![3usize, 1, 2]).unwrap();

        let loaded: Option<Vec<usize>> = read_json(&path).unwrap();
        assert_eq!(loaded, Some(vec![3, 1, 2]));
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_overwrite_replaces_artifact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.fdlite");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn test_missing_is_none_and_garbage_is_error() {
        let dir = TempDir::new().unwrap();
        let absent: Option<Vec<usize>> = read_json(&dir.path().join("absent.json")).unwrap();
        assert!(absent.is_none());

        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(read_json::<Vec<usize>>(&path), Err(ForgetError::Serde(_))));
    }
}
