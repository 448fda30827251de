//! Durable state documents.
//!
//! Every state file is a standalone JSON document written through a sibling
//! temp file and `rename`, so a crash mid-write leaves either the previous or
//! the new content on disk, never a truncated file. Versioned documents reject
//! schema versions newer than the running binary understands.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Error during persistence operations.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialize failed: {reason}")]
    SerializeFailed { reason: String },

    #[error("deserialize failed for {path}: {reason}")]
    DeserializeFailed { path: PathBuf, reason: String },

    /// Document was written by a newer schema.
    #[error("version mismatch in {path}: expected <= {expected}, found {found}")]
    VersionMismatch {
        path: PathBuf,
        expected: u32,
        found: u32,
    },
}

impl PersistenceError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A document that carries a schema version stamp.
pub trait Versioned {
    /// Current schema version.
    const CURRENT_VERSION: u32;

    fn version(&self) -> u32;
}

fn ensure_parent(path: &Path) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| PersistenceError::io(parent, e))?;
        }
    }
    Ok(())
}

/// Write `contents` to `path` via `<path>.tmp` + rename.
pub fn write_atomic(path: &Path, contents: &str) -> Result<(), PersistenceError> {
    ensure_parent(path)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents).map_err(|e| PersistenceError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| PersistenceError::io(path, e))
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let json = serde_json::to_string_pretty(value).map_err(|e| PersistenceError::SerializeFailed {
        reason: e.to_string(),
    })?;
    write_atomic(path, &json)
}

/// Read a JSON document. A missing file is `Ok(None)`.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistenceError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PersistenceError::io(path, e)),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| PersistenceError::DeserializeFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Like [`load_json`], rejecting documents from a newer schema.
pub fn load_versioned<T: DeserializeOwned + Versioned>(
    path: &Path,
) -> Result<Option<T>, PersistenceError> {
    let Some(doc) = load_json::<T>(path)? else {
        return Ok(None);
    };
    if doc.version() > T::CURRENT_VERSION {
        return Err(PersistenceError::VersionMismatch {
            path: path.to_path_buf(),
            expected: T::CURRENT_VERSION,
            found: doc.version(),
        });
    }
    Ok(Some(doc))
}

/// Append one compact JSON line to `path`.
pub fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let line = serde_json::to_string(value).map_err(|e| PersistenceError::SerializeFailed {
        reason: e.to_string(),
    })?;
    append_text(path, &format!("{line}\n"))
}

/// Append raw text to `path`, creating it if needed.
pub fn append_text(path: &Path, text: &str) -> Result<(), PersistenceError> {
    ensure_parent(path)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| PersistenceError::io(path, e))?;
    file.write_all(text.as_bytes())
        .map_err(|e| PersistenceError::io(path, e))
}

/// Read a text file; a missing file reads as empty.
pub fn read_text(path: &Path) -> Result<String, PersistenceError> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(raw),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(PersistenceError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        version: u32,
        value: f64,
    }

    impl Versioned for Doc {
        const CURRENT_VERSION: u32 = 2;

        fn version(&self) -> u32 {
            self.version
        }
    }

    #[test]
    fn test_save_then_load_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/doc.json");
        let doc = Doc {
            version: 2,
            value: 0.1 + 0.2,
        };
        save_json(&path, &doc).unwrap();
        let back: Doc = load_versioned(&path).unwrap().unwrap();
        assert_eq!(back.value.to_bits(), doc.value.to_bits());
        assert!(!path.with_file_name("doc.json.tmp").exists());
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Option<Doc> = load_json(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
        assert_eq!(read_text(&dir.path().join("absent.log")).unwrap(), "");
    }

    #[test]
    fn test_newer_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        save_json(&path, &Doc { version: 3, value: 1.0 }).unwrap();
        let err = load_versioned::<Doc>(&path).unwrap_err();
        assert!(matches!(
            err,
            PersistenceError::VersionMismatch {
                expected: 2,
                found: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_corrupt_file_is_deserialize_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(&path, "{truncated").unwrap();
        assert!(matches!(
            load_json::<Doc>(&path),
            Err(PersistenceError::DeserializeFailed { .. })
        ));
    }

    #[test]
    fn test_append_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/events.jsonl");
        append_jsonl(&path, &serde_json::json!({"a": 1})).unwrap();
        append_jsonl(&path, &serde_json::json!({"a": 2})).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }
}
