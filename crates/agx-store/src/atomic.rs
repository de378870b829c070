use crate::clock::hex_suffix;
use crate::errors::{StoreError, StoreResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Recursively materialize a directory. Idempotent.
pub fn ensure_dir(path: &Path) -> StoreResult<()> {
    fs::create_dir_all(path)
        .map_err(|err| StoreError::Io(format!("create dir '{}' failed: {err}", path.display())))
}

/// Write bytes via temp-file-then-rename in the target's directory.
///
/// The rename is the commit point; a crash leaves either the old content or
/// the new content, never a torn file.
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::Io(format!("path '{}' has no parent", path.display())))?;
    ensure_dir(parent)?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| StoreError::Io(format!("path '{}' has no file name", path.display())))?;
    let tmp_path = parent.join(format!(".{file_name}.{}.tmp", hex_suffix(8)));

    let result = (|| -> StoreResult<()> {
        let mut tmp = File::create(&tmp_path).map_err(|err| {
            StoreError::Io(format!("create temp '{}' failed: {err}", tmp_path.display()))
        })?;
        tmp.write_all(bytes).map_err(|err| {
            StoreError::Io(format!("write temp '{}' failed: {err}", tmp_path.display()))
        })?;
        tmp.sync_all().map_err(|err| {
            StoreError::Io(format!("fsync temp '{}' failed: {err}", tmp_path.display()))
        })?;
        fs::rename(&tmp_path, path).map_err(|err| {
            StoreError::Io(format!(
                "rename '{}' over '{}' failed: {err}",
                tmp_path.display(),
                path.display()
            ))
        })
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

pub fn write_text_atomic(path: &Path, text: &str) -> StoreResult<()> {
    write_bytes_atomic(path, text.as_bytes())
}

/// Serialize with stable two-space indentation and a trailing newline.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let mut bytes = serde_json::to_vec_pretty(value)
        .map_err(|err| StoreError::Serialization(err.to_string()))?;
    bytes.push(b'\n');
    write_bytes_atomic(path, &bytes)
}

/// Read and parse a JSON file; `Ok(None)` when the file is absent.
///
/// Parse errors surface rather than being swallowed as absence.
pub fn read_json_safe<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(StoreError::Io(format!(
                "read '{}' failed: {err}",
                path.display()
            )));
        }
    };
    serde_json::from_slice(&raw).map(Some).map_err(|err| {
        StoreError::Serialization(format!("parse '{}' failed: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tempfile::TempDir;

    #[test]
    fn write_then_read_json_expected_roundtrip() {
        let temp = TempDir::new().expect("temp dir should be created");
        let path = temp.path().join("nested").join("value.json");
        let value = json!({"alpha": 1, "beta": ["x", "y"]});

        write_json_atomic(&path, &value).expect("write should succeed");
        let loaded: Value = read_json_safe(&path)
            .expect("read should succeed")
            .expect("file should exist");
        assert_eq!(loaded, value);
    }

    #[test]
    fn repeated_writes_expected_no_tmp_detritus() {
        let temp = TempDir::new().expect("temp dir should be created");
        let path = temp.path().join("value.json");
        for round in 0..5 {
            write_json_atomic(&path, &json!({"round": round})).expect("write should succeed");
        }

        let leftovers: Vec<_> = std::fs::read_dir(temp.path())
            .expect("dir should list")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn read_json_safe_absent_expected_none() {
        let temp = TempDir::new().expect("temp dir should be created");
        let loaded: Option<Value> =
            read_json_safe(&temp.path().join("missing.json")).expect("read should succeed");
        assert!(loaded.is_none());
    }

    #[test]
    fn read_json_safe_corrupt_expected_error() {
        let temp = TempDir::new().expect("temp dir should be created");
        let path = temp.path().join("broken.json");
        std::fs::write(&path, b"{ not json").expect("raw write should succeed");

        let result: StoreResult<Option<Value>> = read_json_safe(&path);
        assert!(matches!(result, Err(StoreError::Serialization(_))));
    }

    #[test]
    fn json_writes_expected_trailing_newline() {
        let temp = TempDir::new().expect("temp dir should be created");
        let path = temp.path().join("value.json");
        write_json_atomic(&path, &json!({"k": "v"})).expect("write should succeed");

        let raw = std::fs::read(&path).expect("read should succeed");
        assert_eq!(raw.last(), Some(&b'\n'));
    }
}
