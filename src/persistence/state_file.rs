//! Single-writer JSON state files.
//!
//! Writers go through a sibling temp file and `rename`, so readers in other processes
//! see either the previous document or the new one. Readers treat any failure as
//! "absent" and leave re-evaluation to the next cycle.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Serialize `value` as pretty JSON and atomically replace `path`
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "state".to_string());
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()));

    let mut contents = serde_json::to_vec_pretty(value)?;
    contents.push(b'\n');
    fs::write(&tmp, &contents)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Read and deserialize `path`; missing, unreadable or malformed files yield `None`
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "state file unavailable");
            return None;
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "state file unparseable");
            None
        }
    }
}

/// Untyped variant of [`read_json`]
pub fn read_json_value(path: &Path) -> Option<serde_json::Value> {
    read_json(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_write_then_read_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/state.json");

        write_json_atomic(&path, &json!({"status": "ok"})).unwrap();
        let value = read_json_value(&path).unwrap();
        assert_eq!(value["status"], "ok");

        // no temp files left behind
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_overwrite_replaces_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_json_atomic(&path, &json!({"n": 1})).unwrap();
        write_json_atomic(&path, &json!({"n": 2})).unwrap();
        assert_eq!(read_json_value(&path).unwrap()["n"], 2);
    }

    #[test]
    fn test_missing_and_corrupt_read_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(read_json_value(&missing).is_none());

        let corrupt = dir.path().join("corrupt.json");
        fs::write(&corrupt, "{not json").unwrap();
        assert!(read_json_value(&corrupt).is_none());
    }
}
