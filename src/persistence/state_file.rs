//! Atomic JSON state files.
//!
//! All persisted relay state (offset map, hash index) goes through these two
//! functions, so the write-to-temp-then-rename pattern lives in one place:
//!
//! 1. Serialize to `<path>.tmp`
//! 2. fsync the temp file
//! 3. Rename over `<path>`
//! 4. fsync the parent directory

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::fsync::{fsync_dir, fsync_file};

/// Errors from reading or writing a state file.
#[derive(Debug, Error)]
pub enum StateFileError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Writes `value` to `path` atomically.
///
/// The parent directory is created if missing. A crash at any point leaves
/// either the previous file or the complete new file, never a partial write.
pub fn save_state_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StateFileError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let bytes = serde_json::to_vec_pretty(value)?;

    let tmp_path = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&bytes)?;
        fsync_file(&file)?;
    }

    std::fs::rename(&tmp_path, path)?;
    fsync_dir(parent)?;

    Ok(())
}

/// Loads a state file, distinguishing "absent" from "unreadable".
///
/// Returns `Ok(None)` when the file does not exist (a fresh deployment).
/// Parse failures are errors; the caller decides whether to reset to empty.
pub fn load_state<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StateFileError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}
