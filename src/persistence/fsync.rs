//! Low-level fsync operations for durability.
//!
//! These functions ensure data is persisted to disk before returning.
//! Both file and directory fsyncs are required for crash safety.
//!
//! # Why Directory fsync?
//!
//! On POSIX systems, creating or renaming a file updates the directory entry.
//! Without fsync on the directory, this entry may not survive a power loss
//! even if the file contents were synced.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// Syncs a file's contents and metadata to disk.
///
/// Equivalent to `fsync(2)` on the file descriptor. After this returns, the
/// file's contents are guaranteed to be on disk.
pub fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Syncs a directory to disk, ensuring directory entries are durable.
///
/// Without this, a renamed state file might revert to its old name after a
/// power loss even though the rename appeared to succeed.
pub fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    let dir = OpenOptions::new().read(true).open(dir_path)?;
    dir.sync_all()
}
