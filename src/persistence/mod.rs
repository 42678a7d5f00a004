//! Crash-safe persisted state for the relay.
//!
//! Two keyed maps survive restarts: the per-channel offset map (the
//! crash-recovery anchor) and the hash index (kept in `dedup`, but persisted
//! through the same state-file discipline). Both are loaded fully into memory
//! at startup and written incrementally afterwards.
//!
//! # Crash Safety
//!
//! Every write is atomic per file: serialize to `<name>.tmp`, fsync the temp
//! file, rename over the target, fsync the directory. A crash at any point
//! leaves either the old state or the new state on disk, never a torn write.
//!
//! # Corruption Policy
//!
//! A state file that fails to parse is treated as lost: the store resets to
//! empty and logs the reset. The relay favors availability over perfect
//! history; for offsets this means a wiped channel re-initializes at its
//! current head rather than reprocessing backlog.

pub mod fsync;
pub mod offsets;
pub mod state_file;

pub use fsync::{fsync_dir, fsync_file};
pub use offsets::OffsetStore;
pub use state_file::{StateFileError, load_state, save_state_atomic};
