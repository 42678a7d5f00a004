//! The per-channel offset store: the crash-recovery anchor.
//!
//! For every source channel the store holds the highest message id already
//! handed to the work queue. It is written synchronously on every advance,
//! before the poll cycle completes, so a restart resumes exactly where
//! detection left off. Offsets never move backward; forwarding failures are
//! retried through the queue and are never a reason to rewind the source.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::types::{ChannelId, MessageId};

use super::state_file::{StateFileError, load_state, save_state_atomic};

/// Persisted map of channel id to highest handed-off message id.
///
/// Shared across tasks behind a mutex; every mutation persists synchronously
/// before returning. Only the poller and the reconciler write to it.
#[derive(Debug)]
pub struct OffsetStore {
    path: PathBuf,
    offsets: HashMap<ChannelId, MessageId>,
}

impl OffsetStore {
    /// Loads the store from `path`.
    ///
    /// A missing file starts empty. An unreadable or corrupt file also starts
    /// empty, with a logged reset: the relay favors availability over
    /// history, and affected channels re-initialize at their current head.
    pub fn load(path: PathBuf) -> Self {
        let offsets = match load_state::<HashMap<ChannelId, MessageId>>(&path) {
            Ok(Some(offsets)) => {
                info!(channels = offsets.len(), path = %path.display(), "loaded offset store");
                offsets
            }
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(error = %e, path = %path.display(), "offset store unreadable, resetting to empty");
                HashMap::new()
            }
        };
        OffsetStore { path, offsets }
    }

    /// An empty store that persists to `path`. Used by tests.
    pub fn empty(path: PathBuf) -> Self {
        OffsetStore {
            path,
            offsets: HashMap::new(),
        }
    }

    /// The stored offset for a channel; `MessageId::ZERO` if unknown.
    pub fn get(&self, channel: ChannelId) -> MessageId {
        self.offsets.get(&channel).copied().unwrap_or(MessageId::ZERO)
    }

    /// Returns true if the channel is tracked at all.
    pub fn contains(&self, channel: ChannelId) -> bool {
        self.offsets.contains_key(&channel)
    }

    /// The set of tracked channels.
    pub fn channels(&self) -> Vec<ChannelId> {
        self.offsets.keys().copied().collect()
    }

    /// Advances a channel's offset to `id` and persists synchronously.
    ///
    /// Offsets are monotonic: an `id` at or below the stored offset is a
    /// no-op (no write either). Returns whether the offset moved.
    pub fn advance(&mut self, channel: ChannelId, id: MessageId) -> Result<bool, StateFileError> {
        let current = self.get(channel);
        if id <= current && self.contains(channel) {
            return Ok(false);
        }
        if id <= current {
            // Track the channel even when initializing at zero.
            self.offsets.insert(channel, current);
        } else {
            self.offsets.insert(channel, id);
        }
        self.persist()?;
        Ok(id > current)
    }

    /// Starts tracking a newly configured channel at `head`.
    ///
    /// New channels watch only future messages; no backlog is replayed. An
    /// already-tracked channel keeps its offset (reconciliation copies the
    /// last known offset forward for unchanged channels).
    pub fn init_at_head(
        &mut self,
        channel: ChannelId,
        head: MessageId,
    ) -> Result<(), StateFileError> {
        if self.contains(channel) {
            return Ok(());
        }
        self.offsets.insert(channel, head);
        self.persist()
    }

    /// Stops tracking a channel removed from configuration.
    pub fn remove(&mut self, channel: ChannelId) -> Result<(), StateFileError> {
        if self.offsets.remove(&channel).is_some() {
            self.persist()?;
        }
        Ok(())
    }

    fn persist(&self) -> Result<(), StateFileError> {
        save_state_atomic(&self.path, &self.offsets)
    }
}
