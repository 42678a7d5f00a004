//! The bounded fingerprint index.
//!
//! Maps exact hashes to records of previously forwarded content. Lookups are
//! exact first (hash map key), then perceptual (linear scan over stored
//! 64-bit hashes, cheap at the default capacity of 500). Admission is
//! check-then-insert per item, so the second copy of an image inside one
//! grouped post is caught by the first copy's freshly inserted record.
//!
//! The index persists as a JSON state file. Mutations are in-memory; the
//! caller persists once per admitted batch, which bounds the window in which
//! a crash can forget recent fingerprints to a single post.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::persistence::{StateFileError, load_state, save_state_atomic};
use crate::types::Origin;

use super::fingerprint::{Fingerprint, PERCEPTUAL_DUP_THRESHOLD, hamming_distance};

/// Default maximum number of stored fingerprint records.
pub const DEFAULT_CAPACITY: usize = 500;

/// How an incoming item matched stored content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateKind {
    /// Byte-identical content (same exact hash).
    Exact,
    /// Perceptually equivalent image within the Hamming threshold.
    Perceptual { distance: u32 },
}

/// The index's answer for one incoming item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Never seen; the item was admitted and recorded.
    Fresh,
    /// Matches stored content; the stored record stays, the item is dropped.
    Duplicate(DuplicateKind),
}

impl Verdict {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Verdict::Fresh)
    }
}

/// A stored fingerprint with enough context to explain a rejection in logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub fingerprint: Fingerprint,
    /// Caption of the post the content arrived in, for log context.
    pub caption: Option<String>,
    /// Where the content was first seen.
    pub origin: Origin,
    pub inserted_at: DateTime<Utc>,
    /// Insertion sequence number; breaks timestamp ties during eviction.
    pub seq: u64,
}

/// Bounded map from exact hash to fingerprint record.
#[derive(Debug)]
pub struct HashIndex {
    path: PathBuf,
    capacity: usize,
    records: HashMap<String, FingerprintRecord>,
    next_seq: u64,
}

impl HashIndex {
    /// Loads the index from `path`.
    ///
    /// Missing and corrupt files both start empty; corruption is logged and
    /// the relay carries on, accepting that some recent content may be
    /// forwarded twice.
    pub fn load(path: PathBuf, capacity: usize) -> Self {
        let records = match load_state::<HashMap<String, FingerprintRecord>>(&path) {
            Ok(Some(records)) => {
                info!(records = records.len(), path = %path.display(), "loaded fingerprint index");
                records
            }
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(error = %e, path = %path.display(), "fingerprint index unreadable, resetting to empty");
                HashMap::new()
            }
        };
        let next_seq = records.values().map(|r| r.seq + 1).max().unwrap_or(0);
        let mut index = HashIndex {
            path,
            capacity,
            records,
            next_seq,
        };
        // A capacity lowered between runs takes effect on load.
        index.evict_to_capacity();
        index
    }

    /// An empty in-memory index persisting to `path`. Used by tests.
    pub fn empty(path: PathBuf, capacity: usize) -> Self {
        HashIndex {
            path,
            capacity,
            records: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Checks `fingerprint` against stored records without admitting it.
    pub fn check(&self, fingerprint: &Fingerprint) -> Verdict {
        if self.records.contains_key(&fingerprint.exact) {
            return Verdict::Duplicate(DuplicateKind::Exact);
        }
        if let Some(incoming) = fingerprint.perceptual {
            for record in self.records.values() {
                if let Some(stored) = record.fingerprint.perceptual {
                    let distance = hamming_distance(incoming, stored);
                    if distance < PERCEPTUAL_DUP_THRESHOLD {
                        return Verdict::Duplicate(DuplicateKind::Perceptual { distance });
                    }
                }
            }
        }
        Verdict::Fresh
    }

    /// Checks and, if fresh, records `fingerprint`, evicting the oldest
    /// record when over capacity. In-memory only; call [`persist`] after the
    /// batch.
    ///
    /// [`persist`]: HashIndex::persist
    pub fn admit(
        &mut self,
        fingerprint: &Fingerprint,
        caption: Option<&str>,
        origin: Origin,
    ) -> Verdict {
        let verdict = self.check(fingerprint);
        if let Verdict::Duplicate(kind) = verdict {
            debug!(?kind, exact = %fingerprint.exact, %origin, "duplicate content");
            return verdict;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.records.insert(
            fingerprint.exact.clone(),
            FingerprintRecord {
                fingerprint: fingerprint.clone(),
                caption: caption.map(str::to_owned),
                origin,
                inserted_at: Utc::now(),
                seq,
            },
        );
        self.evict_to_capacity();
        Verdict::Fresh
    }

    /// Writes the index to disk atomically.
    pub fn persist(&self) -> Result<(), StateFileError> {
        save_state_atomic(&self.path, &self.records)
    }

    fn evict_to_capacity(&mut self) {
        while self.records.len() > self.capacity {
            let oldest = self
                .records
                .values()
                .min_by_key(|r| (r.inserted_at, r.seq))
                .map(|r| r.fingerprint.exact.clone());
            match oldest {
                Some(key) => {
                    debug!(exact = %key, "evicting oldest fingerprint record");
                    self.records.remove(&key);
                }
                None => break,
            }
        }
    }
}
