//! Per-batch content processing: filtering, fingerprinting, deduplication,
//! caption transformation.
//!
//! Order matters and mirrors the cheapest-check-first rule:
//!
//! 1. Banned-word filter on the raw captions. A match rejects the whole batch
//!    before any download or fingerprint work, optionally routing it to the
//!    dump sink with the transformed caption.
//! 2. Oversize routing. Items reported above the threshold are never
//!    downloaded; they go to the dump sink flagged as skipped.
//! 3. Download, fingerprint, and admit each remaining item against the hash
//!    index. Admission is check-then-insert per item, so the second identical
//!    item inside one batch is already a duplicate of the first.
//! 4. Caption transform through the external collaborator, clamped to the
//!    configured length.
//!
//! Duplicates and rejections are normal terminal outcomes, not errors.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::config::ContentSettings;
use crate::dedup::{self, Fingerprint, HashIndex, Verdict};
use crate::transport::{DumpSink, TextTransform, Transport};
use crate::types::{Batch, MediaItem, MediaKind, OutgoingPost};

/// The processor's verdict on one batch.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// At least one item survived; ready for the forwarder.
    Forward(OutgoingPost),

    /// A banned word matched; the batch went to the dump sink (if any).
    Rejected { matched: String },

    /// Every item was dropped (duplicate or skipped); nothing to forward.
    Empty,
}

pub struct ContentProcessor {
    transport: Arc<dyn Transport>,
    transform: Arc<dyn TextTransform>,
    dump: Option<Arc<dyn DumpSink>>,
    index: Arc<Mutex<HashIndex>>,
    settings: ContentSettings,
    /// Lowercased at construction; matching is case-insensitive substring.
    banned_words: Vec<String>,
}

impl ContentProcessor {
    pub fn new(
        transport: Arc<dyn Transport>,
        transform: Arc<dyn TextTransform>,
        dump: Option<Arc<dyn DumpSink>>,
        index: Arc<Mutex<HashIndex>>,
        settings: ContentSettings,
        banned_words: &[String],
    ) -> Self {
        ContentProcessor {
            transport,
            transform,
            dump,
            index,
            settings,
            banned_words: banned_words.iter().map(|w| w.to_lowercase()).collect(),
        }
    }

    /// Runs the full processing pipeline on one batch.
    pub async fn process(&self, batch: Batch) -> ProcessOutcome {
        if let Some(matched) = self.banned_word_in(&batch) {
            info!(word = %matched, origin = ?batch.channel(), "batch rejected by banned word");
            self.route_to_dump(&batch).await;
            return ProcessOutcome::Rejected { matched };
        }

        let mut survivors: Vec<MediaItem> = Vec::new();
        let mut oversize: Vec<MediaItem> = Vec::new();

        for item in batch.items() {
            if self.is_oversize(item) {
                debug!(origin = %item.origin, size = ?item.size, "oversize item skipped");
                oversize.push(item.clone());
                continue;
            }
            if !item.kind.has_payload() {
                survivors.push(item.clone());
                continue;
            }

            match self.fingerprint(item).await {
                Some(fingerprint) => {
                    let verdict = {
                        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
                        index.admit(&fingerprint, batch.caption(), item.origin)
                    };
                    match verdict {
                        Verdict::Fresh => survivors.push(item.clone()),
                        Verdict::Duplicate(kind) => {
                            info!(origin = %item.origin, ?kind, "duplicate item dropped");
                        }
                    }
                }
                // Unverifiable content forwards rather than silently
                // vanishing; the miss is logged above.
                None => survivors.push(item.clone()),
            }
        }

        {
            let index = self.index.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = index.persist() {
                warn!(error = %e, "failed to persist hash index");
            }
        }

        if !oversize.is_empty() {
            self.route_to_dump(&Batch::from_group(oversize)).await;
        }

        if survivors.is_empty() {
            return ProcessOutcome::Empty;
        }

        let caption = match batch.caption() {
            Some(raw) => Some(self.transform_caption(raw).await),
            None => None,
        };
        ProcessOutcome::Forward(OutgoingPost {
            items: survivors,
            caption,
        })
    }

    fn banned_word_in(&self, batch: &Batch) -> Option<String> {
        for item in batch.items() {
            let Some(caption) = item.caption.as_deref() else {
                continue;
            };
            let lowered = caption.to_lowercase();
            for word in &self.banned_words {
                if lowered.contains(word.as_str()) {
                    return Some(word.clone());
                }
            }
        }
        None
    }

    fn is_oversize(&self, item: &MediaItem) -> bool {
        item.size
            .is_some_and(|size| size > self.settings.oversize_threshold_bytes)
    }

    /// Downloads and fingerprints one item. `None` means the content could
    /// not be verified (download or decode failure).
    async fn fingerprint(&self, item: &MediaItem) -> Option<Fingerprint> {
        let budget = match item.kind {
            MediaKind::Image => self.settings.oversize_threshold_bytes,
            MediaKind::Video => self.settings.video_sample_bytes,
            MediaKind::Text => return None,
        };
        let bytes = match self.transport.download(item, budget).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(origin = %item.origin, error = %e, "download failed, forwarding unverified");
                return None;
            }
        };
        match item.kind {
            MediaKind::Image => match dedup::fingerprint_image(&bytes) {
                Ok(fp) => Some(fp),
                Err(e) => {
                    warn!(origin = %item.origin, error = %e, "image decode failed, forwarding unverified");
                    None
                }
            },
            MediaKind::Video => Some(dedup::fingerprint_video(&bytes)),
            MediaKind::Text => None,
        }
    }

    async fn transform_caption(&self, raw: &str) -> String {
        clamp_caption(self.transform.process(raw).await, self.settings.max_caption_chars)
    }

    async fn route_to_dump(&self, batch: &Batch) {
        let Some(dump) = &self.dump else { return };
        let caption = match batch.caption() {
            Some(raw) => Some(self.transform_caption(raw).await),
            None => None,
        };
        dump.forward_to_dump(batch, caption.as_deref()).await;
    }
}

/// Appended to captions cut at the length limit, so readers can tell the
/// text is incomplete.
const TRUNCATION_MARKER: &str = "... [TRUNCATED]";

/// Truncates to `max` characters on a char boundary, marking the cut.
///
/// The marker counts toward the limit; an overlong caption is cut short
/// enough that text plus marker stay within `max`.
fn clamp_caption(caption: String, max: usize) -> String {
    if caption.chars().count() <= max {
        return caption;
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    let keep = max.saturating_sub(marker_len);
    let mut clamped: String = caption.chars().take(keep).collect();
    clamped.extend(TRUNCATION_MARKER.chars().take(max - keep));
    clamped
}
