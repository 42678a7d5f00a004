//! Content fingerprinting and the bounded duplicate index.
//!
//! Every piece of media that survives filtering is fingerprinted: an exact
//! SHA-256 over its bytes, plus a 64-bit perceptual hash for images so
//! re-encoded copies are still caught. The index maps fingerprints to records
//! and answers "have we seen this before?" — exactly for any media, fuzzily
//! (Hamming distance) for images.
//!
//! # Policy
//!
//! Keep-original-drop-new: a match against stored content rejects the
//! incoming item; stored records are never deleted on a match. The index is
//! bounded; past capacity the globally oldest record by insertion timestamp
//! is evicted.

pub mod fingerprint;
pub mod index;

pub use fingerprint::{
    Fingerprint, FingerprintError, PERCEPTUAL_DUP_THRESHOLD, fingerprint_image, fingerprint_video,
    hamming_distance,
};
pub use index::{DuplicateKind, FingerprintRecord, HashIndex, Verdict};
