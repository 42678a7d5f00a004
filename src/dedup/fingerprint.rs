//! Fingerprint computation for media payloads.
//!
//! - Images: SHA-256 over the full payload plus a 64-bit DCT perceptual hash
//!   (8x8 mean hash over the DCT, the classic pHash construction). The
//!   perceptual hash survives re-encoding and minor recompression; two images
//!   whose hashes differ by fewer than [`PERCEPTUAL_DUP_THRESHOLD`] bits are
//!   treated as the same picture.
//! - Videos: SHA-256 over a bounded deterministic prefix sample of the file,
//!   never the whole thing. The sample budget bounds download latency and
//!   memory; identical uploads hash identically because the prefix is
//!   deterministic.
//! - Text: no fingerprint. Text posts are filtered by banned words only.

use sha2::{Digest, Sha256};
use thiserror::Error;

use serde::{Deserialize, Serialize};

/// Hamming-distance threshold below which two 64-bit perceptual hashes are
/// considered the same image.
pub const PERCEPTUAL_DUP_THRESHOLD: u32 = 5;

/// Errors from fingerprint computation.
#[derive(Debug, Error)]
pub enum FingerprintError {
    /// The payload could not be decoded as an image.
    #[error("image decode failed: {0}")]
    ImageDecode(#[from] image::ImageError),
}

/// A content fingerprint: exact hash, plus a perceptual hash for images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Hex-encoded SHA-256 of the (possibly sampled) payload.
    pub exact: String,

    /// 64-bit perceptual hash; present only for images.
    pub perceptual: Option<u64>,
}

/// Counts differing bits between two 64-bit perceptual hashes.
pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Fingerprints an image payload.
///
/// Returns an error if the bytes do not decode as an image; the caller
/// treats that as a transient item failure, not a crash.
pub fn fingerprint_image(bytes: &[u8]) -> Result<Fingerprint, FingerprintError> {
    let exact = sha256_hex(bytes);

    let img = image::load_from_memory(bytes)?;
    let hasher = image_hasher::HasherConfig::new()
        .hash_alg(image_hasher::HashAlg::Mean)
        .hash_size(8, 8)
        .preproc_dct()
        .to_hasher();
    let hash = hasher.hash_image(&img);

    let mut raw = [0u8; 8];
    for (dst, src) in raw.iter_mut().zip(hash.as_bytes()) {
        *dst = *src;
    }
    let perceptual = u64::from_be_bytes(raw);

    Ok(Fingerprint {
        exact,
        perceptual: Some(perceptual),
    })
}

/// Fingerprints a video from its bounded prefix sample.
///
/// The caller is responsible for downloading at most the sample budget; this
/// function hashes whatever deterministic prefix it is given.
pub fn fingerprint_video(sample: &[u8]) -> Fingerprint {
    Fingerprint {
        exact: sha256_hex(sample),
        perceptual: None,
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
