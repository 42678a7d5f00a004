//! The platform transport seam and its error taxonomy.
//!
//! The messaging-platform client is an external collaborator; the pipeline
//! only speaks to it through the [`Transport`] trait. Error kinds distinguish
//! the cases the pipeline must treat differently:
//!
//! - **RateLimited** carries a mandatory wait supplied by the platform. It is
//!   retried after that wait and never counts against a channel's error
//!   budget.
//! - **PermissionDenied** / **InvalidTarget** accumulate toward the
//!   channel-disable threshold; the channel is skipped, not removed.
//! - **GroupedUnsupported** signals that the destination cannot take an
//!   atomic grouped send; the forwarder may degrade to per-item sends, but
//!   only explicitly and with a log line.
//! - **Transient** covers timeouts and generic fetch/send failures; retried
//!   with backoff, never surfaced to the user.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Batch, ChannelId, MediaItem, MessageId, OutgoingPost};

/// A transport-level failure, categorized for retry and error-budget
/// decisions.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The platform demands a wait before the next attempt. The wait is
    /// mandatory and overrides any computed backoff.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// The channel exists but we may not read from or write to it.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The channel does not exist or is otherwise unaddressable.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// The destination cannot accept an atomic grouped send.
    #[error("grouped delivery unsupported by destination")]
    GroupedUnsupported,

    /// Network timeout or generic failure; safe to retry with backoff.
    #[error("transient transport failure: {0}")]
    Transient(String),
}

impl TransportError {
    /// Returns true if this error is retriable with plain backoff.
    ///
    /// `RateLimited` is retriable too, but with its own mandated wait rather
    /// than the computed backoff, so it is handled separately.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }

    /// Returns true if this error counts toward a channel's
    /// consecutive-error budget.
    ///
    /// Rate limits carry their own wait and are budgeted separately.
    pub fn counts_against_budget(&self) -> bool {
        !matches!(self, TransportError::RateLimited { .. })
    }

    /// The mandatory wait, if the platform supplied one.
    pub fn mandated_wait(&self) -> Option<Duration> {
        match self {
            TransportError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// The messaging-platform client, reduced to the calls the pipeline needs.
///
/// Every method is expected to enforce its own bounded timeout and map a
/// timeout to [`TransportError::Transient`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetches messages with id strictly greater than `since`, oldest first,
    /// at most `limit` of them.
    async fn fetch_new(
        &self,
        channel: ChannelId,
        since: MessageId,
        limit: usize,
    ) -> Result<Vec<MediaItem>, TransportError>;

    /// The current highest message id on a channel, used to initialize newly
    /// added channels at their head (future messages only, no backlog).
    async fn head_id(&self, channel: ChannelId) -> Result<MessageId, TransportError>;

    /// Downloads an item's payload, reading at most `max_bytes`.
    ///
    /// Implementations must stop reading at the cap rather than buffering the
    /// whole file; the returned bytes are a deterministic prefix.
    async fn download(
        &self,
        item: &MediaItem,
        max_bytes: u64,
    ) -> Result<Vec<u8>, TransportError>;

    /// Sends a post to a destination as one call.
    ///
    /// Multi-item posts must be sent as one atomic grouped send: either the
    /// whole group goes out in this call or nothing does. A transport that
    /// cannot do this for the destination returns
    /// [`TransportError::GroupedUnsupported`] without having sent anything.
    async fn send(
        &self,
        destination: ChannelId,
        post: &OutgoingPost,
    ) -> Result<Vec<MessageId>, TransportError>;
}

/// The external caption pipeline (translation, summarization, markup
/// escaping). Opaque to the relay; retried at the caller's discretion.
#[async_trait]
pub trait TextTransform: Send + Sync {
    async fn process(&self, raw: &str) -> String;
}

/// A transform that passes captions through unchanged.
pub struct IdentityTransform;

#[async_trait]
impl TextTransform for IdentityTransform {
    async fn process(&self, raw: &str) -> String {
        raw.to_string()
    }
}

/// Receiver for rejected content: banned-word matches and oversized media.
///
/// Fire-and-forget from the pipeline's perspective; a failing dump sink is
/// logged and otherwise ignored.
#[async_trait]
pub trait DumpSink: Send + Sync {
    async fn forward_to_dump(&self, batch: &Batch, caption: Option<&str>);
}
