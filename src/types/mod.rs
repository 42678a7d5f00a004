//! Core domain types for the channel relay.
//!
//! This module contains the fundamental types used throughout the pipeline,
//! designed to encode invariants via the type system.

pub mod ids;
pub mod media;

// Re-export commonly used types at the module level
pub use ids::{ChannelId, GroupId, MessageId, Origin};
pub use media::{Batch, ContentRef, MediaItem, MediaKind, OutgoingPost};
