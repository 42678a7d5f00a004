//! The media model: items as observed on a source channel, and batches as the
//! unit of work flowing through the pipeline.
//!
//! A `MediaItem` is immutable after creation. A `Batch` is owned by exactly
//! one pipeline stage at a time (assembler, queue, processor, forwarder);
//! handing it to the next stage is a move.

use serde::{Deserialize, Serialize};

use super::ids::{GroupId, MessageId, Origin};

/// The kind of content carried by a media item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Text,
}

impl MediaKind {
    /// Text items carry no downloadable payload and are never fingerprinted.
    pub fn has_payload(&self) -> bool {
        !matches!(self, MediaKind::Text)
    }
}

/// An opaque reference to platform-hosted content.
///
/// The transport resolves this to bytes on download and accepts it back on
/// send, so the relay never re-uploads media it forwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentRef(pub String);

impl ContentRef {
    pub fn new(s: impl Into<String>) -> Self {
        ContentRef(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A single piece of content observed on a source channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub kind: MediaKind,

    /// Platform content reference. Meaningless for `Text` items.
    pub content: ContentRef,

    /// Caption attached to this item, if any. For grouped posts the platform
    /// usually attaches the caption to only one item of the group.
    pub caption: Option<String>,

    /// Group id if this item is part of a multi-item post.
    pub group: Option<GroupId>,

    /// Where this item came from.
    pub origin: Origin,

    /// Reported payload size in bytes, when the platform provides it.
    pub size: Option<u64>,
}

impl MediaItem {
    pub fn message_id(&self) -> MessageId {
        self.origin.message
    }
}

/// An ordered set of media items that forward together.
///
/// Either a singleton, or every item of one media group. Items are kept in
/// ascending message-id order; `Batch` construction enforces this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    items: Vec<MediaItem>,
}

impl Batch {
    /// Wraps a single item as a batch.
    pub fn singleton(item: MediaItem) -> Self {
        Batch { items: vec![item] }
    }

    /// Builds a batch from the items of one media group, sorting by
    /// message id.
    pub fn from_group(mut items: Vec<MediaItem>) -> Self {
        items.sort_by_key(MediaItem::message_id);
        Batch { items }
    }

    pub fn items(&self) -> &[MediaItem] {
        &self.items
    }

    pub fn into_items(self) -> Vec<MediaItem> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_grouped(&self) -> bool {
        self.items.len() > 1
    }

    /// The source channel of the batch. `None` for an empty batch; a batch
    /// never mixes channels.
    pub fn channel(&self) -> Option<super::ids::ChannelId> {
        self.items.first().map(|item| item.origin.channel)
    }

    /// The highest message id in the batch. `None` for an empty batch.
    pub fn max_message_id(&self) -> Option<MessageId> {
        self.items.iter().map(MediaItem::message_id).max()
    }

    /// The caption for the batch: the first non-empty caption in message-id
    /// order. Grouped posts carry their caption on one arbitrary member.
    pub fn caption(&self) -> Option<&str> {
        self.items
            .iter()
            .filter_map(|item| item.caption.as_deref())
            .find(|c| !c.is_empty())
    }
}

/// A batch that cleared processing and is ready to send.
///
/// Contains only surviving (non-duplicate, non-skipped) items plus the
/// transformed caption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingPost {
    pub items: Vec<MediaItem>,
    pub caption: Option<String>,
}

impl OutgoingPost {
    pub fn is_grouped(&self) -> bool {
        self.items.len() > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ids::ChannelId;
    use proptest::prelude::*;

    fn item(id: u64, caption: Option<&str>) -> MediaItem {
        MediaItem {
            kind: MediaKind::Image,
            content: ContentRef::new(format!("file-{id}")),
            caption: caption.map(str::to_string),
            group: Some(GroupId(7)),
            origin: Origin::new(ChannelId(-100), MessageId(id)),
            size: Some(1024),
        }
    }

    #[test]
    fn from_group_sorts_by_message_id() {
        let batch = Batch::from_group(vec![item(5, None), item(3, None), item(4, None)]);
        let ids: Vec<u64> = batch.items().iter().map(|i| i.message_id().0).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn caption_picks_first_non_empty() {
        let batch = Batch::from_group(vec![item(3, None), item(4, Some("")), item(5, Some("hi"))]);
        assert_eq!(batch.caption(), Some("hi"));
    }

    #[test]
    fn caption_none_when_all_empty() {
        let batch = Batch::from_group(vec![item(1, None), item(2, Some(""))]);
        assert_eq!(batch.caption(), None);
    }

    #[test]
    fn singleton_is_not_grouped() {
        let batch = Batch::singleton(item(9, Some("x")));
        assert!(!batch.is_grouped());
        assert_eq!(batch.max_message_id(), Some(MessageId(9)));
    }

    #[test]
    fn text_kind_has_no_payload() {
        assert!(!MediaKind::Text.has_payload());
        assert!(MediaKind::Image.has_payload());
        assert!(MediaKind::Video.has_payload());
    }

    proptest! {
        /// Batches built from any permutation of a group end up in ascending
        /// message-id order.
        #[test]
        fn prop_from_group_always_ascending(mut ids in proptest::collection::vec(0u64..10_000, 1..10)) {
            ids.dedup();
            let items: Vec<_> = ids.iter().map(|&i| item(i, None)).collect();
            let batch = Batch::from_group(items);
            for window in batch.items().windows(2) {
                prop_assert!(window[0].message_id() <= window[1].message_id());
            }
        }

        #[test]
        fn prop_max_message_id_is_max(ids in proptest::collection::vec(0u64..10_000, 1..10)) {
            let items: Vec<_> = ids.iter().map(|&i| item(i, None)).collect();
            let batch = Batch::from_group(items);
            prop_assert_eq!(batch.max_message_id(), ids.iter().copied().max().map(MessageId));
        }
    }
}
