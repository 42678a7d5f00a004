//! Debounce assembly of multi-item posts.
//!
//! The platform tags every item of a grouped post with a shared group id but
//! never signals "the group is complete". The assembler infers completion by
//! debounce: each arriving item (re)arms a timer for its group, and when the
//! timer expires with no new arrivals the collected items are emitted as one
//! batch. Singletons bypass the timer entirely.
//!
//! An item for a group that already flushed starts a new batch for the same
//! group id. The duplicate index catches the content overlap downstream.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::types::{Batch, ChannelId, GroupId, MediaItem};

/// Default quiet period before a group is considered complete.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);

struct PendingGroup {
    items: Vec<MediaItem>,
    timer: JoinHandle<()>,
}

type PendingMap = HashMap<(ChannelId, GroupId), PendingGroup>;

/// Collects grouped items and emits completed batches into a channel.
///
/// Clone-cheap; all clones share the pending map.
#[derive(Clone)]
pub struct GroupAssembler {
    debounce: Duration,
    sink: mpsc::UnboundedSender<Batch>,
    pending: Arc<Mutex<PendingMap>>,
}

impl GroupAssembler {
    pub fn new(debounce: Duration, sink: mpsc::UnboundedSender<Batch>) -> Self {
        GroupAssembler {
            debounce,
            sink,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Accepts one observed item.
    ///
    /// Ungrouped items are emitted immediately as singleton batches. Grouped
    /// items join (or open) their group's pending entry and re-arm its
    /// debounce timer.
    pub fn add(&self, item: MediaItem) {
        let Some(group) = item.group else {
            let _ = self.sink.send(Batch::singleton(item));
            return;
        };
        let key = (item.origin.channel, group);

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.entry(key) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.items.push(item);
                entry.timer.abort();
                entry.timer = self.spawn_timer(key);
            }
            Entry::Vacant(vacant) => {
                debug!(channel = %key.0, group = %key.1, "opening media group");
                vacant.insert(PendingGroup {
                    items: vec![item],
                    timer: self.spawn_timer(key),
                });
            }
        }
    }

    /// Number of groups currently waiting on their debounce timer.
    pub fn pending_groups(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Flushes every pending group immediately, timers not yet expired
    /// included. Called on shutdown so collected items reach the queue
    /// instead of being dropped.
    pub fn flush_all(&self) {
        let drained: Vec<PendingGroup> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            entry.timer.abort();
            let _ = self.sink.send(Batch::from_group(entry.items));
        }
    }

    fn spawn_timer(&self, key: (ChannelId, GroupId)) -> JoinHandle<()> {
        let debounce = self.debounce;
        let pending = Arc::clone(&self.pending);
        let sink = self.sink.clone();
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let entry = {
                let mut pending = pending.lock().unwrap_or_else(|e| e.into_inner());
                pending.remove(&key)
            };
            if let Some(entry) = entry {
                debug!(
                    channel = %key.0,
                    group = %key.1,
                    items = entry.items.len(),
                    "media group settled"
                );
                let _ = sink.send(Batch::from_group(entry.items));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentRef, MediaKind, MessageId, Origin};
    use tokio::time::advance;

    const CHANNEL: ChannelId = ChannelId(-100);

    fn grouped(id: u64, group: u64) -> MediaItem {
        MediaItem {
            kind: MediaKind::Image,
            content: ContentRef::new(format!("file-{id}")),
            caption: None,
            group: Some(GroupId(group)),
            origin: Origin::new(CHANNEL, MessageId(id)),
            size: None,
        }
    }

    fn single(id: u64) -> MediaItem {
        MediaItem {
            group: None,
            ..grouped(id, 0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn singleton_bypasses_debounce() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let assembler = GroupAssembler::new(DEFAULT_DEBOUNCE, tx);

        assembler.add(single(42));

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.max_message_id(), Some(MessageId(42)));
        assert_eq!(assembler.pending_groups(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn group_emits_after_quiet_period() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let assembler = GroupAssembler::new(Duration::from_secs(2), tx);

        assembler.add(grouped(101, 7));
        assembler.add(grouped(102, 7));
        assembler.add(grouped(103, 7));

        advance(Duration::from_millis(2100)).await;

        let batch = rx.recv().await.unwrap();
        let ids: Vec<u64> = batch.items().iter().map(|i| i.message_id().0).collect();
        assert_eq!(ids, vec![101, 102, 103]);
        assert_eq!(assembler.pending_groups(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn each_arrival_rearms_the_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let assembler = GroupAssembler::new(Duration::from_secs(2), tx);

        assembler.add(grouped(1, 7));
        advance(Duration::from_millis(1500)).await;
        assembler.add(grouped(2, 7));
        advance(Duration::from_millis(1500)).await;

        // 3s since the first item, but only 1.5s since the last: still open.
        assert!(rx.try_recv().is_err());
        assert_eq!(assembler.pending_groups(), 1);

        advance(Duration::from_millis(600)).await;
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn groups_debounce_independently() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let assembler = GroupAssembler::new(Duration::from_secs(2), tx);

        assembler.add(grouped(1, 7));
        advance(Duration::from_millis(1000)).await;
        assembler.add(grouped(10, 8));
        advance(Duration::from_millis(1100)).await;

        // Group 7 is quiet for 2.1s and flushes; group 8 only for 1.1s.
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.items()[0].group, Some(GroupId(7)));
        assert!(rx.try_recv().is_err());

        advance(Duration::from_millis(1000)).await;
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.items()[0].group, Some(GroupId(8)));
    }

    #[tokio::test(start_paused = true)]
    async fn same_group_id_on_other_channel_is_separate() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let assembler = GroupAssembler::new(Duration::from_secs(2), tx);

        let mut other = grouped(50, 7);
        other.origin = Origin::new(ChannelId(-200), MessageId(50));

        assembler.add(grouped(1, 7));
        assembler.add(other);
        assert_eq!(assembler.pending_groups(), 2);

        advance(Duration::from_millis(2100)).await;
        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        assert_eq!(a.len() + b.len(), 2);
        assert_ne!(a.channel(), b.channel());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_all_emits_unexpired_groups() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let assembler = GroupAssembler::new(Duration::from_secs(2), tx);

        assembler.add(grouped(1, 7));
        assembler.add(grouped(2, 7));
        assembler.flush_all();

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(assembler.pending_groups(), 0);

        // The aborted timer must not emit the group a second time.
        advance(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn late_item_after_flush_opens_new_group() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let assembler = GroupAssembler::new(Duration::from_secs(2), tx);

        assembler.add(grouped(1, 7));
        advance(Duration::from_millis(2100)).await;
        assert_eq!(rx.recv().await.unwrap().len(), 1);

        assembler.add(grouped(2, 7));
        advance(Duration::from_millis(2100)).await;
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.max_message_id(), Some(MessageId(2)));
    }
}
