//! Channel polling and channel-list reconciliation.
//!
//! Each source channel is polled by exactly one tokio task, so polls for one
//! channel never overlap. A poll fetches everything newer than the persisted
//! offset (bounded by the page limit), feeds the items to the group
//! assembler, and advances the offset to the highest id fetched — on
//! detection, not on delivery. Forwarding failures are the queue's problem;
//! the offset never rewinds for them.
//!
//! Error budget: consecutive non-rate-limit failures disable the channel's
//! task at the configured threshold. Rate limits carry their own mandated
//! wait and never count. The reconciler periodically re-reads the config
//! file: removed channels are cancelled and untracked, new channels start at
//! their current head (no backlog replay), and disabled channels get a fresh
//! task with a reset error count.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assembler::GroupAssembler;
use crate::config::{PollSettings, RelayConfig};
use crate::persistence::OffsetStore;
use crate::transport::{Transport, TransportError};
use crate::types::ChannelId;

/// Outcome of one poll cycle, driving the channel loop's next step.
#[derive(Debug, PartialEq, Eq)]
enum PollStep {
    /// Poll completed (with or without new items); continue at normal pace.
    Completed,
    /// Rate limited; hold this channel for the mandated wait.
    Hold(Duration),
    /// Error budget exhausted; the channel task exits until reconciliation.
    Disabled,
}

#[derive(Debug, Default)]
struct ChannelState {
    consecutive_errors: u32,
}

/// Shared polling machinery; one instance serves every channel task.
pub struct Poller {
    transport: Arc<dyn Transport>,
    offsets: Arc<Mutex<OffsetStore>>,
    assembler: GroupAssembler,
    settings: PollSettings,
}

impl Poller {
    pub fn new(
        transport: Arc<dyn Transport>,
        offsets: Arc<Mutex<OffsetStore>>,
        assembler: GroupAssembler,
        settings: PollSettings,
    ) -> Self {
        Poller {
            transport,
            offsets,
            assembler,
            settings,
        }
    }

    /// The per-channel poll loop. Runs until cancelled or disabled.
    pub async fn run_channel(self: Arc<Self>, channel: ChannelId, cancel: CancellationToken) {
        let mut state = ChannelState::default();
        loop {
            let pause = match self.poll_once(channel, &mut state).await {
                PollStep::Completed => self.cycle_pause(),
                PollStep::Hold(wait) => wait,
                PollStep::Disabled => {
                    warn!(%channel, errors = state.consecutive_errors,
                        "channel disabled until next reconciliation");
                    return;
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Fetches new messages once and advances the offset.
    async fn poll_once(&self, channel: ChannelId, state: &mut ChannelState) -> PollStep {
        let since = {
            let offsets = self.lock_offsets();
            offsets.get(channel)
        };

        let items = match self
            .transport
            .fetch_new(channel, since, self.settings.page_limit)
            .await
        {
            Ok(items) => items,
            Err(TransportError::RateLimited { retry_after }) => {
                info!(%channel, wait = ?retry_after, "poll rate limited");
                return PollStep::Hold(retry_after);
            }
            Err(e) => {
                state.consecutive_errors += 1;
                warn!(%channel, error = %e, errors = state.consecutive_errors, "poll failed");
                if state.consecutive_errors >= self.settings.error_threshold {
                    return PollStep::Disabled;
                }
                return PollStep::Completed;
            }
        };

        state.consecutive_errors = 0;
        if items.is_empty() {
            return PollStep::Completed;
        }

        let newest = items
            .iter()
            .map(|item| item.message_id())
            .max()
            .unwrap_or(since);
        debug!(%channel, items = items.len(), %newest, "poll fetched new items");

        for item in items {
            self.assembler.add(item);
        }

        // Detection is the commit point: the offset advances here whatever
        // later happens to the batches downstream.
        let mut offsets = self.lock_offsets();
        if let Err(e) = offsets.advance(channel, newest) {
            warn!(%channel, error = %e, "failed to persist offset");
        }
        PollStep::Completed
    }

    fn cycle_pause(&self) -> Duration {
        let jitter = self.settings.cycle_jitter();
        if jitter.is_zero() {
            return self.settings.cycle_interval();
        }
        let extra = rand::rng().random_range(0.0..jitter.as_secs_f64());
        self.settings.cycle_interval() + Duration::from_secs_f64(extra)
    }

    fn lock_offsets(&self) -> std::sync::MutexGuard<'_, OffsetStore> {
        self.offsets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct ChannelTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the per-channel tasks and keeps them in sync with configuration.
pub struct PollerSupervisor {
    poller: Arc<Poller>,
    config_path: PathBuf,
    tasks: Mutex<HashMap<ChannelId, ChannelTask>>,
    cancel: CancellationToken,
}

impl PollerSupervisor {
    pub fn new(poller: Arc<Poller>, config_path: PathBuf, cancel: CancellationToken) -> Self {
        PollerSupervisor {
            poller,
            config_path,
            tasks: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// Brings the running channel tasks in line with `desired`.
    ///
    /// New channels are initialized at their current head before their task
    /// starts. Channels whose task died (error-disabled) are restarted with a
    /// fresh error budget. Removed channels are cancelled and dropped from
    /// the offset store; their already-queued batches drain normally.
    pub async fn sync_channels(&self, desired: &[ChannelId]) {
        let (to_remove, to_start): (Vec<ChannelId>, Vec<ChannelId>) = {
            let mut tasks = self.lock_tasks();
            let to_remove = tasks
                .keys()
                .copied()
                .filter(|c| !desired.contains(c))
                .collect();
            tasks.retain(|_, task| !task.handle.is_finished());
            let to_start = desired
                .iter()
                .copied()
                .filter(|c| !tasks.contains_key(c))
                .collect();
            (to_remove, to_start)
        };

        for channel in to_remove {
            info!(%channel, "channel removed from configuration");
            if let Some(task) = self.lock_tasks().remove(&channel) {
                task.cancel.cancel();
            }
            let mut offsets = self.poller.offsets.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = offsets.remove(channel) {
                warn!(%channel, error = %e, "failed to untrack removed channel");
            }
        }

        for (i, channel) in to_start.into_iter().enumerate() {
            if let Err(e) = self.init_offset(channel).await {
                warn!(%channel, error = %e, "cannot initialize channel at head, will retry");
                continue;
            }
            let stagger = self
                .poller
                .settings
                .channel_gap()
                .mul_f64(i as f64);
            self.spawn_channel(channel, stagger);
        }
    }

    /// Periodically re-reads the config file and syncs the channel list.
    pub async fn run_reconciler(&self) {
        let interval = self.poller.settings.reconcile_interval();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match RelayConfig::load(&self.config_path) {
                Ok(config) => self.sync_channels(&config.sources).await,
                Err(e) => warn!(error = %e, "config reload failed, keeping current channels"),
            }
        }
        self.shutdown();
    }

    /// Cancels every channel task.
    pub fn shutdown(&self) {
        let tasks = self.lock_tasks();
        for task in tasks.values() {
            task.cancel.cancel();
        }
    }

    /// Number of live channel tasks. Used by tests and status logging.
    pub fn running_channels(&self) -> usize {
        let mut tasks = self.lock_tasks();
        tasks.retain(|_, task| !task.handle.is_finished());
        tasks.len()
    }

    async fn init_offset(&self, channel: ChannelId) -> Result<(), TransportError> {
        let tracked = {
            let offsets = self.poller.offsets.lock().unwrap_or_else(|e| e.into_inner());
            offsets.contains(channel)
        };
        if tracked {
            return Ok(());
        }
        let head = self.poller.transport.head_id(channel).await?;
        info!(%channel, %head, "new channel starts at head");
        let mut offsets = self.poller.offsets.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = offsets.init_at_head(channel, head) {
            warn!(%channel, error = %e, "failed to persist initial offset");
        }
        Ok(())
    }

    fn spawn_channel(&self, channel: ChannelId, stagger: Duration) {
        let cancel = self.cancel.child_token();
        let poller = Arc::clone(&self.poller);
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            if !stagger.is_zero() {
                tokio::select! {
                    _ = task_cancel.cancelled() => return,
                    _ = tokio::time::sleep(stagger) => {}
                }
            }
            poller.run_channel(channel, task_cancel).await;
        });
        self.lock_tasks().insert(channel, ChannelTask { cancel, handle });
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<ChannelId, ChannelTask>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use crate::types::{Batch, ContentRef, GroupId, MediaItem, MediaKind, MessageId, Origin, OutgoingPost};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;
    use tokio::sync::mpsc;
    use tokio::time::advance;

    const C: ChannelId = ChannelId(-1001);

    fn item(channel: ChannelId, id: u64, group: Option<u64>) -> MediaItem {
        MediaItem {
            kind: MediaKind::Image,
            content: ContentRef::new(format!("file-{id}")),
            caption: None,
            group: group.map(GroupId),
            origin: Origin::new(channel, MessageId(id)),
            size: None,
        }
    }

    enum FetchPlan {
        Items(Vec<MediaItem>),
        RateLimited(Duration),
        Fail,
    }

    #[derive(Default)]
    struct ScriptedTransport {
        fetches: StdMutex<VecDeque<FetchPlan>>,
        /// Each fetch call's `since` argument.
        since_log: StdMutex<Vec<MessageId>>,
        head: StdMutex<HashMap<ChannelId, MessageId>>,
    }

    impl ScriptedTransport {
        fn push(&self, plan: FetchPlan) {
            self.fetches.lock().unwrap().push_back(plan);
        }

        fn set_head(&self, channel: ChannelId, head: MessageId) {
            self.head.lock().unwrap().insert(channel, head);
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn fetch_new(
            &self,
            _channel: ChannelId,
            since: MessageId,
            limit: usize,
        ) -> Result<Vec<MediaItem>, TransportError> {
            self.since_log.lock().unwrap().push(since);
            match self.fetches.lock().unwrap().pop_front() {
                Some(FetchPlan::Items(items)) => {
                    Ok(items.into_iter().take(limit).collect())
                }
                Some(FetchPlan::RateLimited(wait)) => {
                    Err(TransportError::RateLimited { retry_after: wait })
                }
                Some(FetchPlan::Fail) => Err(TransportError::Transient("boom".into())),
                None => Ok(Vec::new()),
            }
        }

        async fn head_id(&self, channel: ChannelId) -> Result<MessageId, TransportError> {
            Ok(self
                .head
                .lock()
                .unwrap()
                .get(&channel)
                .copied()
                .unwrap_or(MessageId::ZERO))
        }

        async fn download(
            &self,
            _item: &MediaItem,
            _max_bytes: u64,
        ) -> Result<Vec<u8>, TransportError> {
            Ok(Vec::new())
        }

        async fn send(
            &self,
            _destination: ChannelId,
            _post: &OutgoingPost,
        ) -> Result<Vec<MessageId>, TransportError> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        transport: Arc<ScriptedTransport>,
        offsets: Arc<Mutex<OffsetStore>>,
        poller: Arc<Poller>,
        batches: mpsc::UnboundedReceiver<Batch>,
        _dir: tempfile::TempDir,
    }

    fn fixture(settings: PollSettings) -> Fixture {
        let dir = tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let offsets = Arc::new(Mutex::new(OffsetStore::load(dir.path().join("offsets.json"))));
        let (tx, rx) = mpsc::unbounded_channel();
        let assembler = GroupAssembler::new(Duration::from_secs(2), tx);
        let poller = Arc::new(Poller::new(
            transport.clone(),
            offsets.clone(),
            assembler,
            settings,
        ));
        Fixture {
            transport,
            offsets,
            poller,
            batches: rx,
            _dir: dir,
        }
    }

    fn quiet_settings() -> PollSettings {
        PollSettings {
            cycle_jitter_secs: 0.0,
            ..PollSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn poll_feeds_assembler_and_advances_offset_on_detection() {
        let mut f = fixture(quiet_settings());
        f.offsets.lock().unwrap().advance(C, MessageId(100)).unwrap();
        f.transport.push(FetchPlan::Items(vec![
            item(C, 101, None),
            item(C, 102, None),
            item(C, 103, Some(7)),
            item(C, 104, Some(7)),
            item(C, 105, Some(7)),
        ]));

        let mut state = ChannelState::default();
        let step = f.poller.poll_once(C, &mut state).await;
        assert_eq!(step, PollStep::Completed);

        // Offset moved to 105 immediately, before any forwarding.
        assert_eq!(f.offsets.lock().unwrap().get(C), MessageId(105));

        // Singletons arrive at once; the group lands after the quiet period.
        assert_eq!(f.batches.recv().await.unwrap().max_message_id(), Some(MessageId(101)));
        assert_eq!(f.batches.recv().await.unwrap().max_message_id(), Some(MessageId(102)));
        advance(Duration::from_millis(2100)).await;
        let group = f.batches.recv().await.unwrap();
        assert_eq!(group.len(), 3);
        assert_eq!(group.max_message_id(), Some(MessageId(105)));
    }

    #[tokio::test(start_paused = true)]
    async fn next_poll_starts_after_previous_offset() {
        let f = fixture(quiet_settings());
        f.transport.push(FetchPlan::Items(vec![item(C, 5, None)]));
        f.transport.push(FetchPlan::Items(vec![]));

        let mut state = ChannelState::default();
        f.poller.poll_once(C, &mut state).await;
        f.poller.poll_once(C, &mut state).await;

        let log = f.transport.since_log.lock().unwrap().clone();
        assert_eq!(log, vec![MessageId::ZERO, MessageId(5)]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_poll_keeps_offset() {
        let f = fixture(quiet_settings());
        f.offsets.lock().unwrap().advance(C, MessageId(50)).unwrap();

        let mut state = ChannelState::default();
        assert_eq!(f.poller.poll_once(C, &mut state).await, PollStep::Completed);
        assert_eq!(f.offsets.lock().unwrap().get(C), MessageId(50));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_holds_without_consuming_error_budget() {
        let f = fixture(quiet_settings());
        f.transport.push(FetchPlan::RateLimited(Duration::from_secs(30)));

        let mut state = ChannelState::default();
        state.consecutive_errors = 4;
        let step = f.poller.poll_once(C, &mut state).await;
        assert_eq!(step, PollStep::Hold(Duration::from_secs(30)));
        assert_eq!(state.consecutive_errors, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn fifth_consecutive_error_disables_channel() {
        let f = fixture(quiet_settings());
        let mut state = ChannelState::default();
        for _ in 0..4 {
            f.transport.push(FetchPlan::Fail);
            assert_eq!(f.poller.poll_once(C, &mut state).await, PollStep::Completed);
        }
        f.transport.push(FetchPlan::Fail);
        assert_eq!(f.poller.poll_once(C, &mut state).await, PollStep::Disabled);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_poll_resets_error_count() {
        let f = fixture(quiet_settings());
        let mut state = ChannelState::default();
        for _ in 0..4 {
            f.transport.push(FetchPlan::Fail);
            f.poller.poll_once(C, &mut state).await;
        }
        f.transport.push(FetchPlan::Items(vec![item(C, 1, None)]));
        f.poller.poll_once(C, &mut state).await;
        assert_eq!(state.consecutive_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_starts_new_channel_at_head() {
        let f = fixture(quiet_settings());
        f.transport.set_head(C, MessageId(900));
        let supervisor = PollerSupervisor::new(
            f.poller.clone(),
            PathBuf::from("unused.json"),
            CancellationToken::new(),
        );

        supervisor.sync_channels(&[C]).await;
        assert_eq!(f.offsets.lock().unwrap().get(C), MessageId(900));
        assert_eq!(supervisor.running_channels(), 1);
        supervisor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_preserves_offset_of_known_channel() {
        let f = fixture(quiet_settings());
        f.offsets.lock().unwrap().advance(C, MessageId(123)).unwrap();
        f.transport.set_head(C, MessageId(900));
        let supervisor = PollerSupervisor::new(
            f.poller.clone(),
            PathBuf::from("unused.json"),
            CancellationToken::new(),
        );

        supervisor.sync_channels(&[C]).await;
        assert_eq!(f.offsets.lock().unwrap().get(C), MessageId(123));
        supervisor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_removes_dropped_channel() {
        let f = fixture(quiet_settings());
        f.transport.set_head(C, MessageId(10));
        let supervisor = PollerSupervisor::new(
            f.poller.clone(),
            PathBuf::from("unused.json"),
            CancellationToken::new(),
        );

        supervisor.sync_channels(&[C]).await;
        assert_eq!(supervisor.running_channels(), 1);

        supervisor.sync_channels(&[]).await;
        tokio::task::yield_now().await;
        assert_eq!(supervisor.running_channels(), 0);
        assert!(!f.offsets.lock().unwrap().contains(C));
    }
}
