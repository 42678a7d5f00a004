//! The in-memory work queue between detection and forwarding.
//!
//! FIFO of batches, consumed by worker tasks. A forwarding failure requeues
//! the batch at the front and places its source channel under backoff; while
//! a channel backs off, its batches stay queued (never dropped) and workers
//! serve other channels. Backoff grows multiplicatively on each failure,
//! bounded above, and decays multiplicatively on a periodic tick so one bad
//! stretch does not penalize a channel forever.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::types::{Batch, ChannelId, OutgoingPost};

/// Backoff growth and decay parameters.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// First failure's delay, and the floor below which decay clears state.
    pub initial: Duration,
    /// Upper bound on the per-channel delay.
    pub max: Duration,
    /// Multiplier applied on each failure.
    pub growth: f64,
    /// Multiplier applied on each decay tick.
    pub decay: f64,
}

impl BackoffConfig {
    pub const DEFAULT: BackoffConfig = BackoffConfig {
        initial: Duration::from_secs(5),
        max: Duration::from_secs(300),
        growth: 2.0,
        decay: 0.5,
    };
}

/// A processed batch carried across forwarding retries.
///
/// Requeued work must not be processed twice: the first pass already admitted
/// the batch's fingerprints, so a second pass would reject its own items as
/// duplicates. The prepared post plus the destinations still owed lets the
/// retry go straight to forwarding.
#[derive(Debug, Clone)]
pub struct PreparedPost {
    pub post: OutgoingPost,
    pub remaining: Vec<ChannelId>,
}

/// One unit of queued work.
#[derive(Debug, Clone)]
pub struct QueuedBatch {
    pub channel: ChannelId,
    pub batch: Batch,
    /// Present only on requeued entries that already cleared processing.
    pub prepared: Option<PreparedPost>,
}

impl QueuedBatch {
    pub fn new(channel: ChannelId, batch: Batch) -> Self {
        QueuedBatch {
            channel,
            batch,
            prepared: None,
        }
    }
}

#[derive(Debug)]
struct BackoffState {
    delay: Duration,
    until: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    deque: VecDeque<QueuedBatch>,
    backoff: HashMap<ChannelId, BackoffState>,
}

/// Shared FIFO with per-channel backoff. All methods take `&self`.
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    config: BackoffConfig,
}

impl WorkQueue {
    pub fn new(config: BackoffConfig) -> Self {
        WorkQueue {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().deque.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().deque.is_empty()
    }

    /// Appends new work.
    pub fn enqueue(&self, item: QueuedBatch) {
        self.lock().deque.push_back(item);
        self.notify.notify_one();
    }

    /// Returns failed work to the head of the queue, preserving the
    /// channel's send order.
    pub fn requeue_front(&self, item: QueuedBatch) {
        self.lock().deque.push_front(item);
        self.notify.notify_one();
    }

    /// Removes the first entry whose channel is not backing off, waiting as
    /// long as necessary. Entries of a single channel always come out in
    /// insertion order.
    pub async fn dequeue(&self) -> QueuedBatch {
        loop {
            let wait_until = {
                let mut inner = self.lock();
                let now = Instant::now();
                let eligible = inner.deque.iter().position(|entry| {
                    inner
                        .backoff
                        .get(&entry.channel)
                        .is_none_or(|state| state.until <= now)
                });
                if let Some(pos) = eligible {
                    // remove() on a found position cannot fail.
                    let item = inner.deque.remove(pos);
                    if let Some(item) = item {
                        return item;
                    }
                    continue;
                }
                // Everything queued is backing off (or nothing is queued).
                inner
                    .deque
                    .iter()
                    .filter_map(|entry| inner.backoff.get(&entry.channel))
                    .map(|state| state.until)
                    .min()
            };

            match wait_until {
                Some(until) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(until) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Records a forwarding failure: the channel's delay doubles (bounded)
    /// and its batches are held until the delay passes.
    pub fn note_failure(&self, channel: ChannelId) {
        let config = self.config;
        let mut inner = self.lock();
        let state = inner.backoff.entry(channel).or_insert(BackoffState {
            delay: config.initial,
            until: Instant::now(),
        });
        if state.until > Instant::now() || state.delay > config.initial {
            state.delay = mul_clamped(state.delay, config.growth, config.max);
        }
        state.until = Instant::now() + state.delay;
        debug!(%channel, delay_secs = state.delay.as_secs_f64(), "channel backoff");
        // Waiters recompute their deadline.
        self.notify.notify_one();
    }

    /// Decays the delay of channels whose hold has expired (the channel has
    /// been healthy since); entries decayed below the initial delay clear
    /// entirely. A still-active hold is left untouched — decay rewards
    /// recovery, it never shortens a pending penalty. Driven by the worker's
    /// slow periodic tick.
    pub fn decay_backoff(&self) {
        let config = self.config;
        let now = Instant::now();
        let mut inner = self.lock();
        inner.backoff.retain(|_, state| {
            if state.until > now {
                return true;
            }
            state.delay = state.delay.mul_f64(config.decay);
            state.delay >= config.initial
        });
    }

    /// The instant until which a channel is held, if any. Used by tests and
    /// status logging.
    pub fn backoff_until(&self, channel: ChannelId) -> Option<Instant> {
        self.lock()
            .backoff
            .get(&channel)
            .map(|state| state.until)
            .filter(|until| *until > Instant::now())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn mul_clamped(delay: Duration, factor: f64, max: Duration) -> Duration {
    let grown = delay.mul_f64(factor);
    if grown > max { max } else { grown }
}
