//! Delivery of processed posts to the destination channels.
//!
//! Destinations are independent: one destination failing (even permanently)
//! never blocks delivery to the others. Per destination the forwarder
//! enforces a minimum spacing since its previous send (plus jitter, to stay
//! under platform throughput limits), then attempts the send under the retry
//! policy.
//!
//! Multi-item posts go out as one atomic grouped send. If the transport
//! reports grouped delivery unsupported for a destination, the forwarder
//! degrades to per-item sends — explicitly, with a warning, never as silent
//! partial success of the grouped call.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::retry::{RetryConfig, RetryResult, retry_with_backoff};
use crate::transport::Transport;
use crate::types::{ChannelId, OutgoingPost};

/// Per-destination outcome of one forwarding pass.
#[derive(Debug, Default)]
pub struct ForwardReport {
    pub delivered: Vec<ChannelId>,
    pub failed: Vec<ChannelId>,
}

impl ForwardReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Forwarder {
    transport: Arc<dyn Transport>,
    retry: RetryConfig,
    min_spacing: Duration,
    spacing_jitter: Duration,
    last_send: Mutex<HashMap<ChannelId, Instant>>,
}

impl Forwarder {
    pub fn new(
        transport: Arc<dyn Transport>,
        retry: RetryConfig,
        min_spacing: Duration,
        spacing_jitter: Duration,
    ) -> Self {
        Forwarder {
            transport,
            retry,
            min_spacing,
            spacing_jitter,
            last_send: Mutex::new(HashMap::new()),
        }
    }

    /// Forwards `post` to each destination in turn.
    ///
    /// Returns which destinations received the post and which exhausted
    /// their retries; the caller decides whether failures go back on the
    /// queue.
    pub async fn forward(&self, post: &OutgoingPost, destinations: &[ChannelId]) -> ForwardReport {
        let mut report = ForwardReport::default();
        for &destination in destinations {
            if self.forward_to(post, destination).await {
                report.delivered.push(destination);
            } else {
                report.failed.push(destination);
            }
        }
        report
    }

    async fn forward_to(&self, post: &OutgoingPost, destination: ChannelId) -> bool {
        self.wait_for_spacing(destination).await;

        let result = retry_with_backoff(self.retry, || async move {
            self.transport.send(destination, post).await
        })
        .await;

        match result {
            RetryResult::Success(ids) => {
                self.mark_sent(destination);
                debug!(%destination, sent = ids.len(), "post delivered");
                true
            }
            RetryResult::GroupedUnsupported if post.is_grouped() => {
                warn!(%destination, items = post.items.len(),
                    "grouped delivery unsupported, degrading to per-item sends");
                self.forward_items_individually(post, destination).await
            }
            RetryResult::GroupedUnsupported => {
                // A singleton send has no grouped form to degrade to.
                warn!(%destination, "transport rejected singleton as grouped");
                false
            }
            RetryResult::ExhaustedRetries { last_error, attempts } => {
                warn!(%destination, attempts, error = %last_error, "forward retries exhausted");
                false
            }
            RetryResult::PermanentError(e) => {
                warn!(%destination, error = %e, "forward failed permanently");
                false
            }
        }
    }

    /// Explicit degradation path: one send per item, caption on the first.
    /// Spacing applies between the item sends as to any other send.
    async fn forward_items_individually(
        &self,
        post: &OutgoingPost,
        destination: ChannelId,
    ) -> bool {
        let mut all_sent = true;
        for (i, item) in post.items.iter().enumerate() {
            if i > 0 {
                self.wait_for_spacing(destination).await;
            }
            let single = OutgoingPost {
                items: vec![item.clone()],
                caption: if i == 0 { post.caption.clone() } else { None },
            };
            let single = &single;
            let result = retry_with_backoff(self.retry, || async move {
                self.transport.send(destination, single).await
            })
            .await;
            match result {
                RetryResult::Success(_) => self.mark_sent(destination),
                other => {
                    warn!(%destination, item = i, outcome = ?other.into_result().err(),
                        "per-item fallback send failed");
                    all_sent = false;
                }
            }
        }
        if all_sent {
            info!(%destination, items = post.items.len(), "per-item fallback completed");
        }
        all_sent
    }

    /// Sleeps until the destination's minimum spacing (plus jitter) since its
    /// last successful send has passed.
    async fn wait_for_spacing(&self, destination: ChannelId) {
        let last = {
            let map = self.last_send.lock().unwrap_or_else(|e| e.into_inner());
            map.get(&destination).copied()
        };
        let Some(last) = last else { return };

        let jitter = if self.spacing_jitter.is_zero() {
            Duration::ZERO
        } else {
            let max = self.spacing_jitter.as_secs_f64();
            Duration::from_secs_f64(rand::rng().random_range(0.0..max))
        };
        let ready = last + self.min_spacing + jitter;
        if ready > Instant::now() {
            tokio::time::sleep_until(ready).await;
        }
    }

    fn mark_sent(&self, destination: ChannelId) {
        let mut map = self.last_send.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(destination, Instant::now());
    }
}
