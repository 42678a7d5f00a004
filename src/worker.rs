//! The queue consumer: dequeue, process, forward, ack.
//!
//! On a forwarding failure the batch goes back to the front of the queue
//! carrying its prepared post and the destinations still owed, and the source
//! channel is placed under queue backoff. The prepared post matters: the
//! first pass already admitted the batch's fingerprints into the hash index,
//! so reprocessing on retry would classify the batch as a duplicate of
//! itself. Retries therefore skip processing and go straight to forwarding.
//!
//! Several workers may run concurrently; the queue hands each batch to
//! exactly one of them.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::forwarder::Forwarder;
use crate::processor::{ContentProcessor, ProcessOutcome};
use crate::queue::{PreparedPost, QueuedBatch, WorkQueue};
use crate::types::{Batch, ChannelId};

pub struct Worker {
    queue: Arc<WorkQueue>,
    processor: Arc<ContentProcessor>,
    forwarder: Arc<Forwarder>,
    destinations: Vec<ChannelId>,
}

impl Worker {
    pub fn new(
        queue: Arc<WorkQueue>,
        processor: Arc<ContentProcessor>,
        forwarder: Arc<Forwarder>,
        destinations: Vec<ChannelId>,
    ) -> Self {
        Worker {
            queue,
            processor,
            forwarder,
            destinations,
        }
    }

    /// Consumes the queue until cancelled. A batch picked up just before
    /// cancellation is finished, not abandoned.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let entry = tokio::select! {
                _ = cancel.cancelled() => return,
                entry = self.queue.dequeue() => entry,
            };
            self.handle(entry).await;
        }
    }

    /// Processes and forwards one queued batch.
    pub async fn handle(&self, entry: QueuedBatch) {
        let channel = entry.channel;
        let (post, targets) = match entry.prepared {
            Some(prepared) => {
                debug!(%channel, remaining = prepared.remaining.len(), "retrying prepared post");
                (prepared.post, prepared.remaining)
            }
            None => match self.processor.process(entry.batch.clone()).await {
                ProcessOutcome::Forward(post) => (post, self.destinations.clone()),
                ProcessOutcome::Rejected { matched } => {
                    debug!(%channel, word = %matched, "batch rejected, acked");
                    return;
                }
                ProcessOutcome::Empty => {
                    debug!(%channel, "nothing left to forward, acked");
                    return;
                }
            },
        };

        let report = self.forwarder.forward(&post, &targets).await;
        if report.all_delivered() {
            return;
        }

        info!(%channel, failed = report.failed.len(), "forward incomplete, requeueing");
        self.queue.requeue_front(QueuedBatch {
            channel,
            batch: entry.batch,
            prepared: Some(PreparedPost {
                post,
                remaining: report.failed,
            }),
        });
        self.queue.note_failure(channel);
    }
}

/// Moves settled batches from the assembler into the work queue.
///
/// On cancellation the channel is drained first, so batches the assembler
/// flushed during shutdown still reach the queue (and, via offsets, the
/// restart picks up anything that never made it further).
pub async fn run_intake(
    mut batches: mpsc::UnboundedReceiver<Batch>,
    queue: Arc<WorkQueue>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = batches.recv() => match received {
                Some(batch) => enqueue(&queue, batch),
                None => return,
            },
        }
    }
    while let Ok(batch) = batches.try_recv() {
        enqueue(&queue, batch);
    }
}

fn enqueue(queue: &WorkQueue, batch: Batch) {
    if let Some(channel) = batch.channel() {
        queue.enqueue(QueuedBatch::new(channel, batch));
    }
}

/// Drives the queue's slow backoff decay until cancelled.
pub async fn run_backoff_decay(
    queue: Arc<WorkQueue>,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => queue.decay_backoff(),
        }
    }
}
