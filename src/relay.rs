//! Pipeline composition: wires the stages together and supervises shutdown.
//!
//! Stage plumbing: poller tasks → group assembler → intake → work queue →
//! worker (processor + forwarder). Shutdown is staged so nothing already
//! detected gets lost: stop polling, flush the assembler's open groups, drain
//! the intake channel into the queue, then stop the workers. Whatever is
//! still queued at exit is recovered on restart through the offset store.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::assembler::GroupAssembler;
use crate::config::RelayConfig;
use crate::dedup::HashIndex;
use crate::forwarder::Forwarder;
use crate::persistence::OffsetStore;
use crate::poller::{Poller, PollerSupervisor};
use crate::processor::ContentProcessor;
use crate::queue::WorkQueue;
use crate::transport::{DumpSink, TextTransform, Transport};
use crate::worker::{Worker, run_backoff_decay, run_intake};

/// External collaborators the relay delegates to.
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub transform: Arc<dyn TextTransform>,
    pub dump: Option<Arc<dyn DumpSink>>,
}

/// Runs the relay until `shutdown` fires, then drains in stage order.
pub async fn run(
    config: RelayConfig,
    config_path: PathBuf,
    collaborators: Collaborators,
    shutdown: CancellationToken,
) {
    let offsets = Arc::new(Mutex::new(OffsetStore::load(config.offsets_path())));
    let index = Arc::new(Mutex::new(HashIndex::load(
        config.hash_index_path(),
        config.content.hash_capacity,
    )));

    let (batch_tx, batch_rx) = mpsc::unbounded_channel();
    let assembler = GroupAssembler::new(config.content.group_debounce(), batch_tx);
    let queue = Arc::new(WorkQueue::new(config.queue.backoff()));

    let poller = Arc::new(Poller::new(
        collaborators.transport.clone(),
        offsets,
        assembler.clone(),
        config.poll.clone(),
    ));
    let supervisor = Arc::new(PollerSupervisor::new(
        poller,
        config_path,
        shutdown.child_token(),
    ));
    supervisor.sync_channels(&config.sources).await;

    let processor = Arc::new(ContentProcessor::new(
        collaborators.transport.clone(),
        collaborators.transform,
        collaborators.dump,
        index,
        config.content.clone(),
        &config.banned_words,
    ));
    let forwarder = Arc::new(Forwarder::new(
        collaborators.transport,
        config.forward.retry(),
        config.forward.min_spacing(),
        config.forward.spacing_jitter(),
    ));
    let worker = Arc::new(Worker::new(
        queue.clone(),
        processor,
        forwarder,
        config.destinations.clone(),
    ));

    let intake_cancel = CancellationToken::new();
    let worker_cancel = CancellationToken::new();

    let intake = tokio::spawn(run_intake(batch_rx, queue.clone(), intake_cancel.clone()));
    let decay = tokio::spawn(run_backoff_decay(
        queue.clone(),
        config.queue.decay_interval(),
        worker_cancel.clone(),
    ));
    let worker_task = tokio::spawn(worker.run(worker_cancel.clone()));
    let reconciler = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.run_reconciler().await })
    };

    info!(
        sources = config.sources.len(),
        destinations = config.destinations.len(),
        "relay running"
    );
    shutdown.cancelled().await;
    info!("shutdown requested, draining");

    // Stage order: no new detections, flush open groups, drain the channel
    // into the queue, then stop consuming.
    supervisor.shutdown();
    let _ = reconciler.await;
    assembler.flush_all();
    intake_cancel.cancel();
    let _ = intake.await;
    worker_cancel.cancel();
    let _ = worker_task.await;
    let _ = decay.await;

    info!(queued = queue.len(), "relay stopped");
}
