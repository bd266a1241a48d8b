//! Bounded ingestion queue and its drain worker.
//!
//! Peers, imports and crawl results do not write into the store directly;
//! they enqueue envelopes here. The queue has a fixed capacity and a full
//! queue blocks the producer, which is the node's primary backpressure
//! mechanism against peers pushing faster than the index can absorb.
//!
//! A single background worker drains the queue: it sleeps on an empty
//! queue, then on the first arrival drains everything that is immediately
//! available, writing each envelope through the store and logging a
//! throughput summary per drain pass. The worker survives individual
//! write failures; a crashed worker would be a liveness bug.

use crate::store::Store;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use magpie_core::{Author, Message};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Default queue capacity.
const QUEUE_CAPACITY: usize = 100_000;

/// How long the worker sleeps when the queue is empty.
const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// One unit of pending ingestion work.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message: Message,
    pub author: Author,
    /// Append the message to the dump log on write.
    pub persist_log: bool,
    /// Force the author record to be replaced.
    pub overwrite_author: bool,
}

/// Multi-producer, single-consumer bounded ingestion queue.
#[derive(Clone)]
pub struct IndexQueue {
    tx: Sender<Envelope>,
    rx: Receiver<Envelope>,
}

impl IndexQueue {
    pub fn new() -> Self {
        Self::with_capacity(QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx }
    }

    /// Enqueue an envelope, blocking while the queue is full.
    pub fn enqueue(&self, envelope: Envelope) {
        metrics::counter!("queue_enqueued_total").increment(1);
        // send only fails when all receivers are gone, i.e. on shutdown;
        // dropping the envelope then is fine.
        let _ = self.tx.send(envelope);
        metrics::gauge!("queue_depth").set(self.tx.len() as f64);
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

impl Default for IndexQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// The drain worker.
pub struct IndexWorker;

impl IndexWorker {
    /// Start the worker thread. It runs until `running` goes false and
    /// the current drain pass finishes.
    pub fn spawn(
        store: Arc<Store>,
        queue: IndexQueue,
        running: Arc<AtomicBool>,
    ) -> thread::JoinHandle<()> {
        Self::spawn_with_poll(store, queue, running, POLL_INTERVAL)
    }

    /// Like [`IndexWorker::spawn`] with a custom empty-queue poll interval.
    pub fn spawn_with_poll(
        store: Arc<Store>,
        queue: IndexQueue,
        running: Arc<AtomicBool>,
        poll: Duration,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            info!("ingestion queue worker started");
            while running.load(Ordering::SeqCst) {
                match queue.rx.recv_timeout(poll) {
                    Ok(first) => {
                        Self::drain_pass(&store, &queue, first);
                        metrics::gauge!("queue_depth").set(queue.len() as f64);
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        // Queue empty; keep waiting.
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        info!("ingestion queue disconnected, stopping worker");
                        break;
                    }
                }
            }
            info!("ingestion queue worker stopped");
        })
    }

    /// Drain everything that is immediately available, starting with an
    /// already-received envelope, and log the pass summary.
    fn drain_pass(store: &Store, queue: &IndexQueue, first: Envelope) {
        let start = Instant::now();
        let mut new = 0usize;
        let mut known_cache = 0usize;
        let mut known_index = 0usize;

        let mut next = Some(first);
        while let Some(envelope) = next {
            // Cache-resident ids skip the write path entirely.
            if store.cached(&envelope.message.id) {
                known_cache += 1;
                metrics::counter!("queue_cache_hits_total").increment(1);
            } else {
                match store.write(
                    &envelope.message,
                    &envelope.author,
                    envelope.persist_log,
                    envelope.overwrite_author,
                ) {
                    Ok(true) => new += 1,
                    Ok(false) => known_index += 1,
                    Err(e) => {
                        // Log and keep draining; one stuck message must
                        // not stall the queue.
                        error!(id = %envelope.message.id, error = %e, "queue write failed");
                    }
                }
            }
            next = queue.rx.try_recv().ok();
        }

        let elapsed = start.elapsed();
        let total = new + known_cache + known_index;
        if elapsed.as_secs_f64() > 0.0 {
            metrics::gauge!("queue_messages_per_second")
                .set(total as f64 / elapsed.as_secs_f64());
        }
        if new > 0 {
            info!(
                new,
                known_cache,
                known_index,
                elapsed_ms = elapsed.as_millis() as u64,
                "queue drain pass"
            );
        } else {
            debug!(known_cache, known_index, "queue drain pass, nothing new");
        }
    }
}
