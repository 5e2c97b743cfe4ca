//! # Publishing Queue
//!
//! The in-process pipeline between the ingestor and the user publish
//! callback. Two interchangeable implementations sit behind one contract:
//!
//! - [`SerializedQueue`] - at most one publish call in flight.
//! - [`PipelinedQueue`] - bounded concurrent publish calls, with
//!   acknowledgements reordered back to source-commit order before they are
//!   applied.
//!
//! Common to both: batches are published in source-commit order of
//! submission, the ack for batch N never runs before the acks for batches
//! < N have completed, a callback error means the batch is retried after
//! `wait_after_failed_publish` (with the redelivery counter persisted before
//! each retry), and entering shutdown cancels in-flight retry waits - never
//! an in-flight publish call itself.

use crate::common::backoff::ExponentialBackoff;
use crate::common::lifecycle::Shutdown;
use crate::common::message::TransactionBatch;
use crate::common::publisher::{ErrorSink, Publisher};
use crate::common::{HermesError, Result};
use async_trait::async_trait;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

/// Applies acknowledgements and persists retry progress.
///
/// The queue calls `ack` exactly once per delivered batch, in commit order,
/// and `before_retry` before every redelivery attempt.
#[async_trait]
pub trait AckSink: Send + Sync {
    /// Advance the acknowledged position past `batch`.
    async fn ack(&self, batch: &TransactionBatch) -> Result<()>;

    /// Persist the redelivery counter ahead of retry attempt `attempt`.
    async fn before_retry(&self, batch: &TransactionBatch, attempt: u32) -> Result<()>;
}

/// Knobs shared by both queue implementations.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Use the serialized queue instead of the pipelined one
    pub serialization: bool,
    /// Delay before retrying a failed publish call
    pub wait_after_failed_publish: Duration,
    /// Maximum concurrently outstanding publish calls (pipelined only)
    pub max_in_flight: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            serialization: false,
            wait_after_failed_publish: Duration::from_secs(30),
            max_in_flight: 16,
        }
    }
}

/// The queue contract shared by both implementations.
#[async_trait]
pub trait PublishingQueue: Send + Sync {
    /// Submit a batch for publication.
    ///
    /// The serialized queue returns once the batch is published and acked;
    /// the pipelined queue returns once the batch occupies an in-flight
    /// slot (blocking while at capacity).
    async fn submit(&self, batch: TransactionBatch) -> Result<()>;

    /// Wait until every submitted batch has been published and acknowledged
    /// or abandoned by shutdown.
    async fn drain(&self);
}

/// Build the queue variant selected by `settings.serialization`.
pub fn build_queue(
    settings: QueueSettings,
    publisher: Arc<dyn Publisher>,
    ack: Arc<dyn AckSink>,
    on_failed_publish: ErrorSink,
    on_db_error: ErrorSink,
    shutdown: Arc<Shutdown>,
) -> Arc<dyn PublishingQueue> {
    if settings.serialization {
        Arc::new(SerializedQueue {
            worker: QueueWorker {
                publisher,
                ack,
                on_failed_publish,
                on_db_error,
                retry_delay: settings.wait_after_failed_publish,
                shutdown,
            },
        })
    } else {
        Arc::new(PipelinedQueue {
            worker: Arc::new(QueueWorker {
                publisher,
                ack,
                on_failed_publish,
                on_db_error,
                retry_delay: settings.wait_after_failed_publish,
                shutdown,
            }),
            max_in_flight: settings.max_in_flight,
            slots: Arc::new(Semaphore::new(settings.max_in_flight)),
            reorder: Arc::new(Mutex::new(ReorderState::new())),
        })
    }
}

/// Shared publish/retry/ack machinery.
struct QueueWorker {
    publisher: Arc<dyn Publisher>,
    ack: Arc<dyn AckSink>,
    on_failed_publish: ErrorSink,
    on_db_error: ErrorSink,
    retry_delay: Duration,
    shutdown: Arc<Shutdown>,
}

impl QueueWorker {
    /// Publish `batch`, retrying on callback errors until success or
    /// shutdown. Returns the batch on success, `None` when abandoned.
    async fn publish_until_delivered(
        &self,
        mut batch: TransactionBatch,
    ) -> Option<TransactionBatch> {
        let mut attempt: u32 = 0;
        loop {
            batch.set_redelivery_count(attempt);
            match self.publisher.publish(&batch.messages).await {
                Ok(()) => return Some(batch),
                Err(err) => {
                    attempt += 1;
                    let publish_err = HermesError::publish(err);
                    warn!(
                        transaction = %batch.transaction_id,
                        attempt,
                        "publish callback failed, retrying in {:?}",
                        self.retry_delay
                    );
                    (self.on_failed_publish)(&publish_err);

                    // The counter must be durable before the redelivery so a
                    // crash mid-retry is still reflected in the envelope.
                    if let Err(db_err) = self.ack.before_retry(&batch, attempt).await {
                        (self.on_db_error)(&db_err);
                    }

                    tokio::select! {
                        _ = self.shutdown.wait() => return None,
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
            }
        }
    }

    /// Apply the ack, retrying storage errors with backoff until success or
    /// shutdown.
    async fn ack_with_backoff(&self, batch: &TransactionBatch) -> bool {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(5));
        loop {
            match self.ack.ack(batch).await {
                Ok(()) => return true,
                Err(err) => {
                    (self.on_db_error)(&err);
                    let delay = backoff.next_backoff();
                    tokio::select! {
                        _ = self.shutdown.wait() => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

/// At most one publish call in flight. Simplest correctness.
pub struct SerializedQueue {
    worker: QueueWorker,
}

#[async_trait]
impl PublishingQueue for SerializedQueue {
    async fn submit(&self, batch: TransactionBatch) -> Result<()> {
        if let Some(delivered) = self.worker.publish_until_delivered(batch).await {
            self.worker.ack_with_backoff(&delivered).await;
        }
        Ok(())
    }

    async fn drain(&self) {
        // Nothing is outstanding once submit returns.
    }
}

/// Bounded concurrent publishing with acks reordered to commit order.
pub struct PipelinedQueue {
    worker: Arc<QueueWorker>,
    max_in_flight: usize,
    slots: Arc<Semaphore>,
    reorder: Arc<Mutex<ReorderState>>,
}

/// A batch whose publish finished, waiting for its predecessors to ack.
struct ReadySlot {
    seq: u64,
    /// `None` marks a batch abandoned by shutdown; it blocks later acks.
    batch: Option<TransactionBatch>,
}

impl PartialEq for ReadySlot {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for ReadySlot {}
impl PartialOrd for ReadySlot {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ReadySlot {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.seq.cmp(&other.seq)
    }
}

struct ReorderState {
    /// Sequence assigned to the next submitted batch
    next_seq: u64,
    /// Sequence whose ack is next in line
    next_ack: u64,
    /// Min-heap of finished batches keyed by submission sequence
    ready: BinaryHeap<Reverse<ReadySlot>>,
}

impl ReorderState {
    fn new() -> Self {
        Self {
            next_seq: 0,
            next_ack: 0,
            ready: BinaryHeap::new(),
        }
    }
}

impl PipelinedQueue {
    /// Mark `seq` as finished and ack every consecutive ready head.
    ///
    /// Acks run under the reorder lock, which serializes them in sequence
    /// order - the invariant the contract requires.
    async fn finish(&self, seq: u64, batch: Option<TransactionBatch>) {
        let mut state = self.reorder.lock().await;
        state.ready.push(Reverse(ReadySlot { seq, batch }));

        while let Some(Reverse(head)) = state.ready.peek() {
            if head.seq != state.next_ack {
                break;
            }
            let Reverse(slot) = state.ready.pop().expect("peeked head exists");
            match slot.batch {
                Some(batch) => {
                    debug!(
                        seq = slot.seq,
                        commit_position = batch.commit_position,
                        "acking batch in commit order"
                    );
                    self.worker.ack_with_backoff(&batch).await;
                    state.next_ack += 1;
                }
                None => {
                    // Abandoned predecessor: acking successors would create a
                    // gap, so everything behind it is dropped with it.
                    state.ready.clear();
                    state.next_ack = state.next_seq;
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl PublishingQueue for PipelinedQueue {
    async fn submit(&self, batch: TransactionBatch) -> Result<()> {
        let permit = tokio::select! {
            _ = self.worker.shutdown.wait() => return Ok(()),
            permit = self.slots.clone().acquire_owned() => {
                permit.map_err(|_| HermesError::InvalidState("queue closed".into()))?
            }
        };

        let seq = {
            let mut state = self.reorder.lock().await;
            let seq = state.next_seq;
            state.next_seq += 1;
            seq
        };

        let queue = Self {
            worker: self.worker.clone(),
            max_in_flight: self.max_in_flight,
            slots: self.slots.clone(),
            reorder: self.reorder.clone(),
        };
        tokio::spawn(async move {
            let _permit = permit;
            let delivered = queue.worker.publish_until_delivered(batch).await;
            queue.finish(seq, delivered).await;
        });
        Ok(())
    }

    async fn drain(&self) {
        // Every worker task holds a slot until its ack is applied; holding
        // all slots therefore means the pipeline is empty.
        if let Ok(all) = self.slots.acquire_many(self.max_in_flight as u32).await {
            drop(all);
        }
    }
}
