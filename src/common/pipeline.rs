//! Reader → queue wiring
//!
//! The ingestor (reader task) pushes transaction batches into a bounded
//! channel; the delivery loop (publisher task) drains it into the
//! publishing queue. A full channel suspends the reader, which stalls
//! upstream acknowledgement - the intended backpressure signal.

use crate::common::lifecycle::Shutdown;
use crate::common::message::TransactionBatch;
use crate::common::queue::PublishingQueue;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Capacity of the ingestor → publisher channel, in batches.
pub const INGEST_CHANNEL_CAPACITY: usize = 64;

/// Create the bounded ingest channel.
pub fn ingest_channel() -> (
    mpsc::Sender<TransactionBatch>,
    mpsc::Receiver<TransactionBatch>,
) {
    mpsc::channel(INGEST_CHANNEL_CAPACITY)
}

/// Publisher task body: feed batches from the ingest channel into the queue
/// until shutdown or the reader side closes, then drain the queue.
pub async fn run_delivery_loop(
    mut rx: mpsc::Receiver<TransactionBatch>,
    queue: Arc<dyn PublishingQueue>,
    shutdown: Arc<Shutdown>,
) {
    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                debug!("delivery loop received shutdown signal");
                break;
            }
            batch = rx.recv() => match batch {
                Some(batch) => {
                    debug!(
                        transaction = %batch.transaction_id,
                        messages = batch.len(),
                        "delivering batch"
                    );
                    if queue.submit(batch).await.is_err() {
                        break;
                    }
                }
                None => {
                    debug!("ingest channel closed");
                    break;
                }
            },
        }
    }

    queue.drain().await;
    info!("delivery loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::queue::{build_queue, AckSink, QueueSettings};
    use crate::common::publisher::{noop_error_sink, Publisher};
    use crate::common::{DeliveredMessage, Result};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::RwLock;

    struct OkPublisher;

    #[async_trait]
    impl Publisher for OkPublisher {
        async fn publish(&self, _messages: &[DeliveredMessage]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct VecAck(RwLock<Vec<u64>>);

    #[async_trait]
    impl AckSink for VecAck {
        async fn ack(&self, batch: &TransactionBatch) -> Result<()> {
            self.0.write().await.push(batch.commit_position);
            Ok(())
        }
        async fn before_retry(&self, _batch: &TransactionBatch, _attempt: u32) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_delivery_loop_drains_channel() {
        let (tx, rx) = ingest_channel();
        let ack = Arc::new(VecAck(RwLock::new(Vec::new())));
        let shutdown = Shutdown::new();
        let queue = build_queue(
            QueueSettings::default(),
            Arc::new(OkPublisher),
            ack.clone(),
            noop_error_sink(),
            noop_error_sink(),
            shutdown.clone(),
        );

        let publisher_task = tokio::spawn(run_delivery_loop(rx, queue, shutdown));

        for pos in 1..=10u64 {
            tx.send(TransactionBatch {
                transaction_id: pos.to_string(),
                token: format!("0/{pos:X}"),
                commit_position: pos,
                commit_ts: None,
                messages: vec![DeliveredMessage {
                    position: pos as i64,
                    token: format!("0/{pos:X}"),
                    message_id: format!("m{pos}"),
                    message_type: "T".to_string(),
                    partition_key: "default".to_string(),
                    redelivery_count: 0,
                    data: serde_json::json!({}),
                }],
            })
            .await
            .unwrap();
        }
        drop(tx);

        tokio::time::timeout(Duration::from_secs(5), publisher_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*ack.0.read().await, (1..=10).collect::<Vec<_>>());
    }
}
