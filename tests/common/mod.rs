//! Shared test doubles: recording publisher, in-memory ack sink, batch
//! builders.

#![allow(dead_code)]

use async_trait::async_trait;
use hermes_outbox::{
    AckSink, DeliveredMessage, MemoryPositionStore, PositionStore, Publisher, Result,
    TransactionBatch,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Once};
use tokio::sync::RwLock;

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("hermes_outbox=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Publisher that records every call and can fail the first N attempts.
pub struct RecordingPublisher {
    calls: RwLock<Vec<Vec<DeliveredMessage>>>,
    failures_left: AtomicU32,
}

impl RecordingPublisher {
    pub fn new() -> Arc<Self> {
        Self::failing(0)
    }

    /// Fails the first `failures` publish calls, then succeeds.
    pub fn failing(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: RwLock::new(Vec::new()),
            failures_left: AtomicU32::new(failures),
        })
    }

    /// Every publish call, in invocation order.
    pub async fn calls(&self) -> Vec<Vec<DeliveredMessage>> {
        self.calls.read().await.clone()
    }

    /// Flattened list of every delivered envelope.
    pub async fn delivered(&self) -> Vec<DeliveredMessage> {
        self.calls.read().await.iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, messages: &[DeliveredMessage]) -> anyhow::Result<()> {
        self.calls.write().await.push(messages.to_vec());
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("injected publish failure");
        }
        Ok(())
    }
}

/// Ack sink writing through to a `MemoryPositionStore`, the way the
/// backend sinks write through to their consumer-state row.
pub struct StoreAckSink {
    pub store: Arc<MemoryPositionStore>,
}

#[async_trait]
impl AckSink for StoreAckSink {
    async fn ack(&self, batch: &TransactionBatch) -> Result<()> {
        self.store.ack(&batch.token).await
    }

    async fn before_retry(&self, _batch: &TransactionBatch, attempt: u32) -> Result<()> {
        self.store.set_redelivery(attempt).await
    }
}

/// A transaction batch of `ids.len()` messages committing at `commit_position`.
pub fn batch_of(commit_position: u64, first_row_position: i64, ids: &[&str]) -> TransactionBatch {
    let token = format!("0/{commit_position:X}");
    TransactionBatch {
        transaction_id: commit_position.to_string(),
        token: token.clone(),
        commit_position,
        commit_ts: Some(1_700_000_000_000_000),
        messages: ids
            .iter()
            .enumerate()
            .map(|(i, id)| DeliveredMessage {
                position: first_row_position + i as i64,
                token: token.clone(),
                message_id: id.to_string(),
                message_type: "Test".to_string(),
                partition_key: "default".to_string(),
                redelivery_count: 0,
                data: serde_json::json!({"v": first_row_position + i as i64}),
            })
            .collect(),
    }
}
