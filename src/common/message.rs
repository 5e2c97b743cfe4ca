//! Message envelopes and transaction batches
//!
//! The enqueued envelope, the delivered envelope handed to the publish
//! callback, and the per-transaction batch the ingestors emit.
//!
//! ## Transaction batches
//!
//! A batch is the ordered set of outbox rows that were committed together
//! upstream. Within a partition, batches are emitted in commit order and
//! without gaps; the same batch may be emitted again after a reconnect
//! (at-least-once), so consumers must tolerate duplicate `message_id`s.

use serde::{Deserialize, Serialize};

/// A message handed to `enqueue` / `send`.
///
/// `message_id` is user-supplied and intended to be deterministic so that
/// downstream consumers can deduplicate redeliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// Opaque, user-supplied idempotency key
    pub message_id: String,
    /// Short message tag (e.g. "OrderCreated")
    pub message_type: String,
    /// Opaque JSON payload
    pub data: serde_json::Value,
}

impl OutboxMessage {
    /// Create a new outbox message.
    pub fn new(
        message_id: impl Into<String>,
        message_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            message_type: message_type.into(),
            data,
        }
    }
}

/// A message as delivered to the publish callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveredMessage {
    /// Monotonic per-partition position assigned at insert
    pub position: i64,
    /// Opaque token identifying the commit location in the upstream log
    pub token: String,
    /// Idempotency key as enqueued
    pub message_id: String,
    /// Message tag as enqueued
    pub message_type: String,
    /// Partition this message belongs to
    pub partition_key: String,
    /// Number of prior failed publish attempts for the current batch
    pub redelivery_count: u32,
    /// Payload as enqueued
    pub data: serde_json::Value,
}

/// The ordered set of outbox rows committed together upstream.
///
/// Non-empty by construction: both ingestors only emit batches after
/// observing at least one outbox row for the consumer's partition.
#[derive(Debug, Clone)]
pub struct TransactionBatch {
    /// Upstream transaction id (xid for the log backend)
    pub transaction_id: String,
    /// Commit position token (`HI/LO` hex, or an opaque resume token)
    pub token: String,
    /// Numeric commit order key; strictly increasing per partition
    pub commit_position: u64,
    /// Commit timestamp (epoch micros) when the source provides one
    pub commit_ts: Option<i64>,
    /// Delivered envelopes in insertion order
    pub messages: Vec<DeliveredMessage>,
}

impl TransactionBatch {
    /// Number of messages in the batch.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True when the batch carries no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Set the redelivery counter on every envelope in the batch.
    pub(crate) fn set_redelivery_count(&mut self, count: u32) {
        for msg in &mut self.messages {
            msg.redelivery_count = count;
        }
    }
}
