//! Publish callback contract and host-supplied hooks
//!
//! The user callback is the delivery boundary: a normal return means the
//! batch is delivered, an error means the batch is retried after
//! `wait_after_failed_publish`. The callback must be tolerant of duplicate
//! invocations on the same `message_id` (at-least-once delivery).

use crate::common::message::DeliveredMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;

/// User publish callback.
///
/// Invoked once per transaction batch with the full, ordered envelope
/// sequence of that batch. An in-flight call is never cancelled: when the
/// consumer stops, the call runs to completion and its result is ignored.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish a batch of delivered messages.
    async fn publish(&self, messages: &[DeliveredMessage]) -> anyhow::Result<()>;
}

/// Blanket adapter so plain async closures can be used as publishers.
pub struct FnPublisher<F>(pub F);

#[async_trait]
impl<F, Fut> Publisher for FnPublisher<F>
where
    F: Fn(Vec<DeliveredMessage>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn publish(&self, messages: &[DeliveredMessage]) -> anyhow::Result<()> {
        (self.0)(messages.to_vec()).await
    }
}

/// Error-sink callback for background failures.
///
/// Background tasks never crash the process: publish and storage failures
/// are reported here and then retried or restarted.
pub type ErrorSink = Arc<dyn Fn(&crate::common::HermesError) + Send + Sync>;

/// A no-op error sink.
pub fn noop_error_sink() -> ErrorSink {
    Arc::new(|_| {})
}

/// Clock injection for timestamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Wall-clock default.
pub fn wall_clock() -> Clock {
    Arc::new(Utc::now)
}
