//! Consumer-state persistence
//!
//! Tracks, per (consumer-name, partition-key), the last acknowledged source
//! position token and the redelivery counter for the oldest
//! un-acknowledged transaction.

use crate::common::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// One consumer-state row.
///
/// Exactly one row exists per (consumer-name, partition-key); the token
/// only advances monotonically within a partition.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerState {
    pub consumer_name: String,
    pub partition_key: String,
    /// Last acknowledged source position token, if any
    pub last_acked_token: Option<String>,
    /// Attempt count for the oldest un-acknowledged transaction
    pub redelivery_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persistence interface for one (consumer-name, partition-key) pair.
///
/// Implementations are instance-scoped: the key is fixed at construction
/// and every call operates on that single row.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Load the state row, creating it when missing.
    async fn load(&self) -> Result<ConsumerState>;

    /// Advance the acknowledged token and reset the redelivery counter.
    ///
    /// Advancement is monotonic: implementations must not move the token
    /// backwards even when handed a stale value after a reconnect replay.
    async fn ack(&self, token: &str) -> Result<()>;

    /// Persist the redelivery counter before a retry attempt.
    async fn set_redelivery(&self, count: u32) -> Result<()>;
}

/// In-memory position store for tests and wiring experiments.
pub struct MemoryPositionStore {
    consumer_name: String,
    partition_key: String,
    inner: RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    state: Option<ConsumerState>,
    ack_history: Vec<String>,
}

impl MemoryPositionStore {
    pub fn new(consumer_name: impl Into<String>, partition_key: impl Into<String>) -> Self {
        Self {
            consumer_name: consumer_name.into(),
            partition_key: partition_key.into(),
            inner: RwLock::new(MemoryState::default()),
        }
    }

    /// All tokens ever acked, in order (for test assertions).
    pub async fn ack_history(&self) -> Vec<String> {
        self.inner.read().await.ack_history.clone()
    }

    /// Current redelivery counter (for test assertions).
    pub async fn redelivery_count(&self) -> u32 {
        self.inner
            .read()
            .await
            .state
            .as_ref()
            .map(|s| s.redelivery_count)
            .unwrap_or(0)
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn load(&self) -> Result<ConsumerState> {
        let mut inner = self.inner.write().await;
        if inner.state.is_none() {
            let now = Utc::now();
            inner.state = Some(ConsumerState {
                consumer_name: self.consumer_name.clone(),
                partition_key: self.partition_key.clone(),
                last_acked_token: None,
                redelivery_count: 0,
                created_at: now,
                updated_at: now,
            });
        }
        Ok(inner.state.clone().unwrap())
    }

    async fn ack(&self, token: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.ack_history.push(token.to_string());
        if let Some(state) = inner.state.as_mut() {
            state.last_acked_token = Some(token.to_string());
            state.redelivery_count = 0;
            state.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_redelivery(&self, count: u32) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(state) = inner.state.as_mut() {
            state.redelivery_count = count;
            state.updated_at = Utc::now();
        }
        Ok(())
    }
}
