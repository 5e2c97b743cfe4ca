//! Consumer-state persistence for the log backend

use crate::common::{ConsumerState, HermesError, PositionStore, Result};
use crate::postgres::protocol::Lsn;
use crate::postgres::schema::STATE_TABLE;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_postgres::Client;

/// Position store over the `hermes_consumer_state` row for one
/// (consumer-name, partition-key) pair.
///
/// Tokens are LSNs in `HI/LO` text form; the monotonic-advance guard
/// compares them as `pg_lsn` so a stale ack after a reconnect replay can
/// never move the row backwards.
pub struct PgPositionStore {
    client: Arc<Client>,
    consumer_name: String,
    partition_key: String,
}

impl PgPositionStore {
    pub fn new(
        client: Arc<Client>,
        consumer_name: impl Into<String>,
        partition_key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            consumer_name: consumer_name.into(),
            partition_key: partition_key.into(),
        }
    }

    /// Last acked token parsed as an LSN, for stream resumption.
    pub async fn last_acked_lsn(&self) -> Result<Option<Lsn>> {
        let state = self.load().await?;
        match state.last_acked_token {
            None => Ok(None),
            Some(token) => token
                .parse::<Lsn>()
                .map(Some)
                .map_err(|e| HermesError::storage(format!("corrupt acked token: {e}"))),
        }
    }
}

#[async_trait]
impl PositionStore for PgPositionStore {
    async fn load(&self) -> Result<ConsumerState> {
        self.client
            .execute(
                &format!(
                    "INSERT INTO {STATE_TABLE} (consumer_name, partition_key)
                     VALUES ($1, $2)
                     ON CONFLICT (consumer_name, partition_key) DO NOTHING"
                ),
                &[&self.consumer_name, &self.partition_key],
            )
            .await?;

        let row = self
            .client
            .query_one(
                &format!(
                    "SELECT last_acked_position, redelivery_count, created_at, updated_at
                     FROM {STATE_TABLE}
                     WHERE consumer_name = $1 AND partition_key = $2"
                ),
                &[&self.consumer_name, &self.partition_key],
            )
            .await?;

        Ok(ConsumerState {
            consumer_name: self.consumer_name.clone(),
            partition_key: self.partition_key.clone(),
            last_acked_token: row.get(0),
            redelivery_count: row.get::<_, i32>(1) as u32,
            created_at: row.get(2),
            updated_at: row.get(3),
        })
    }

    async fn ack(&self, token: &str) -> Result<()> {
        self.client
            .execute(
                &format!(
                    "UPDATE {STATE_TABLE}
                     SET last_acked_position = $3,
                         redelivery_count = 0,
                         updated_at = now()
                     WHERE consumer_name = $1 AND partition_key = $2
                       AND (last_acked_position IS NULL
                            OR last_acked_position::pg_lsn <= $3::pg_lsn)"
                ),
                &[&self.consumer_name, &self.partition_key, &token],
            )
            .await?;
        Ok(())
    }

    async fn set_redelivery(&self, count: u32) -> Result<()> {
        self.client
            .execute(
                &format!(
                    "UPDATE {STATE_TABLE}
                     SET redelivery_count = $3, updated_at = now()
                     WHERE consumer_name = $1 AND partition_key = $2"
                ),
                &[&self.consumer_name, &self.partition_key, &(count as i32)],
            )
            .await?;
        Ok(())
    }
}
