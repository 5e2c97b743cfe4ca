//! Auxiliary polling consumer for the log backend
//!
//! Delivers from the secondary outbox table without relying on the
//! replication stream. Each tick selects the oldest undelivered rows and
//! pushes them through the same publish callback; rows are never deleted,
//! only flagged delivered or their failure counter incremented.

use crate::common::{Clock, DeliveredMessage, ErrorSink, HermesError, Publisher, Shutdown};
use crate::postgres::config::AuxiliaryConfig;
use crate::postgres::schema::AUX_TABLE;
use std::sync::Arc;
use tokio_postgres::Client;
use tracing::{debug, error, info};

pub(crate) struct AuxiliaryConsumer {
    config: AuxiliaryConfig,
    client: Arc<Client>,
    consumer_name: String,
    partition_key: String,
    publisher: Arc<dyn Publisher>,
    on_failed_publish: ErrorSink,
    on_db_error: ErrorSink,
    now: Clock,
    shutdown: Arc<Shutdown>,
}

impl AuxiliaryConsumer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: AuxiliaryConfig,
        client: Arc<Client>,
        consumer_name: String,
        partition_key: String,
        publisher: Arc<dyn Publisher>,
        on_failed_publish: ErrorSink,
        on_db_error: ErrorSink,
        now: Clock,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self {
            config,
            client,
            consumer_name,
            partition_key,
            publisher,
            on_failed_publish,
            on_db_error,
            now,
            shutdown,
        }
    }

    /// Polling loop. A tick that overruns the interval delays the next one
    /// instead of stacking a second concurrent tick.
    pub(crate) async fn run(self) {
        info!(
            interval = ?self.config.check_interval,
            "auxiliary polling consumer started"
        );
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("auxiliary tick failed: {e}");
                        (self.on_db_error)(&e);
                    }
                }
            }
        }
        info!("auxiliary polling consumer stopped");
    }

    async fn tick(&self) -> crate::common::Result<()> {
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT position, message_id, message_type, data, fails_count
                     FROM {AUX_TABLE}
                     WHERE consumer_name = $1 AND delivered = FALSE
                     ORDER BY added_at ASC
                     LIMIT $2"
                ),
                &[&self.consumer_name, &self.config.batch_size],
            )
            .await?;

        if rows.is_empty() {
            return Ok(());
        }
        debug!(count = rows.len(), "auxiliary tick picked up rows");

        for row in rows {
            let position: i64 = row.get(0);
            let fails_count: i32 = row.get(4);
            let envelope = DeliveredMessage {
                position,
                token: position.to_string(),
                message_id: row.get(1),
                message_type: row.get(2),
                partition_key: self.partition_key.clone(),
                redelivery_count: fails_count as u32,
                data: row.get::<_, serde_json::Value>(3),
            };

            match self.publisher.publish(&[envelope]).await {
                Ok(()) => {
                    self.client
                        .execute(
                            &format!(
                                "UPDATE {AUX_TABLE}
                                 SET delivered = TRUE, sent_at = $2
                                 WHERE position = $1"
                            ),
                            &[&position, &(self.now)()],
                        )
                        .await?;
                }
                Err(err) => {
                    (self.on_failed_publish)(&HermesError::publish(err));
                    self.client
                        .execute(
                            &format!(
                                "UPDATE {AUX_TABLE}
                                 SET fails_count = fails_count + 1
                                 WHERE position = $1"
                            ),
                            &[&position],
                        )
                        .await?;
                    tokio::select! {
                        _ = self.shutdown.wait() => return Ok(()),
                        _ = tokio::time::sleep(self.config.wait_after_failed_publish) => {}
                    }
                }
            }
        }
        Ok(())
    }
}
