//! Auxiliary polling consumer for the document backend

use crate::common::{
    AuxiliaryConfig, Clock, DeliveredMessage, ErrorSink, HermesError, Publisher, Shutdown,
};
use crate::mongodb::schema::AUX_COLLECTION;
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::FindOptions;
use mongodb::Database;
use std::sync::Arc;
use tracing::{debug, error, info};

pub(crate) struct AuxiliaryConsumer {
    config: AuxiliaryConfig,
    db: Database,
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
        db: Database,
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
            db,
            consumer_name,
            partition_key,
            publisher,
            on_failed_publish,
            on_db_error,
            now,
            shutdown,
        }
    }

    /// Polling loop; an overrunning tick delays the next instead of
    /// stacking a concurrent one.
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
        let collection = self.db.collection::<Document>(AUX_COLLECTION);
        let pending: Vec<Document> = collection
            .find(
                doc! {"consumer_name": &self.consumer_name, "delivered": false},
                FindOptions::builder()
                    .sort(doc! {"added_at": 1})
                    .limit(self.config.batch_size)
                    .build(),
            )
            .await?
            .try_collect()
            .await?;

        if pending.is_empty() {
            return Ok(());
        }
        debug!(count = pending.len(), "auxiliary tick picked up documents");

        for document in pending {
            let position = document
                .get_i64("position")
                .map_err(|e| HermesError::storage(format!("corrupt auxiliary row: {e}")))?;
            let fails_count = document.get_i32("fails_count").unwrap_or(0);
            let envelope = DeliveredMessage {
                position,
                token: position.to_string(),
                message_id: document.get_str("message_id").unwrap_or_default().to_string(),
                message_type: document.get_str("message_type").unwrap_or_default().to_string(),
                partition_key: self.partition_key.clone(),
                redelivery_count: fails_count as u32,
                data: document
                    .get("data")
                    .cloned()
                    .unwrap_or(Bson::Null)
                    .into_relaxed_extjson(),
            };

            match self.publisher.publish(&[envelope]).await {
                Ok(()) => {
                    collection
                        .update_one(
                            doc! {"position": position},
                            doc! {"$set": {
                                "delivered": true,
                                "sent_at": mongodb::bson::DateTime::from_chrono((self.now)()),
                            }},
                            None,
                        )
                        .await?;
                }
                Err(err) => {
                    (self.on_failed_publish)(&HermesError::publish(err));
                    collection
                        .update_one(
                            doc! {"position": position},
                            doc! {"$inc": {"fails_count": 1}},
                            None,
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
