//! Consumer-state persistence for the document backend

use crate::common::{ConsumerState, HermesError, PositionStore, Result};
use crate::mongodb::schema::STATE_COLLECTION;
use async_trait::async_trait;
use chrono::Utc;
use mongodb::bson::{doc, Document};
use mongodb::change_stream::event::ResumeToken;
use mongodb::Database;

/// Position store over the consumer-state document.
///
/// Tokens are resume tokens serialized as canonical JSON text; they are
/// opaque and not comparable, so monotonicity rests on the queue's ordered
/// ack contract rather than a storage-side guard.
pub struct MongoPositionStore {
    db: Database,
    consumer_name: String,
    partition_key: String,
}

impl MongoPositionStore {
    pub fn new(
        db: Database,
        consumer_name: impl Into<String>,
        partition_key: impl Into<String>,
    ) -> Self {
        Self {
            db,
            consumer_name: consumer_name.into(),
            partition_key: partition_key.into(),
        }
    }

    fn key(&self) -> Document {
        doc! {
            "consumer_name": &self.consumer_name,
            "partition_key": &self.partition_key,
        }
    }

    /// Stored resume token, parsed back into driver form.
    pub async fn resume_token(&self) -> Result<Option<ResumeToken>> {
        let state = self.load().await?;
        match state.last_acked_token {
            None => Ok(None),
            Some(text) => {
                let value: serde_json::Value = serde_json::from_str(&text)
                    .map_err(|e| HermesError::storage(format!("corrupt resume token: {e}")))?;
                let bson = mongodb::bson::to_bson(&value)
                    .map_err(|e| HermesError::storage(format!("corrupt resume token: {e}")))?;
                let token = mongodb::bson::from_bson(bson)
                    .map_err(|e| HermesError::storage(format!("corrupt resume token: {e}")))?;
                Ok(Some(token))
            }
        }
    }
}

#[async_trait]
impl PositionStore for MongoPositionStore {
    async fn load(&self) -> Result<ConsumerState> {
        let collection = self.db.collection::<Document>(STATE_COLLECTION);
        let found = collection.find_one(self.key(), None).await?;

        let document = match found {
            Some(document) => document,
            None => {
                // First load creates the row; the lock fields are managed by
                // the schema module.
                let now = mongodb::bson::DateTime::from_chrono(Utc::now());
                let fresh = doc! {
                    "consumer_name": &self.consumer_name,
                    "partition_key": &self.partition_key,
                    "last_acked_token": mongodb::bson::Bson::Null,
                    "redelivery_count": 0i32,
                    "locked": false,
                    "locked_at": mongodb::bson::Bson::Null,
                    "created_at": now,
                    "updated_at": now,
                };
                collection
                    .update_one(
                        self.key(),
                        doc! {"$setOnInsert": fresh.clone()},
                        mongodb::options::UpdateOptions::builder().upsert(true).build(),
                    )
                    .await?;
                collection
                    .find_one(self.key(), None)
                    .await?
                    .unwrap_or(fresh)
            }
        };

        let chrono_of = |field: &str| {
            document
                .get_datetime(field)
                .map(|dt| dt.to_chrono())
                .unwrap_or_else(|_| Utc::now())
        };

        Ok(ConsumerState {
            consumer_name: self.consumer_name.clone(),
            partition_key: self.partition_key.clone(),
            last_acked_token: document.get_str("last_acked_token").ok().map(String::from),
            redelivery_count: document.get_i32("redelivery_count").unwrap_or(0) as u32,
            created_at: chrono_of("created_at"),
            updated_at: chrono_of("updated_at"),
        })
    }

    async fn ack(&self, token: &str) -> Result<()> {
        self.db
            .collection::<Document>(STATE_COLLECTION)
            .update_one(
                self.key(),
                doc! {"$set": {
                    "last_acked_token": token,
                    "redelivery_count": 0i32,
                    "updated_at": mongodb::bson::DateTime::from_chrono(Utc::now()),
                }},
                None,
            )
            .await?;
        Ok(())
    }

    async fn set_redelivery(&self, count: u32) -> Result<()> {
        self.db
            .collection::<Document>(STATE_COLLECTION)
            .update_one(
                self.key(),
                doc! {"$set": {
                    "redelivery_count": count as i32,
                    "updated_at": mongodb::bson::DateTime::from_chrono(Utc::now()),
                }},
                None,
            )
            .await?;
        Ok(())
    }
}
