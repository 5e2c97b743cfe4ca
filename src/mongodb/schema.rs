//! Schema bootstrap for the document backend
//!
//! Ensures the outbox collections and indexes exist, allocates monotonic
//! positions from a counters collection, and implements partition mutual
//! exclusion as a leased lock on the consumer-state document.

use crate::common::{HermesError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{FindOneAndUpdateOptions, IndexOptions, ReturnDocument};
use mongodb::{Database, IndexModel};
use std::time::Duration;
use tracing::{debug, info};

/// Primary outbox collection.
pub const OUTBOX_COLLECTION: &str = "hermes_outbox";

/// Secondary (polling) outbox collection.
pub const AUX_COLLECTION: &str = "hermes_outbox_aux";

/// Consumer-state collection.
pub const STATE_COLLECTION: &str = "hermes_consumer_state";

/// Counters collection backing the monotonic position sequence.
pub const COUNTERS_COLLECTION: &str = "hermes_counters";

/// Minimum supported server major version; change streams with
/// `updateLookup` need a 4.x replica set.
const MIN_MAJOR_VERSION: i32 = 4;

/// Create the collections and indexes.
pub async fn migrate(db: &Database, auxiliary: bool) -> Result<()> {
    info!("running outbox migrations");

    let outbox = db.collection::<Document>(OUTBOX_COLLECTION);
    outbox
        .create_index(
            IndexModel::builder()
                .keys(doc! {"partition_key": 1, "position": 1})
                .options(IndexOptions::builder().unique(true).build())
                .build(),
            None,
        )
        .await?;

    let state = db.collection::<Document>(STATE_COLLECTION);
    state
        .create_index(
            IndexModel::builder()
                .keys(doc! {"consumer_name": 1, "partition_key": 1})
                .options(IndexOptions::builder().unique(true).build())
                .build(),
            None,
        )
        .await?;

    if auxiliary {
        let aux = db.collection::<Document>(AUX_COLLECTION);
        aux.create_index(
            IndexModel::builder()
                .keys(doc! {"consumer_name": 1, "delivered": 1, "added_at": 1})
                .build(),
            None,
        )
        .await?;
    }

    Ok(())
}

/// Refuse to run on server versions without supported change-stream
/// semantics.
pub async fn require_supported_version(db: &Database) -> Result<()> {
    let info = db
        .run_command(doc! {"buildInfo": 1}, None)
        .await
        .map_err(HermesError::from)?;
    let major = info
        .get_array("versionArray")
        .ok()
        .and_then(|v| v.first())
        .and_then(|b| b.as_i32())
        .unwrap_or(0);
    if major < MIN_MAJOR_VERSION {
        let version = info.get_str("version").unwrap_or("unknown");
        return Err(HermesError::NotSupportedVersion(version.to_string()));
    }
    Ok(())
}

/// Allocate `count` consecutive positions; returns the first one.
///
/// Aborted host transactions leave gaps in the sequence, like any database
/// sequence would.
pub async fn allocate_positions(db: &Database, sequence: &str, count: i64) -> Result<i64> {
    let counters = db.collection::<Document>(COUNTERS_COLLECTION);
    let updated = counters
        .find_one_and_update(
            doc! {"_id": sequence},
            doc! {"$inc": {"seq": count}},
            FindOneAndUpdateOptions::builder()
                .upsert(true)
                .return_document(ReturnDocument::After)
                .build(),
        )
        .await?
        .ok_or_else(|| HermesError::storage("counter upsert returned no document"))?;
    let end = updated
        .get_i64("seq")
        .map_err(|e| HermesError::storage(format!("corrupt counter document: {e}")))?;
    Ok(end - count + 1)
}

/// Acquire the partition lock on the consumer-state document.
///
/// A live holder makes this fail with `ConsumerAlreadyTaken`; a holder
/// whose lease expired (crashed process) is displaced.
pub async fn acquire_lock(
    db: &Database,
    consumer_name: &str,
    partition_key: &str,
    lease: Duration,
    now: DateTime<Utc>,
) -> Result<()> {
    let state = db.collection::<Document>(STATE_COLLECTION);

    // Make sure the row exists before contending on the lock filter.
    let ensure = state
        .update_one(
            doc! {"consumer_name": consumer_name, "partition_key": partition_key},
            doc! {"$setOnInsert": {
                "consumer_name": consumer_name,
                "partition_key": partition_key,
                "last_acked_token": Bson::Null,
                "redelivery_count": 0i32,
                "locked": false,
                "locked_at": Bson::Null,
                "created_at": mongodb::bson::DateTime::from_chrono(now),
                "updated_at": mongodb::bson::DateTime::from_chrono(now),
            }},
            mongodb::options::UpdateOptions::builder().upsert(true).build(),
        )
        .await;
    if let Err(e) = ensure {
        // A concurrent upsert racing on the unique index is fine.
        if !is_duplicate_key(&e) {
            return Err(e.into());
        }
    }

    let stale_before = now - ChronoDuration::from_std(lease).unwrap_or(ChronoDuration::zero());
    let acquired = state
        .find_one_and_update(
            doc! {
                "consumer_name": consumer_name,
                "partition_key": partition_key,
                "$or": [
                    {"locked": false},
                    {"locked_at": {"$lt": mongodb::bson::DateTime::from_chrono(stale_before)}},
                ],
            },
            doc! {"$set": {
                "locked": true,
                "locked_at": mongodb::bson::DateTime::from_chrono(now),
            }},
            None,
        )
        .await?;

    match acquired {
        Some(_) => {
            debug!("acquired partition lock for {consumer_name}/{partition_key}");
            Ok(())
        }
        None => Err(HermesError::already_taken(format!(
            "{consumer_name}/{partition_key}"
        ))),
    }
}

/// Refresh the lock lease; called periodically while the consumer runs.
pub async fn refresh_lock(
    db: &Database,
    consumer_name: &str,
    partition_key: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    db.collection::<Document>(STATE_COLLECTION)
        .update_one(
            doc! {"consumer_name": consumer_name, "partition_key": partition_key, "locked": true},
            doc! {"$set": {"locked_at": mongodb::bson::DateTime::from_chrono(now)}},
            None,
        )
        .await?;
    Ok(())
}

/// Release the partition lock on stop.
pub async fn release_lock(db: &Database, consumer_name: &str, partition_key: &str) {
    let released = db
        .collection::<Document>(STATE_COLLECTION)
        .update_one(
            doc! {"consumer_name": consumer_name, "partition_key": partition_key},
            doc! {"$set": {"locked": false, "locked_at": Bson::Null}},
            None,
        )
        .await;
    if let Err(e) = released {
        debug!("releasing partition lock failed: {e}");
    }
}

fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};
    match e.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(we)) => we.code == 11000,
        ErrorKind::Command(ce) => ce.code == 11000,
        _ => false,
    }
}
