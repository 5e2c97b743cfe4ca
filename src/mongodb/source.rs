//! Change-stream ingestor
//!
//! Observes inserts to the primary outbox collection, scoped to one
//! partition, and emits single-row transaction batches. Document-backend
//! transactions are not reassembled beyond their natural per-insert
//! granularity: each change event is one batch.

use crate::common::{DeliveredMessage, HermesError, Result, Shutdown, TransactionBatch};
use crate::mongodb::schema::OUTBOX_COLLECTION;
use futures::StreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::change_stream::event::{ChangeStreamEvent, ResumeToken};
use mongodb::change_stream::ChangeStream;
use mongodb::options::{ChangeStreamOptions, FullDocumentType};
use mongodb::Database;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Open a change stream over the outbox collection for one partition.
///
/// Resumes from `resume` when present; a resume token the upstream oplog
/// has already rolled past surfaces as `PositionLost`.
pub(crate) async fn open_change_stream(
    db: &Database,
    partition_key: &str,
    resume: Option<ResumeToken>,
) -> Result<ChangeStream<ChangeStreamEvent<Document>>> {
    let pipeline = vec![doc! {
        "$match": {
            "operationType": "insert",
            "fullDocument.partition_key": partition_key,
        }
    }];
    let options = ChangeStreamOptions::builder()
        .full_document(Some(FullDocumentType::UpdateLookup))
        .resume_after(resume)
        .build();

    let stream = db
        .collection::<Document>(OUTBOX_COLLECTION)
        .watch(pipeline, options)
        .await
        .map_err(map_stream_error)?;
    info!(partition = partition_key, "change stream opened");
    Ok(stream)
}

/// Run one change-stream session: decode insert events into single-message
/// batches until shutdown, cursor exhaustion or an error.
pub(crate) async fn run_ingest_session(
    mut stream: ChangeStream<ChangeStreamEvent<Document>>,
    batches: &mpsc::Sender<TransactionBatch>,
    shutdown: &Arc<Shutdown>,
) -> Result<()> {
    loop {
        let event = tokio::select! {
            _ = shutdown.wait() => {
                debug!("change-stream session received shutdown signal");
                return Ok(());
            }
            event = stream.next() => event,
        };

        let event = match event {
            Some(Ok(event)) => event,
            Some(Err(e)) => return Err(map_stream_error(e)),
            None => {
                info!("change stream ended");
                return Ok(());
            }
        };

        let Some(document) = event.full_document else {
            warn!("insert event without fullDocument, skipping");
            continue;
        };

        let batch = decode_event(&document, &event.id)?;
        if batches.send(batch).await.is_err() {
            debug!("batch receiver dropped, ending session");
            return Ok(());
        }
    }
}

/// Build the single-message batch for one insert event.
fn decode_event(document: &Document, token: &ResumeToken) -> Result<TransactionBatch> {
    let position = document
        .get_i64("position")
        .map_err(|e| HermesError::protocol(format!("outbox document missing position: {e}")))?;
    let message_id = document
        .get_str("message_id")
        .map_err(|e| HermesError::protocol(format!("outbox document missing message_id: {e}")))?;
    let message_type = document
        .get_str("message_type")
        .map_err(|e| HermesError::protocol(format!("outbox document missing message_type: {e}")))?;
    let partition_key = document
        .get_str("partition_key")
        .map_err(|e| HermesError::protocol(format!("outbox document missing partition_key: {e}")))?;
    let data = document
        .get("data")
        .cloned()
        .unwrap_or(Bson::Null)
        .into_relaxed_extjson();

    let token_text = serde_json::to_string(token)
        .map_err(|e| HermesError::protocol(format!("unserializable resume token: {e}")))?;

    Ok(TransactionBatch {
        transaction_id: position.to_string(),
        token: token_text.clone(),
        commit_position: position as u64,
        commit_ts: None,
        messages: vec![DeliveredMessage {
            position,
            token: token_text,
            message_id: message_id.to_string(),
            message_type: message_type.to_string(),
            partition_key: partition_key.to_string(),
            redelivery_count: 0,
            data,
        }],
    })
}

/// Map driver errors, surfacing oplog-history loss as `PositionLost`.
fn map_stream_error(e: mongodb::error::Error) -> HermesError {
    use mongodb::error::ErrorKind;
    if let ErrorKind::Command(command) = e.kind.as_ref() {
        // 286 = ChangeStreamHistoryLost: the stored resume token predates
        // the oplog window; restarting without operator action would replay
        // nothing.
        if command.code == 286 {
            return HermesError::position_lost(command.message.clone());
        }
    }
    HermesError::Mongo(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_event() {
        let document = doc! {
            "position": 7i64,
            "message_id": "m7",
            "message_type": "OrderCreated",
            "partition_key": "default",
            "data": {"total": 100},
        };
        let token: ResumeToken =
            mongodb::bson::from_bson(Bson::Document(doc! {"_data": "8263AB"})).unwrap();

        let batch = decode_event(&document, &token).unwrap();
        assert_eq!(batch.commit_position, 7);
        assert_eq!(batch.messages.len(), 1);
        let msg = &batch.messages[0];
        assert_eq!(msg.message_id, "m7");
        assert_eq!(msg.partition_key, "default");
        assert_eq!(msg.data["total"], 100);
        assert!(msg.token.contains("_data"));
    }

    #[test]
    fn test_decode_event_missing_field_is_protocol_error() {
        let document = doc! {
            "position": 7i64,
            "message_type": "OrderCreated",
        };
        let token: ResumeToken =
            mongodb::bson::from_bson(Bson::Document(doc! {"_data": "8263AB"})).unwrap();
        assert!(matches!(
            decode_event(&document, &token),
            Err(HermesError::Protocol(_))
        ));
    }
}
