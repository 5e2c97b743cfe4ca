//! Replication ingestor
//!
//! Turns the logical replication byte stream into committed transaction
//! batches and streams position acknowledgements back to the server.
//!
//! One call to [`run_ingest_session`] is one live stream session: it owns
//! the relation cache and the open-transaction buffer, emits each batch
//! exactly once, and ends on shutdown, CopyDone or the first error. The
//! supervisor restarts sessions from the last acknowledged position, so
//! duplicate emission across sessions is expected and tolerated downstream.

use crate::common::{DeliveredMessage, HermesError, Result, Shutdown, TransactionBatch};
use crate::postgres::config::PgConnectOptions;
use crate::postgres::protocol::{
    decode_column_value, decode_frame, ColumnValue, CommitBody, Lsn, PgOutputDecoder, RelationBody,
    ReplicationClient, ReplicationMessage, ServerError, TopLevelFrame, Tuple, TupleDescriptor,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Keepalive cadence: a status update goes out at least this often.
pub(crate) const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Static inputs of one ingest session.
pub(crate) struct IngestorSettings {
    pub slot: String,
    pub publication: String,
    pub partition_key: String,
    pub descriptor: TupleDescriptor,
}

/// A transaction being assembled between Begin and Commit.
struct OpenTransaction {
    xid: u32,
    commit_lsn: Lsn,
    commit_ts: i64,
    rows: Vec<DeliveredMessage>,
}

/// Open a replication connection and enter CopyBoth mode on the slot.
///
/// A slot held by another live walsender surfaces here as
/// `ConsumerAlreadyTaken` - the server's native mutual-exclusion signal.
pub(crate) async fn open_stream(
    options: &PgConnectOptions,
    settings: &IngestorSettings,
    start_lsn: Lsn,
) -> Result<crate::postgres::protocol::ReplicationStream> {
    let client = ReplicationClient::connect(options)
        .await
        .map_err(map_wire_error)?;
    let stream = client
        .start_replication(&settings.slot, start_lsn, &settings.publication)
        .await
        .map_err(map_wire_error)?;
    info!(
        slot = %settings.slot,
        start = %start_lsn,
        "replication stream session started"
    );
    Ok(stream)
}

/// Run one replication stream session over an established stream.
///
/// Emits committed batches into `batches` (suspending when the channel is
/// full, which stalls upstream acknowledgement - the backpressure signal)
/// and reports `written = flushed = applied = *acked.borrow()` whenever the
/// server requests a reply or the heartbeat cadence elapses.
pub(crate) async fn run_ingest_session(
    mut stream: crate::postgres::protocol::ReplicationStream,
    settings: &IngestorSettings,
    batches: &mpsc::Sender<TransactionBatch>,
    acked: &watch::Receiver<Lsn>,
    shutdown: &Arc<Shutdown>,
) -> Result<()> {
    let mut relations: HashMap<u32, RelationBody> = HashMap::new();
    let mut open_tx: Option<OpenTransaction> = None;
    let mut last_status = tokio::time::Instant::now();

    loop {
        // At least one status update per heartbeat interval, with or
        // without traffic.
        if last_status.elapsed() >= HEARTBEAT_INTERVAL {
            let acked_lsn = *acked.borrow();
            stream
                .send_status_update(acked_lsn, false)
                .await
                .map_err(map_wire_error)?;
            last_status = tokio::time::Instant::now();
        }

        let frame_bytes = tokio::select! {
            _ = shutdown.wait() => {
                debug!("ingest session received shutdown signal");
                return Ok(());
            }
            read = tokio::time::timeout(HEARTBEAT_INTERVAL, stream.next_message()) => {
                match read {
                    Ok(result) => result.map_err(map_wire_error)?,
                    Err(_) => continue,
                }
            }
        };

        let mut bytes = match frame_bytes {
            Some(bytes) => bytes,
            None => {
                if let Some(tx) = open_tx.take() {
                    warn!(
                        xid = tx.xid,
                        buffered = tx.rows.len(),
                        "stream ended mid-transaction, dropping uncommitted rows"
                    );
                }
                info!("replication stream ended");
                return Ok(());
            }
        };

        match decode_frame(&mut bytes).map_err(|e| HermesError::protocol(e.to_string()))? {
            TopLevelFrame::PrimaryKeepalive {
                wal_end,
                reply_requested,
                ..
            } => {
                debug!(wal_end, reply_requested, "keepalive");
                if reply_requested {
                    let acked_lsn = *acked.borrow();
                    stream
                        .send_status_update(acked_lsn, false)
                        .await
                        .map_err(map_wire_error)?;
                    last_status = tokio::time::Instant::now();
                }
            }
            TopLevelFrame::XLogData { mut data, .. } => {
                let message = PgOutputDecoder::decode(&mut data)
                    .map_err(|e| HermesError::protocol(e.to_string()))?;
                match message {
                    ReplicationMessage::Begin(begin) => {
                        open_tx = Some(OpenTransaction {
                            xid: begin.xid,
                            commit_lsn: Lsn(begin.final_lsn),
                            commit_ts: begin.timestamp,
                            rows: Vec::new(),
                        });
                    }
                    ReplicationMessage::Relation(rel) => {
                        debug!(relation = %rel.name, id = rel.id, "caching relation schema");
                        relations.insert(rel.id, rel);
                    }
                    ReplicationMessage::Insert(ins) => {
                        let Some(tx) = open_tx.as_mut() else {
                            return Err(HermesError::protocol("insert outside a transaction"));
                        };
                        let Some(rel) = relations.get(&ins.relation_id) else {
                            return Err(HermesError::protocol(format!(
                                "insert for unknown relation {}",
                                ins.relation_id
                            )));
                        };
                        if let Some(row) = decode_outbox_row(
                            &ins.tuple,
                            rel,
                            &settings.descriptor,
                            &tx.commit_lsn.to_string(),
                        )? {
                            if row.partition_key == settings.partition_key {
                                tx.rows.push(row);
                            }
                        }
                    }
                    ReplicationMessage::Commit(commit) => {
                        if let Some(tx) = open_tx.take() {
                            if let Some(batch) = close_transaction(tx, &commit) {
                                if batches.send(batch).await.is_err() {
                                    debug!("batch receiver dropped, ending session");
                                    return Ok(());
                                }
                            }
                        }
                    }
                    ReplicationMessage::Skipped(kind) => {
                        debug!(?kind, "skipping logical message");
                    }
                }
            }
        }
    }
}

/// Assemble the emitted batch for a committed transaction.
///
/// Transactions with no rows for this partition close silently; their
/// position still advances via later acks of batches that do match.
fn close_transaction(tx: OpenTransaction, commit: &CommitBody) -> Option<TransactionBatch> {
    if tx.rows.is_empty() {
        return None;
    }
    let end = Lsn(commit.end_lsn);
    let mut messages = tx.rows;
    for msg in &mut messages {
        msg.token = end.to_string();
    }
    Some(TransactionBatch {
        transaction_id: tx.xid.to_string(),
        token: end.to_string(),
        commit_position: end.0,
        commit_ts: Some(tx.commit_ts),
        messages,
    })
}

/// Decode one outbox tuple into a delivered envelope.
///
/// Rows from relations whose columns don't match the descriptor decode to
/// `None` (foreign tables in the same publication are not our concern);
/// rows from the outbox with corrupt values are protocol errors.
fn decode_outbox_row(
    tuple: &Tuple,
    relation: &RelationBody,
    descriptor: &TupleDescriptor,
    commit_token: &str,
) -> Result<Option<DeliveredMessage>> {
    let mut position: Option<i64> = None;
    let mut message_id: Option<String> = None;
    let mut message_type: Option<String> = None;
    let mut partition_key: Option<String> = None;
    let mut data: Option<serde_json::Value> = None;

    for (idx, column) in relation.columns.iter().enumerate() {
        let Some(kind) = descriptor.kind_of(&column.name) else {
            continue;
        };
        let Some(tuple_data) = tuple.0.get(idx) else {
            return Err(HermesError::protocol(format!(
                "tuple is missing column {} declared by relation {}",
                column.name, relation.name
            )));
        };
        let value = decode_column_value(tuple_data, kind)
            .map_err(|e| HermesError::protocol(e.to_string()))?;
        match (column.name.as_str(), value) {
            ("position", ColumnValue::Int(v)) => position = Some(v),
            ("position", ColumnValue::BigInt(v)) => {
                return Err(HermesError::protocol(format!(
                    "outbox position overflows 64 bits: {v}"
                )))
            }
            ("message_id", ColumnValue::Text(v)) => message_id = Some(v),
            ("message_type", ColumnValue::Text(v)) => message_type = Some(v),
            ("partition_key", ColumnValue::Text(v)) => partition_key = Some(v),
            ("data", ColumnValue::Json(v)) => data = Some(v),
            (name, ColumnValue::Null) => {
                return Err(HermesError::protocol(format!(
                    "outbox column {name} is unexpectedly NULL"
                )))
            }
            _ => {}
        }
    }

    match (position, message_id, message_type, partition_key, data) {
        (Some(position), Some(message_id), Some(message_type), Some(partition_key), Some(data)) => {
            Ok(Some(DeliveredMessage {
                position,
                token: commit_token.to_string(),
                message_id,
                message_type,
                partition_key,
                redelivery_count: 0,
                data,
            }))
        }
        _ => Ok(None),
    }
}

/// Map wire-client errors into the crate taxonomy.
fn map_wire_error(err: anyhow::Error) -> HermesError {
    if let Some(server) = err.downcast_ref::<ServerError>() {
        if server.is_object_in_use() {
            return HermesError::already_taken(server.message.clone());
        }
        return HermesError::storage(server.to_string());
    }
    match err.downcast::<std::io::Error>() {
        Ok(io) => {
            if io.kind() == std::io::ErrorKind::UnexpectedEof {
                HermesError::ConnectionClosed
            } else {
                HermesError::Io(io)
            }
        }
        Err(other) => HermesError::storage(other.to_string()),
    }
}

/// The column descriptor for the shipped outbox layout.
pub(crate) fn outbox_descriptor() -> TupleDescriptor {
    TupleDescriptor::primary_outbox()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postgres::protocol::Column;
    use bytes::Bytes;

    fn outbox_relation() -> RelationBody {
        let col = |name: &str, type_id: i32| Column {
            flags: 0,
            name: name.to_string(),
            type_id,
            type_mode: -1,
        };
        RelationBody {
            id: 16385,
            namespace: "public".to_string(),
            name: "hermes_outbox".to_string(),
            replica_identity: b'd',
            columns: vec![
                col("position", 20),
                col("message_id", 25),
                col("message_type", 25),
                col("partition_key", 25),
                col("data", 3802),
                col("sent_at", 1184),
            ],
        }
    }

    fn text(v: &str) -> crate::postgres::protocol::TupleData {
        crate::postgres::protocol::TupleData::Text(Bytes::copy_from_slice(v.as_bytes()))
    }

    fn outbox_tuple(position: &str, id: &str, partition: &str) -> Tuple {
        Tuple(vec![
            text(position),
            text(id),
            text("OrderCreated"),
            text(partition),
            text(r#"{"total":100}"#),
            crate::postgres::protocol::TupleData::Null,
        ])
    }

    #[test]
    fn test_decode_outbox_row() {
        let row = decode_outbox_row(
            &outbox_tuple("7", "m1", "default"),
            &outbox_relation(),
            &outbox_descriptor(),
            "0/1A2B",
        )
        .unwrap()
        .expect("row should decode");

        assert_eq!(row.position, 7);
        assert_eq!(row.message_id, "m1");
        assert_eq!(row.message_type, "OrderCreated");
        assert_eq!(row.partition_key, "default");
        assert_eq!(row.token, "0/1A2B");
        assert_eq!(row.redelivery_count, 0);
        assert_eq!(row.data["total"], 100);
    }

    #[test]
    fn test_decode_outbox_row_null_column_is_protocol_error() {
        let tuple = Tuple(vec![
            crate::postgres::protocol::TupleData::Null,
            text("m1"),
            text("T"),
            text("default"),
            text("{}"),
            crate::postgres::protocol::TupleData::Null,
        ]);
        assert!(matches!(
            decode_outbox_row(&tuple, &outbox_relation(), &outbox_descriptor(), "0/1"),
            Err(HermesError::Protocol(_))
        ));
    }

    #[test]
    fn test_decode_foreign_relation_is_ignored() {
        let rel = RelationBody {
            id: 999,
            namespace: "public".to_string(),
            name: "users".to_string(),
            replica_identity: b'd',
            columns: vec![Column {
                flags: 0,
                name: "id".to_string(),
                type_id: 20,
                type_mode: -1,
            }],
        };
        let tuple = Tuple(vec![text("1")]);
        let row = decode_outbox_row(&tuple, &rel, &outbox_descriptor(), "0/1").unwrap();
        assert!(row.is_none());
    }

    #[test]
    fn test_close_transaction_rewrites_tokens() {
        let tx = OpenTransaction {
            xid: 742,
            commit_lsn: Lsn(0x1A00),
            commit_ts: 5,
            rows: vec![DeliveredMessage {
                position: 1,
                token: "0/1A00".to_string(),
                message_id: "m1".to_string(),
                message_type: "T".to_string(),
                partition_key: "default".to_string(),
                redelivery_count: 0,
                data: serde_json::json!({}),
            }],
        };
        let commit = CommitBody {
            flags: 0,
            commit_lsn: 0x1A00,
            end_lsn: 0x1B00,
            timestamp: 5,
        };
        let batch = close_transaction(tx, &commit).expect("non-empty batch");
        assert_eq!(batch.transaction_id, "742");
        assert_eq!(batch.token, "0/1B00");
        assert_eq!(batch.commit_position, 0x1B00);
        assert_eq!(batch.messages[0].token, "0/1B00");
    }

    #[test]
    fn test_close_empty_transaction_emits_nothing() {
        let tx = OpenTransaction {
            xid: 1,
            commit_lsn: Lsn(0x10),
            commit_ts: 0,
            rows: Vec::new(),
        };
        let commit = CommitBody {
            flags: 0,
            commit_lsn: 0x10,
            end_lsn: 0x20,
            timestamp: 0,
        };
        assert!(close_transaction(tx, &commit).is_none());
    }
}
