//! pgoutput decoder
//!
//! Decodes binary replication frames and pgoutput logical messages. Unknown
//! top-level bytes and unrecognized column formats are protocol errors and
//! fatal to the stream session.

use super::message::*;
use bytes::{Buf, Bytes};
use thiserror::Error;

/// Decoder errors
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("not enough data")]
    NotEnoughData,
    #[error("invalid message type: {0}")]
    InvalidType(u8),
    #[error("UTF8 error: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

fn ensure(buf: &Bytes, n: usize) -> Result<(), DecodeError> {
    if buf.remaining() < n {
        Err(DecodeError::NotEnoughData)
    } else {
        Ok(())
    }
}

/// Decode one top-level frame from a CopyData payload.
pub fn decode_frame(data: &mut Bytes) -> Result<TopLevelFrame, DecodeError> {
    ensure(data, 1)?;
    let frame_type = data.get_u8();
    match frame_type {
        b'w' => {
            ensure(data, 24)?;
            let wal_start = data.get_u64();
            let wal_end = data.get_u64();
            let timestamp = data.get_i64();
            Ok(TopLevelFrame::XLogData {
                wal_start,
                wal_end,
                timestamp,
                data: data.clone(),
            })
        }
        b'k' => {
            ensure(data, 17)?;
            let wal_end = data.get_u64();
            let timestamp = data.get_i64();
            let reply_requested = data.get_u8() == 1;
            Ok(TopLevelFrame::PrimaryKeepalive {
                wal_end,
                timestamp,
                reply_requested,
            })
        }
        t => Err(DecodeError::InvalidType(t)),
    }
}

/// pgoutput logical message decoder
pub struct PgOutputDecoder;

impl PgOutputDecoder {
    /// Decode a pgoutput message
    pub fn decode(data: &mut Bytes) -> Result<ReplicationMessage, DecodeError> {
        ensure(data, 1)?;
        let msg_type = data.get_u8();

        match msg_type {
            b'B' => Self::decode_begin(data).map(ReplicationMessage::Begin),
            b'C' => Self::decode_commit(data).map(ReplicationMessage::Commit),
            b'R' => Self::decode_relation(data).map(ReplicationMessage::Relation),
            b'I' => Self::decode_insert(data).map(ReplicationMessage::Insert),
            b'O' => Self::skip_origin(data).map(|_| ReplicationMessage::Skipped(SkippedKind::Origin)),
            b'Y' => Self::skip_type(data).map(|_| ReplicationMessage::Skipped(SkippedKind::Type)),
            b'U' => Self::skip_update(data).map(|_| ReplicationMessage::Skipped(SkippedKind::Update)),
            b'D' => Self::skip_delete(data).map(|_| ReplicationMessage::Skipped(SkippedKind::Delete)),
            b'T' => {
                Self::skip_truncate(data).map(|_| ReplicationMessage::Skipped(SkippedKind::Truncate))
            }
            b'M' => Ok(ReplicationMessage::Skipped(SkippedKind::LogicalMessage)),
            b'S' => Ok(ReplicationMessage::Skipped(SkippedKind::StreamStart)),
            b'E' => Ok(ReplicationMessage::Skipped(SkippedKind::StreamStop)),
            b'c' => Ok(ReplicationMessage::Skipped(SkippedKind::StreamCommit)),
            b'A' => Ok(ReplicationMessage::Skipped(SkippedKind::StreamAbort)),
            t => Err(DecodeError::InvalidType(t)),
        }
    }

    fn decode_begin(buf: &mut Bytes) -> Result<BeginBody, DecodeError> {
        ensure(buf, 20)?;
        let final_lsn = buf.get_u64();
        let timestamp = buf.get_i64();
        let xid = buf.get_u32();
        Ok(BeginBody {
            final_lsn,
            timestamp,
            xid,
        })
    }

    fn decode_commit(buf: &mut Bytes) -> Result<CommitBody, DecodeError> {
        ensure(buf, 25)?;
        let flags = buf.get_u8();
        let commit_lsn = buf.get_u64();
        let end_lsn = buf.get_u64();
        let timestamp = buf.get_i64();
        Ok(CommitBody {
            flags,
            commit_lsn,
            end_lsn,
            timestamp,
        })
    }

    fn decode_relation(buf: &mut Bytes) -> Result<RelationBody, DecodeError> {
        ensure(buf, 4)?;
        let id = buf.get_u32();
        let namespace = read_string(buf)?;
        let name = read_string(buf)?;
        ensure(buf, 3)?;
        let replica_identity = buf.get_u8();
        let num_columns = buf.get_u16();

        let mut columns = Vec::with_capacity(num_columns as usize);
        for _ in 0..num_columns {
            ensure(buf, 1)?;
            let flags = buf.get_u8();
            let col_name = read_string(buf)?;
            ensure(buf, 8)?;
            let type_id = buf.get_i32();
            let type_mode = buf.get_i32();
            columns.push(Column {
                flags,
                name: col_name,
                type_id,
                type_mode,
            });
        }

        Ok(RelationBody {
            id,
            namespace,
            name,
            replica_identity,
            columns,
        })
    }

    fn decode_insert(buf: &mut Bytes) -> Result<InsertBody, DecodeError> {
        ensure(buf, 5)?;
        let relation_id = buf.get_u32();
        let char_n = buf.get_u8();
        if char_n != b'N' {
            return Err(DecodeError::Protocol("expected N for new tuple".into()));
        }
        let tuple = decode_tuple(buf)?;
        Ok(InsertBody { relation_id, tuple })
    }

    fn skip_origin(buf: &mut Bytes) -> Result<(), DecodeError> {
        ensure(buf, 8)?;
        let _commit_lsn = buf.get_u64();
        let _name = read_string(buf)?;
        Ok(())
    }

    fn skip_type(buf: &mut Bytes) -> Result<(), DecodeError> {
        ensure(buf, 4)?;
        let _id = buf.get_u32();
        let _namespace = read_string(buf)?;
        let _name = read_string(buf)?;
        Ok(())
    }

    fn skip_update(buf: &mut Bytes) -> Result<(), DecodeError> {
        ensure(buf, 5)?;
        let _relation_id = buf.get_u32();
        let msg_type = buf.get_u8();
        match msg_type {
            b'K' | b'O' => {
                decode_tuple(buf)?;
                ensure(buf, 1)?;
                let char_n = buf.get_u8();
                if char_n != b'N' {
                    return Err(DecodeError::Protocol("expected N after old tuple".into()));
                }
                decode_tuple(buf)?;
            }
            b'N' => {
                decode_tuple(buf)?;
            }
            t => return Err(DecodeError::InvalidType(t)),
        }
        Ok(())
    }

    fn skip_delete(buf: &mut Bytes) -> Result<(), DecodeError> {
        ensure(buf, 5)?;
        let _relation_id = buf.get_u32();
        let msg_type = buf.get_u8();
        match msg_type {
            b'K' | b'O' => {
                decode_tuple(buf)?;
            }
            t => return Err(DecodeError::InvalidType(t)),
        }
        Ok(())
    }

    fn skip_truncate(buf: &mut Bytes) -> Result<(), DecodeError> {
        ensure(buf, 5)?;
        let num_rels = buf.get_u32();
        let _options = buf.get_u8();
        ensure(buf, num_rels as usize * 4)?;
        for _ in 0..num_rels {
            buf.get_u32();
        }
        Ok(())
    }
}

fn read_string(buf: &mut Bytes) -> Result<String, DecodeError> {
    if !buf.has_remaining() {
        return Err(DecodeError::NotEnoughData);
    }
    let n = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::NotEnoughData)?;
    let s_bytes = buf.copy_to_bytes(n);
    buf.advance(1); // skip null
    Ok(std::str::from_utf8(&s_bytes)?.to_string())
}

/// Decode a tuple: per-column format byte, then for `t`/`b` a big-endian
/// 32-bit length and that many bytes.
pub fn decode_tuple(buf: &mut Bytes) -> Result<Tuple, DecodeError> {
    ensure(buf, 2)?;
    let num_cols = buf.get_u16();
    let mut columns = Vec::with_capacity(num_cols as usize);

    for _ in 0..num_cols {
        ensure(buf, 1)?;
        let type_code = buf.get_u8();
        let data = match type_code {
            b'n' => TupleData::Null,
            b'u' => TupleData::Toast,
            b't' => {
                ensure(buf, 4)?;
                let len = buf.get_u32() as usize;
                ensure(buf, len)?;
                TupleData::Text(buf.copy_to_bytes(len))
            }
            b'b' => {
                ensure(buf, 4)?;
                let len = buf.get_u32() as usize;
                ensure(buf, len)?;
                TupleData::Binary(buf.copy_to_bytes(len))
            }
            t => return Err(DecodeError::InvalidType(t)),
        };
        columns.push(data);
    }

    Ok(Tuple(columns))
}

/// Decode a single tuple column against its declared kind.
///
/// Integer texts up to 64 bits parse as `Int`; wider integer texts are
/// promoted to `BigInt` rather than lost.
pub fn decode_column_value(
    data: &TupleData,
    kind: ColumnKind,
) -> Result<ColumnValue, DecodeError> {
    let text = match data {
        TupleData::Null => return Ok(ColumnValue::Null),
        TupleData::Toast => {
            return Err(DecodeError::Protocol(
                "unexpected TOAST value in outbox column".into(),
            ))
        }
        TupleData::Binary(_) => {
            return Err(DecodeError::Protocol(
                "binary column format not used by the outbox".into(),
            ))
        }
        TupleData::Text(bytes) => std::str::from_utf8(bytes)?,
    };

    match kind {
        ColumnKind::Int8 => match text.parse::<i64>() {
            Ok(n) => Ok(ColumnValue::Int(n)),
            Err(_) if text.chars().all(|c| c.is_ascii_digit() || c == '-') && !text.is_empty() => {
                Ok(ColumnValue::BigInt(text.to_string()))
            }
            Err(_) => Err(DecodeError::Protocol(format!(
                "invalid integer column value: {text:?}"
            ))),
        },
        ColumnKind::Text => Ok(ColumnValue::Text(text.to_string())),
        ColumnKind::Json => {
            let value = serde_json::from_str(text)
                .map_err(|e| DecodeError::Protocol(format!("invalid JSON column: {e}")))?;
            Ok(ColumnValue::Json(value))
        }
    }
}
