//! Logical replication protocol messages
//!
//! Frame and message types for PostgreSQL logical replication v1 with the
//! `pgoutput` plugin. Only the messages the outbox cares about carry full
//! bodies; the rest are parsed far enough to skip.

use bytes::Bytes;

/// Top-level frame inside a CopyData payload.
#[derive(Debug, Clone)]
pub enum TopLevelFrame {
    /// `w` - wraps an inner logical message
    XLogData {
        wal_start: u64,
        wal_end: u64,
        timestamp: i64,
        data: Bytes,
    },
    /// `k` - server's current write position plus an optional reply request
    PrimaryKeepalive {
        wal_end: u64,
        timestamp: i64,
        reply_requested: bool,
    },
}

/// Inner logical message.
#[derive(Debug, Clone)]
pub enum ReplicationMessage {
    /// Transaction begin
    Begin(BeginBody),
    /// Transaction commit
    Commit(CommitBody),
    /// Relation (table) definition
    Relation(RelationBody),
    /// Row insert
    Insert(InsertBody),
    /// Parsed enough to skip, never emitted downstream
    Skipped(SkippedKind),
}

/// Logical messages the outbox consumes structurally but does not emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkippedKind {
    Origin,
    Type,
    Update,
    Delete,
    Truncate,
    LogicalMessage,
    StreamStart,
    StreamStop,
    StreamCommit,
    StreamAbort,
}

/// BEGIN message
#[derive(Debug, Clone)]
pub struct BeginBody {
    pub final_lsn: u64,
    pub timestamp: i64,
    pub xid: u32,
}

/// COMMIT message
#[derive(Debug, Clone)]
pub struct CommitBody {
    pub flags: u8,
    pub commit_lsn: u64,
    pub end_lsn: u64,
    pub timestamp: i64,
}

/// RELATION message (table definition)
#[derive(Debug, Clone)]
pub struct RelationBody {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<Column>,
}

/// Column definition within a relation
#[derive(Debug, Clone)]
pub struct Column {
    pub flags: u8,
    pub name: String,
    pub type_id: i32,
    pub type_mode: i32,
}

/// INSERT message
#[derive(Debug, Clone)]
pub struct InsertBody {
    pub relation_id: u32,
    pub tuple: Tuple,
}

/// Row tuple
#[derive(Debug, Clone)]
pub struct Tuple(pub Vec<TupleData>);

/// Column data within a tuple
#[derive(Debug, Clone)]
pub enum TupleData {
    /// NULL value (`n`)
    Null,
    /// Unchanged TOAST value (`u`)
    Toast,
    /// Text representation (`t`)
    Text(Bytes),
    /// Binary representation (`b`); recognized but unused by the outbox
    Binary(Bytes),
}

/// Declares what an outbox column holds, for tuple decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// 64-bit integer (text-encoded on the wire)
    Int8,
    /// Plain text
    Text,
    /// JSON passed through as UTF-8 text
    Json,
}

/// A decoded outbox column value.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Int(i64),
    /// Integer text wider than 64 bits, kept in its textual form
    BigInt(String),
    Text(String),
    Json(serde_json::Value),
}

/// Maps outbox column names to their declared kinds.
///
/// The ingestor resolves decoded tuples against the cached relation schema
/// with this descriptor; columns the descriptor does not name are ignored.
#[derive(Debug, Clone)]
pub struct TupleDescriptor {
    columns: Vec<(String, ColumnKind)>,
}

impl TupleDescriptor {
    pub fn new(columns: Vec<(String, ColumnKind)>) -> Self {
        Self { columns }
    }

    /// Descriptor for the primary outbox table layout.
    pub fn primary_outbox() -> Self {
        Self::new(vec![
            ("position".to_string(), ColumnKind::Int8),
            ("message_id".to_string(), ColumnKind::Text),
            ("message_type".to_string(), ColumnKind::Text),
            ("partition_key".to_string(), ColumnKind::Text),
            ("data".to_string(), ColumnKind::Json),
        ])
    }

    pub fn kind_of(&self, column_name: &str) -> Option<ColumnKind> {
        self.columns
            .iter()
            .find(|(name, _)| name == column_name)
            .map(|(_, kind)| *kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_lookup() {
        let desc = TupleDescriptor::primary_outbox();
        assert_eq!(desc.kind_of("position"), Some(ColumnKind::Int8));
        assert_eq!(desc.kind_of("data"), Some(ColumnKind::Json));
        assert_eq!(desc.kind_of("partition_key"), Some(ColumnKind::Text));
        assert_eq!(desc.kind_of("sent_at"), None);
    }
}
