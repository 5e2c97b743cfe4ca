//! Logical replication wire protocol
//!
//! Client, frame/message model, binary decoder and LSN arithmetic for
//! PostgreSQL logical replication v1 with the `pgoutput` plugin.

mod client;
mod decoder;
mod lsn;
mod message;

pub use client::{ReplicationClient, ReplicationStream, ServerError};
pub use decoder::{decode_column_value, decode_frame, decode_tuple, DecodeError, PgOutputDecoder};
pub use lsn::{Lsn, ParseLsnError};
pub use message::{
    BeginBody, Column, ColumnKind, ColumnValue, CommitBody, InsertBody, RelationBody,
    ReplicationMessage, SkippedKind, TopLevelFrame, Tuple, TupleData, TupleDescriptor,
};
