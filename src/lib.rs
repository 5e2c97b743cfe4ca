//! # hermes-outbox - Transactional Outbox Runtime
//!
//! Messages enqueued inside an application's database transaction are
//! delivered at-least-once to a publish callback, with the enqueue atomic
//! with the business write.
//!
//! ## Backends
//!
//! - `postgres` - log-streaming backend over PostgreSQL logical replication
//!   (`pgoutput`, protocol v1)
//! - `mongodb` - change-feed backend over MongoDB change streams
//!
//! Each backend also provides a polling secondary outbox (`send`) for
//! non-critical traffic.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   enqueue(tx)   ┌─────────────────────────────┐
//! │  host app    ├────────────────►│ primary outbox table/coll.  │
//! └──────────────┘                 └──────────────┬──────────────┘
//!                                                 │ WAL / change stream
//!                                                 ▼
//!                                  ┌─────────────────────────────┐
//!                                  │  ingestor (reader task)     │
//!                                  │  frames → TransactionBatch  │
//!                                  └──────────────┬──────────────┘
//!                                                 │ bounded channel
//!                                                 ▼
//!                                  ┌─────────────────────────────┐
//!                                  │  publishing queue           │
//!                                  │  serialized │ pipelined     │
//!                                  └──────┬───────────┬──────────┘
//!                                 publish │           │ ack (commit order)
//!                                         ▼           ▼
//!                                  user callback   consumer-state row
//! ```
//!
//! ## Delivery contract
//!
//! At-least-once, ordered per partition: the publish callback must be
//! tolerant of duplicate invocations on the same `message_id`. A callback
//! that returns `Ok` marks the batch delivered; one that returns `Err` has
//! the batch retried after `wait_after_failed_publish`, with the redelivery
//! counter persisted before every attempt.

// Common module - always available
pub mod common;

// Re-export common types at crate root
pub use common::{
    build_queue, noop_error_sink, wall_clock, AckSink, AuxiliaryConfig, Clock, ConsumerState,
    ConsumerStatus, DeliveredMessage, ErrorCategory, ErrorSink, ExponentialBackoff, FnPublisher,
    HermesError, MemoryPositionStore, OutboxMessage, PositionStore, Publisher, PublishingQueue,
    QueueSettings, Result, Shutdown, StatusCell, StopHandle, TransactionBatch,
    DEFAULT_PARTITION_KEY,
};

// PostgreSQL log-streaming backend - feature-gated
#[cfg(feature = "postgres")]
pub mod postgres;

// MongoDB change-feed backend - feature-gated
#[cfg(feature = "mongodb")]
pub mod mongodb;
