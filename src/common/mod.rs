//! # Common Outbox Types and Traits
//!
//! Backend-agnostic core shared by the log-streaming and change-feed
//! backends:
//!
//! - [`OutboxMessage`] / [`DeliveredMessage`] / [`TransactionBatch`] - the
//!   envelope lifecycle
//! - [`Publisher`] - the user publish callback contract
//! - [`PublishingQueue`] - serialized and pipelined delivery
//! - [`PositionStore`] / [`ConsumerState`] - acknowledged-position rows
//! - [`StatusCell`] / [`StopHandle`] / [`Shutdown`] - lifecycle plumbing
//! - [`ExponentialBackoff`] - reconnect pacing
//! - [`HermesError`] - the error taxonomy

mod backoff;
mod config;
mod error;
mod lifecycle;
mod message;
pub mod pipeline;
mod publisher;
mod queue;
pub mod signal;
mod state;

pub use backoff::ExponentialBackoff;
pub use config::{AuxiliaryConfig, DEFAULT_PARTITION_KEY};
pub use error::{ErrorCategory, HermesError, Result};
pub use lifecycle::{ConsumerStatus, Shutdown, StatusCell, StopHandle};
pub use message::{DeliveredMessage, OutboxMessage, TransactionBatch};
pub use publisher::{noop_error_sink, wall_clock, Clock, ErrorSink, FnPublisher, Publisher};
pub use queue::{build_queue, AckSink, PublishingQueue, QueueSettings};
pub use state::{ConsumerState, MemoryPositionStore, PositionStore};
