//! # MongoDB Change-Feed Backend
//!
//! Outbox delivery over change streams: inserts into the primary outbox
//! collection are observed through a resumable, partition-scoped change
//! stream, delivered one document per batch, and acknowledged by persisting
//! the resume token in the consumer-state document.
//!
//! Requires a replica set (change streams do not exist on standalone
//! servers) on a supported server version; older servers fail `start` with
//! `NotSupportedVersion`.

mod auxiliary;
mod config;
mod consumer;
pub mod schema;
mod source;
mod state;

pub use config::{MongoConnectOptions, MongoConnectOptionsProvider, MongoConsumerConfig};
pub use consumer::MongoOutboxConsumer;
pub use state::MongoPositionStore;
