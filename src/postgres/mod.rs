//! # PostgreSQL Log-Streaming Backend
//!
//! Outbox delivery over logical replication: the primary outbox table is a
//! publication member; a per-partition `pgoutput` slot streams committed
//! rows back to the consumer, which publishes them and acknowledges the
//! position with standby status updates.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> hermes_outbox::Result<()> {
//! use hermes_outbox::postgres::{PgConnectOptions, PostgresConsumerConfig, PostgresOutboxConsumer};
//! use hermes_outbox::{DeliveredMessage, FnPublisher, OutboxMessage};
//! use std::sync::Arc;
//!
//! let config = PostgresConsumerConfig::new(
//!     "orders",
//!     Arc::new(|| PgConnectOptions::from_url("postgres://localhost/shop").unwrap()),
//!     Arc::new(FnPublisher(|batch: Vec<DeliveredMessage>| async move {
//!         for message in &batch {
//!             println!("delivering {}", message.message_id);
//!         }
//!         Ok::<_, anyhow::Error>(())
//!     })),
//! );
//!
//! let mut consumer = PostgresOutboxConsumer::new(config);
//! let stop = consumer.start().await?;
//!
//! consumer
//!     .enqueue(
//!         &[OutboxMessage::new("m1", "OrderCreated", serde_json::json!({"total": 100}))],
//!         None,
//!     )
//!     .await?;
//!
//! stop.stop().await?;
//! # Ok(())
//! # }
//! ```

mod auxiliary;
mod config;
mod consumer;
pub mod protocol;
pub mod schema;
mod source;
mod state;

pub use config::{
    AuxiliaryConfig, ConnectOptionsProvider, PgConnectOptions, PostgresConsumerConfig,
    DEFAULT_PARTITION_KEY,
};
pub use consumer::PostgresOutboxConsumer;
pub use state::PgPositionStore;
