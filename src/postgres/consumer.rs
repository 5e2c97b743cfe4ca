//! # Log-Backend Outbox Consumer
//!
//! One consumer owns one (consumer-name, partition-key) pair: it runs the
//! migrations, acquires the replication slot, wires the ingestor into the
//! publishing queue and surfaces the `enqueue`/`send` APIs.
//!
//! ## Task model
//!
//! `start` spawns three concurrent activities plus an optional auxiliary
//! poller:
//!
//! - a reader task decoding the replication stream into batches
//! - a publisher task feeding batches into the publishing queue
//! - the heartbeat lives inside the reader's frame loop (status updates on
//!   keepalive requests and on a 10 s cadence)
//!
//! They communicate through a bounded channel; `stop` resolves a
//! cancellation signal watched by all of them.

use crate::common::pipeline::{ingest_channel, run_delivery_loop};
use crate::common::{
    build_queue, AckSink, Clock, ConsumerStatus, ExponentialBackoff, HermesError, OutboxMessage,
    PositionStore, Result, Shutdown, StatusCell, StopHandle, TransactionBatch,
};
use crate::postgres::auxiliary::AuxiliaryConsumer;
use crate::postgres::config::PostgresConsumerConfig;
use crate::postgres::protocol::Lsn;
use crate::postgres::schema::{self, AUX_TABLE, OUTBOX_TABLE, PUBLICATION};
use crate::postgres::source::{self, IngestorSettings};
use crate::postgres::state::PgPositionStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_postgres::{Client, GenericClient, NoTls};
use tracing::{debug, error, info, warn};

/// Grace period for the reader to close its socket cooperatively.
const READER_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// A stream session that survives this long counts as healthy and resets
/// the reconnect backoff.
const HEALTHY_SESSION_THRESHOLD: Duration = Duration::from_secs(60);

/// Per-partition outbox consumer over PostgreSQL logical replication.
pub struct PostgresOutboxConsumer {
    config: PostgresConsumerConfig,
    status: StatusCell,
    runtime: Option<Runtime>,
}

/// Live connections and handles between start and stop.
struct Runtime {
    client: Arc<Client>,
    stop: StopHandle,
}

impl PostgresOutboxConsumer {
    pub fn new(config: PostgresConsumerConfig) -> Self {
        Self {
            config,
            status: StatusCell::new(),
            runtime: None,
        }
    }

    pub fn status(&self) -> ConsumerStatus {
        self.status.get()
    }

    /// Insert messages into the primary outbox using the consumer's own
    /// connection. The multi-row insert is a single statement, so the rows
    /// commit atomically; insertion order is preserved in position order.
    pub async fn enqueue(
        &self,
        messages: &[OutboxMessage],
        partition_key: Option<&str>,
    ) -> Result<Vec<i64>> {
        self.status.require_running()?;
        let runtime = self.runtime.as_ref().ok_or(HermesError::NotStarted)?;
        let partition = partition_key.unwrap_or(&self.config.partition_key);
        insert_outbox_rows(runtime.client.as_ref(), messages, partition).await
    }

    /// Insert messages into the primary outbox inside a host-managed
    /// transaction, making the enqueue atomic with the business write.
    pub async fn enqueue_in<C: GenericClient + Sync>(
        &self,
        tx: &C,
        messages: &[OutboxMessage],
        partition_key: Option<&str>,
    ) -> Result<Vec<i64>> {
        self.status.require_running()?;
        let partition = partition_key.unwrap_or(&self.config.partition_key);
        insert_outbox_rows(tx, messages, partition).await
    }

    /// Insert messages into the secondary (polling) outbox.
    pub async fn send(&self, messages: &[OutboxMessage]) -> Result<Vec<i64>> {
        self.require_auxiliary()?;
        self.status.require_running()?;
        let runtime = self.runtime.as_ref().ok_or(HermesError::NotStarted)?;
        insert_aux_rows(
            runtime.client.as_ref(),
            messages,
            &self.config.consumer_name,
        )
        .await
    }

    /// Insert messages into the secondary outbox inside a host-managed
    /// transaction.
    pub async fn send_in<C: GenericClient + Sync>(
        &self,
        tx: &C,
        messages: &[OutboxMessage],
    ) -> Result<Vec<i64>> {
        self.require_auxiliary()?;
        self.status.require_running()?;
        insert_aux_rows(tx, messages, &self.config.consumer_name).await
    }

    fn require_auxiliary(&self) -> Result<()> {
        if self.config.auxiliary.is_some() {
            Ok(())
        } else {
            Err(HermesError::AuxiliaryNotConfigured)
        }
    }

    /// Run migrations, load the consumer state, acquire the slot and launch
    /// the ingest/publish/auxiliary tasks. Returns the idempotent stop
    /// handle, which is also registered for signal-driven stop when
    /// `dispose_on_signal` is set.
    pub async fn start(&mut self) -> Result<StopHandle> {
        let prior = self.status.get();
        self.status.begin_start()?;

        match self.start_inner().await {
            Ok(stop) => {
                self.status.set(ConsumerStatus::Running);
                Ok(stop)
            }
            Err(e) => {
                // A failed start mutates nothing observable.
                self.status.set(prior);
                self.runtime = None;
                Err(e)
            }
        }
    }

    async fn start_inner(&mut self) -> Result<StopHandle> {
        self.config.validate()?;
        let options = (self.config.get_connection_options)();

        // Query connection, shared by enqueue, state and auxiliary.
        let (client, conn) = options
            .to_pg_config()
            .connect(NoTls)
            .await
            .map_err(HermesError::from)?;
        let client = Arc::new(client);
        let conn_task = tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("query connection closed: {e}");
            }
        });

        schema::migrate(&client, self.config.auxiliary.is_some()).await?;

        let slot = schema::slot_name(&self.config.consumer_name, &self.config.partition_key);
        schema::ensure_slot(&client, &slot).await?;
        schema::require_slot_free(&client, &slot).await?;

        let store = Arc::new(PgPositionStore::new(
            client.clone(),
            self.config.consumer_name.clone(),
            self.config.partition_key.clone(),
        ));
        let start_lsn = store.last_acked_lsn().await?.unwrap_or(Lsn::ZERO);

        let settings = Arc::new(IngestorSettings {
            slot: slot.clone(),
            publication: PUBLICATION.to_string(),
            partition_key: self.config.partition_key.clone(),
            descriptor: source::outbox_descriptor(),
        });

        // Acquire the stream before declaring start successful: the server's
        // slot exclusivity is the authoritative mutual-exclusion signal.
        let first_stream = source::open_stream(&options, &settings, start_lsn).await?;

        let shutdown = Shutdown::new();
        let (done_tx, done_rx) = watch::channel(false);
        let stop = StopHandle::new(shutdown.clone(), done_rx);

        let (acked_tx, acked_rx) = watch::channel(start_lsn);
        let ack_sink = Arc::new(PgAckSink {
            store: store.clone(),
            client: client.clone(),
            save_timestamps: self.config.save_timestamps,
            now: self.config.now.clone(),
            acked_tx,
        });
        let queue = build_queue(
            self.config.queue_settings(),
            self.config.publish.clone(),
            ack_sink,
            self.config.on_failed_publish.clone(),
            self.config.on_db_error.clone(),
            shutdown.clone(),
        );

        let (batch_tx, batch_rx) = ingest_channel();
        let publisher_task = tokio::spawn(run_delivery_loop(batch_rx, queue, shutdown.clone()));

        let reader_task = tokio::spawn(run_reader(
            first_stream,
            options.clone(),
            settings,
            store.clone(),
            batch_tx,
            acked_rx,
            shutdown.clone(),
            self.config.on_db_error.clone(),
        ));

        let aux_task = self.config.auxiliary.as_ref().map(|aux| {
            tokio::spawn(
                AuxiliaryConsumer::new(
                    aux.clone(),
                    client.clone(),
                    self.config.consumer_name.clone(),
                    self.config.partition_key.clone(),
                    self.config.publish.clone(),
                    self.config.on_failed_publish.clone(),
                    self.config.on_db_error.clone(),
                    self.config.now.clone(),
                    shutdown.clone(),
                )
                .run(),
            )
        });

        // Teardown supervisor: runs once, no matter how many times the stop
        // handle is invoked.
        {
            let shutdown = shutdown.clone();
            let client = client.clone();
            let status = self.status.clone();
            tokio::spawn(async move {
                shutdown.wait().await;
                status.set(ConsumerStatus::Stopping);

                // Best-effort: kick any walsender still holding the slot so a
                // restart can re-acquire immediately.
                schema::terminate_slot_backends(&client, &slot).await;

                let mut reader_task = reader_task;
                if tokio::time::timeout(READER_CLOSE_TIMEOUT, &mut reader_task)
                    .await
                    .is_err()
                {
                    warn!("reader did not close within {READER_CLOSE_TIMEOUT:?}, aborting");
                    reader_task.abort();
                }

                // The queue drains: retry waits were cancelled, in-flight
                // publish calls run to completion with their results ignored.
                let _ = publisher_task.await;
                if let Some(task) = aux_task {
                    let _ = task.await;
                }

                conn_task.abort();
                status.set(ConsumerStatus::Stopped);
                let _ = done_tx.send(true);
                info!("consumer stopped");
            });
        }

        if self.config.dispose_on_signal {
            crate::common::signal::spawn_signal_watcher(stop.clone());
        }

        self.runtime = Some(Runtime {
            client,
            stop: stop.clone(),
        });
        info!(
            consumer = %self.config.consumer_name,
            partition = %self.config.partition_key,
            "consumer started"
        );
        Ok(stop)
    }

    /// Stop via the consumer itself; equivalent to the returned handle.
    pub async fn stop(&self) -> Result<()> {
        match &self.runtime {
            Some(runtime) => runtime.stop.stop().await,
            None => Ok(()),
        }
    }
}

/// Reader task: run stream sessions forever, reconnecting with backoff from
/// the last acknowledged position until shutdown or a fatal error.
#[allow(clippy::too_many_arguments)]
async fn run_reader(
    first_stream: crate::postgres::protocol::ReplicationStream,
    options: crate::postgres::config::PgConnectOptions,
    settings: Arc<IngestorSettings>,
    store: Arc<PgPositionStore>,
    batch_tx: tokio::sync::mpsc::Sender<TransactionBatch>,
    acked_rx: watch::Receiver<Lsn>,
    shutdown: Arc<Shutdown>,
    on_db_error: crate::common::ErrorSink,
) {
    let mut backoff = ExponentialBackoff::for_reconnect();
    let mut stream = Some(first_stream);

    while !shutdown.is_triggered() {
        let session = match stream.take() {
            Some(stream) => Ok(stream),
            None => {
                let start_lsn = match store.last_acked_lsn().await {
                    Ok(lsn) => lsn.unwrap_or(Lsn::ZERO),
                    Err(e) => {
                        on_db_error(&e);
                        Lsn::ZERO
                    }
                };
                source::open_stream(&options, &settings, start_lsn).await
            }
        };

        let session_started = Instant::now();
        let result = match session {
            Ok(stream) => {
                source::run_ingest_session(stream, &settings, &batch_tx, &acked_rx, &shutdown)
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                if shutdown.is_triggered() {
                    break;
                }
                warn!("replication session ended, reconnecting");
                backoff.reset();
            }
            Err(e) => {
                error!("replication session failed: {e}");
                on_db_error(&e);
                if e.is_fatal() {
                    break;
                }
                if session_started.elapsed() >= HEALTHY_SESSION_THRESHOLD {
                    backoff.reset();
                }
            }
        }

        let delay = backoff.next_backoff();
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!("reader task finished");
}

/// Ack sink over the consumer-state row, feeding the acked LSN back to the
/// reader's heartbeat.
struct PgAckSink {
    store: Arc<PgPositionStore>,
    client: Arc<Client>,
    save_timestamps: bool,
    now: Clock,
    acked_tx: watch::Sender<Lsn>,
}

#[async_trait]
impl AckSink for PgAckSink {
    async fn ack(&self, batch: &TransactionBatch) -> Result<()> {
        self.store.ack(&batch.token).await?;
        let _ = self.acked_tx.send(Lsn(batch.commit_position));

        if self.save_timestamps {
            let positions: Vec<i64> = batch.messages.iter().map(|m| m.position).collect();
            let stamped = self
                .client
                .execute(
                    &format!("UPDATE {OUTBOX_TABLE} SET sent_at = $2 WHERE position = ANY($1)"),
                    &[&positions, &(self.now)()],
                )
                .await;
            if let Err(e) = stamped {
                // Best-effort: the ack itself already landed.
                debug!("stamping sent_at failed: {e}");
            }
        }
        Ok(())
    }

    async fn before_retry(&self, _batch: &TransactionBatch, attempt: u32) -> Result<()> {
        self.store.set_redelivery(attempt).await
    }
}

/// Single-statement multi-row insert; atomic without an explicit
/// transaction, row positions assigned in input order.
async fn insert_outbox_rows<C: GenericClient + Sync>(
    client: &C,
    messages: &[OutboxMessage],
    partition_key: &str,
) -> Result<Vec<i64>> {
    if messages.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<&str> = messages.iter().map(|m| m.message_id.as_str()).collect();
    let types: Vec<&str> = messages.iter().map(|m| m.message_type.as_str()).collect();
    let payloads: Vec<serde_json::Value> = messages.iter().map(|m| m.data.clone()).collect();

    let rows = client
        .query(
            &format!(
                "INSERT INTO {OUTBOX_TABLE} (message_id, message_type, partition_key, data)
                 SELECT mid, mtype, $3, payload
                 FROM unnest($1::text[], $2::text[], $4::jsonb[])
                      WITH ORDINALITY AS t(mid, mtype, payload, ord)
                 ORDER BY ord
                 RETURNING position"
            ),
            &[&ids, &types, &partition_key, &payloads],
        )
        .await?;

    Ok(rows.iter().map(|r| r.get(0)).collect())
}

async fn insert_aux_rows<C: GenericClient + Sync>(
    client: &C,
    messages: &[OutboxMessage],
    consumer_name: &str,
) -> Result<Vec<i64>> {
    if messages.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<&str> = messages.iter().map(|m| m.message_id.as_str()).collect();
    let types: Vec<&str> = messages.iter().map(|m| m.message_type.as_str()).collect();
    let payloads: Vec<serde_json::Value> = messages.iter().map(|m| m.data.clone()).collect();

    let rows = client
        .query(
            &format!(
                "INSERT INTO {AUX_TABLE} (consumer_name, message_id, message_type, data)
                 SELECT $3, mid, mtype, payload
                 FROM unnest($1::text[], $2::text[], $4::jsonb[])
                      WITH ORDINALITY AS t(mid, mtype, payload, ord)
                 ORDER BY ord
                 RETURNING position"
            ),
            &[&ids, &types, &consumer_name, &payloads],
        )
        .await?;

    Ok(rows.iter().map(|r| r.get(0)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{DeliveredMessage, Publisher};
    use crate::postgres::config::{PgConnectOptions, PostgresConsumerConfig};

    struct NopPublisher;

    #[async_trait]
    impl Publisher for NopPublisher {
        async fn publish(&self, _messages: &[DeliveredMessage]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn config() -> PostgresConsumerConfig {
        PostgresConsumerConfig::new(
            "orders",
            Arc::new(|| PgConnectOptions::from_url("postgres://localhost/db").unwrap()),
            Arc::new(NopPublisher),
        )
    }

    #[tokio::test]
    async fn test_enqueue_before_start_fails() {
        let consumer = PostgresOutboxConsumer::new(config());
        let err = consumer
            .enqueue(
                &[OutboxMessage::new("m1", "T", serde_json::json!({}))],
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HermesError::NotStarted));
    }

    #[tokio::test]
    async fn test_send_without_auxiliary_fails() {
        let consumer = PostgresOutboxConsumer::new(config());
        let err = consumer
            .send(&[OutboxMessage::new("m1", "T", serde_json::json!({}))])
            .await
            .unwrap_err();
        assert!(matches!(err, HermesError::AuxiliaryNotConfigured));
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let consumer = PostgresOutboxConsumer::new(config());
        consumer.stop().await.unwrap();
        assert_eq!(consumer.status(), ConsumerStatus::Unstarted);
    }
}
