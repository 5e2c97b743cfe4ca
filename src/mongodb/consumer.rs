//! # Change-Feed Outbox Consumer
//!
//! One consumer owns one (consumer-name, partition-key) pair on the
//! document backend: it bootstraps the collections, takes the partition
//! lock, tails the change stream and drives the same publishing queue as
//! the log backend.

use crate::common::pipeline::{ingest_channel, run_delivery_loop};
use crate::common::{
    build_queue, AckSink, Clock, ConsumerStatus, ExponentialBackoff, HermesError, OutboxMessage,
    PositionStore, Result, Shutdown, StatusCell, StopHandle, TransactionBatch,
};
use crate::mongodb::auxiliary::AuxiliaryConsumer;
use crate::mongodb::config::MongoConsumerConfig;
use crate::mongodb::schema::{self, AUX_COLLECTION, OUTBOX_COLLECTION};
use crate::mongodb::source;
use crate::mongodb::state::MongoPositionStore;
use async_trait::async_trait;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::InsertManyOptions;
use mongodb::{Client, ClientSession, Database};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Grace period for the reader to close its cursor cooperatively.
const READER_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// A stream session that survives this long resets the reconnect backoff.
const HEALTHY_SESSION_THRESHOLD: Duration = Duration::from_secs(60);

/// Per-partition outbox consumer over MongoDB change streams.
pub struct MongoOutboxConsumer {
    config: MongoConsumerConfig,
    status: StatusCell,
    runtime: Option<Runtime>,
}

struct Runtime {
    db: Database,
    stop: StopHandle,
}

impl MongoOutboxConsumer {
    pub fn new(config: MongoConsumerConfig) -> Self {
        Self {
            config,
            status: StatusCell::new(),
            runtime: None,
        }
    }

    pub fn status(&self) -> ConsumerStatus {
        self.status.get()
    }

    /// Insert messages into the primary outbox collection.
    pub async fn enqueue(
        &self,
        messages: &[OutboxMessage],
        partition_key: Option<&str>,
    ) -> Result<Vec<i64>> {
        self.status.require_running()?;
        let runtime = self.runtime.as_ref().ok_or(HermesError::NotStarted)?;
        let partition = partition_key.unwrap_or(&self.config.partition_key);
        insert_outbox_docs(&runtime.db, messages, partition, None).await
    }

    /// Insert messages inside a host-managed session, making the enqueue
    /// atomic with the business write.
    pub async fn enqueue_in(
        &self,
        session: &mut ClientSession,
        messages: &[OutboxMessage],
        partition_key: Option<&str>,
    ) -> Result<Vec<i64>> {
        self.status.require_running()?;
        let runtime = self.runtime.as_ref().ok_or(HermesError::NotStarted)?;
        let partition = partition_key.unwrap_or(&self.config.partition_key);
        insert_outbox_docs(&runtime.db, messages, partition, Some(session)).await
    }

    /// Insert messages into the secondary (polling) outbox collection.
    pub async fn send(&self, messages: &[OutboxMessage]) -> Result<Vec<i64>> {
        self.require_auxiliary()?;
        self.status.require_running()?;
        let runtime = self.runtime.as_ref().ok_or(HermesError::NotStarted)?;
        insert_aux_docs(
            &runtime.db,
            messages,
            &self.config.consumer_name,
            &self.config.now,
            None,
        )
        .await
    }

    /// Insert messages into the secondary outbox inside a host-managed
    /// session.
    pub async fn send_in(
        &self,
        session: &mut ClientSession,
        messages: &[OutboxMessage],
    ) -> Result<Vec<i64>> {
        self.require_auxiliary()?;
        self.status.require_running()?;
        let runtime = self.runtime.as_ref().ok_or(HermesError::NotStarted)?;
        insert_aux_docs(
            &runtime.db,
            messages,
            &self.config.consumer_name,
            &self.config.now,
            Some(session),
        )
        .await
    }

    fn require_auxiliary(&self) -> Result<()> {
        if self.config.auxiliary.is_some() {
            Ok(())
        } else {
            Err(HermesError::AuxiliaryNotConfigured)
        }
    }

    /// Bootstrap the collections, take the partition lock, open the change
    /// stream and launch the tasks.
    pub async fn start(&mut self) -> Result<StopHandle> {
        let prior = self.status.get();
        self.status.begin_start()?;

        match self.start_inner().await {
            Ok(stop) => {
                self.status.set(ConsumerStatus::Running);
                Ok(stop)
            }
            Err(e) => {
                self.status.set(prior);
                self.runtime = None;
                Err(e)
            }
        }
    }

    async fn start_inner(&mut self) -> Result<StopHandle> {
        self.config.validate()?;
        let options = (self.config.get_connection_options)();

        let client = Client::with_uri_str(&options.uri).await?;
        let db = client.database(&options.database);

        schema::require_supported_version(&db).await?;
        schema::migrate(&db, self.config.auxiliary.is_some()).await?;
        schema::acquire_lock(
            &db,
            &self.config.consumer_name,
            &self.config.partition_key,
            self.config.lock_lease,
            (self.config.now)(),
        )
        .await?;

        let store = Arc::new(MongoPositionStore::new(
            db.clone(),
            self.config.consumer_name.clone(),
            self.config.partition_key.clone(),
        ));

        // Open before declaring success so a rolled-over resume token
        // surfaces PositionLost from start itself. Any failure here must
        // give the lock back.
        let first_stream = match store.resume_token().await {
            Ok(resume) => {
                source::open_change_stream(&db, &self.config.partition_key, resume).await
            }
            Err(e) => Err(e),
        };
        let first_stream = match first_stream {
            Ok(stream) => stream,
            Err(e) => {
                schema::release_lock(&db, &self.config.consumer_name, &self.config.partition_key)
                    .await;
                return Err(e);
            }
        };

        let shutdown = Shutdown::new();
        let (done_tx, done_rx) = watch::channel(false);
        let stop = StopHandle::new(shutdown.clone(), done_rx);

        let ack_sink = Arc::new(MongoAckSink {
            store: store.clone(),
            db: db.clone(),
            save_timestamps: self.config.save_timestamps,
            now: self.config.now.clone(),
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
            db.clone(),
            self.config.partition_key.clone(),
            store.clone(),
            batch_tx,
            shutdown.clone(),
            self.config.on_db_error.clone(),
        ));

        let aux_task = self.config.auxiliary.as_ref().map(|aux| {
            tokio::spawn(
                AuxiliaryConsumer::new(
                    aux.clone(),
                    db.clone(),
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

        // Lock lease refresher.
        let refresher_task = {
            let db = db.clone();
            let consumer_name = self.config.consumer_name.clone();
            let partition_key = self.config.partition_key.clone();
            let now = self.config.now.clone();
            let shutdown = shutdown.clone();
            let on_db_error = self.config.on_db_error.clone();
            let refresh_every = self.config.lock_lease / 3;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(refresh_every);
                loop {
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        _ = ticker.tick() => {
                            if let Err(e) =
                                schema::refresh_lock(&db, &consumer_name, &partition_key, now())
                                    .await
                            {
                                on_db_error(&e);
                            }
                        }
                    }
                }
            })
        };

        {
            let shutdown = shutdown.clone();
            let db = db.clone();
            let consumer_name = self.config.consumer_name.clone();
            let partition_key = self.config.partition_key.clone();
            let status = self.status.clone();
            tokio::spawn(async move {
                shutdown.wait().await;
                status.set(ConsumerStatus::Stopping);

                let mut reader_task = reader_task;
                if tokio::time::timeout(READER_CLOSE_TIMEOUT, &mut reader_task)
                    .await
                    .is_err()
                {
                    warn!("reader did not close within {READER_CLOSE_TIMEOUT:?}, aborting");
                    reader_task.abort();
                }

                let _ = publisher_task.await;
                if let Some(task) = aux_task {
                    let _ = task.await;
                }
                refresher_task.abort();

                schema::release_lock(&db, &consumer_name, &partition_key).await;
                status.set(ConsumerStatus::Stopped);
                let _ = done_tx.send(true);
                info!("consumer stopped");
            });
        }

        if self.config.dispose_on_signal {
            crate::common::signal::spawn_signal_watcher(stop.clone());
        }

        self.runtime = Some(Runtime {
            db,
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

/// Reader task: run change-stream sessions, reconnecting with backoff from
/// the stored resume token until shutdown or a fatal error.
async fn run_reader(
    first_stream: mongodb::change_stream::ChangeStream<
        mongodb::change_stream::event::ChangeStreamEvent<Document>,
    >,
    db: Database,
    partition_key: String,
    store: Arc<MongoPositionStore>,
    batch_tx: tokio::sync::mpsc::Sender<TransactionBatch>,
    shutdown: Arc<Shutdown>,
    on_db_error: crate::common::ErrorSink,
) {
    let mut backoff = ExponentialBackoff::for_reconnect();
    let mut stream = Some(first_stream);

    while !shutdown.is_triggered() {
        let session = match stream.take() {
            Some(stream) => Ok(stream),
            None => match store.resume_token().await {
                Ok(resume) => source::open_change_stream(&db, &partition_key, resume).await,
                Err(e) => Err(e),
            },
        };

        let session_started = Instant::now();
        let result = match session {
            Ok(stream) => source::run_ingest_session(stream, &batch_tx, &shutdown).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                if shutdown.is_triggered() {
                    break;
                }
                warn!("change-stream session ended, reconnecting");
                backoff.reset();
            }
            Err(e) => {
                error!("change-stream session failed: {e}");
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

/// Ack sink over the consumer-state document.
struct MongoAckSink {
    store: Arc<MongoPositionStore>,
    db: Database,
    save_timestamps: bool,
    now: Clock,
}

#[async_trait]
impl AckSink for MongoAckSink {
    async fn ack(&self, batch: &TransactionBatch) -> Result<()> {
        self.store.ack(&batch.token).await?;

        if self.save_timestamps {
            let positions: Vec<i64> = batch.messages.iter().map(|m| m.position).collect();
            let stamped = self
                .db
                .collection::<Document>(OUTBOX_COLLECTION)
                .update_many(
                    doc! {"position": {"$in": positions}},
                    doc! {"$set": {
                        "sent_at": mongodb::bson::DateTime::from_chrono((self.now)()),
                    }},
                    None,
                )
                .await;
            if let Err(e) = stamped {
                debug!("stamping sent_at failed: {e}");
            }
        }
        Ok(())
    }

    async fn before_retry(&self, _batch: &TransactionBatch, attempt: u32) -> Result<()> {
        self.store.set_redelivery(attempt).await
    }
}

async fn insert_outbox_docs(
    db: &Database,
    messages: &[OutboxMessage],
    partition_key: &str,
    session: Option<&mut ClientSession>,
) -> Result<Vec<i64>> {
    if messages.is_empty() {
        return Ok(Vec::new());
    }

    let first =
        schema::allocate_positions(db, OUTBOX_COLLECTION, messages.len() as i64).await?;
    let positions: Vec<i64> = (first..first + messages.len() as i64).collect();

    let docs: Vec<Document> = messages
        .iter()
        .zip(&positions)
        .map(|(message, position)| {
            Ok(doc! {
                "position": position,
                "message_id": &message.message_id,
                "message_type": &message.message_type,
                "partition_key": partition_key,
                "data": mongodb::bson::to_bson(&message.data)?,
                "sent_at": Bson::Null,
            })
        })
        .collect::<std::result::Result<_, mongodb::bson::ser::Error>>()
        .map_err(|e| HermesError::storage(format!("unserializable payload: {e}")))?;

    let collection = db.collection::<Document>(OUTBOX_COLLECTION);
    let options = InsertManyOptions::builder().ordered(true).build();
    match session {
        Some(session) => {
            collection
                .insert_many_with_session(docs, options, session)
                .await?
        }
        None => collection.insert_many(docs, options).await?,
    };

    Ok(positions)
}

async fn insert_aux_docs(
    db: &Database,
    messages: &[OutboxMessage],
    consumer_name: &str,
    now: &Clock,
    session: Option<&mut ClientSession>,
) -> Result<Vec<i64>> {
    if messages.is_empty() {
        return Ok(Vec::new());
    }

    let first = schema::allocate_positions(db, AUX_COLLECTION, messages.len() as i64).await?;
    let positions: Vec<i64> = (first..first + messages.len() as i64).collect();
    let added_at = mongodb::bson::DateTime::from_chrono(now());

    let docs: Vec<Document> = messages
        .iter()
        .zip(&positions)
        .map(|(message, position)| {
            Ok(doc! {
                "position": position,
                "consumer_name": consumer_name,
                "message_id": &message.message_id,
                "message_type": &message.message_type,
                "data": mongodb::bson::to_bson(&message.data)?,
                "delivered": false,
                "fails_count": 0i32,
                "added_at": added_at,
                "sent_at": Bson::Null,
            })
        })
        .collect::<std::result::Result<_, mongodb::bson::ser::Error>>()
        .map_err(|e| HermesError::storage(format!("unserializable payload: {e}")))?;

    let collection = db.collection::<Document>(AUX_COLLECTION);
    let options = InsertManyOptions::builder().ordered(true).build();
    match session {
        Some(session) => {
            collection
                .insert_many_with_session(docs, options, session)
                .await?
        }
        None => collection.insert_many(docs, options).await?,
    };

    Ok(positions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{DeliveredMessage, Publisher};
    use crate::mongodb::config::MongoConnectOptions;

    struct NopPublisher;

    #[async_trait]
    impl Publisher for NopPublisher {
        async fn publish(&self, _messages: &[DeliveredMessage]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn config() -> MongoConsumerConfig {
        MongoConsumerConfig::new(
            "orders",
            Arc::new(|| MongoConnectOptions {
                uri: "mongodb://localhost:27017".to_string(),
                database: "shop".to_string(),
            }),
            Arc::new(NopPublisher),
        )
    }

    #[tokio::test]
    async fn test_enqueue_before_start_fails() {
        let consumer = MongoOutboxConsumer::new(config());
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
        let consumer = MongoOutboxConsumer::new(config());
        let err = consumer
            .send(&[OutboxMessage::new("m1", "T", serde_json::json!({}))])
            .await
            .unwrap_err();
        assert!(matches!(err, HermesError::AuxiliaryNotConfigured));
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let consumer = MongoOutboxConsumer::new(config());
        consumer.stop().await.unwrap();
        assert_eq!(consumer.status(), ConsumerStatus::Unstarted);
    }
}
