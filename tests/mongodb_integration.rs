//! MongoDB backend integration tests using testcontainers.
//!
//! Change streams need a replica set, so the container starts mongod with
//! `--replSet` and the harness initiates it before the tests run.
//!
//! Run with: cargo test --test mongodb_integration --features mongodb -- --ignored --test-threads=1

#![cfg(feature = "mongodb")]

mod common;

use common::{init_test_logging, RecordingPublisher};
use hermes_outbox::mongodb::{MongoConnectOptions, MongoConsumerConfig, MongoOutboxConsumer};
use hermes_outbox::{AuxiliaryConfig, ConsumerStatus, HermesError, OutboxMessage, Publisher};
use mongodb::bson::{doc, Document};
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::mongo::Mongo;
use tokio::time::sleep;

struct MongoTestContainer {
    #[allow(dead_code)]
    container: ContainerAsync<Mongo>,
    uri: String,
}

impl MongoTestContainer {
    async fn start() -> anyhow::Result<Self> {
        let container = Mongo::default()
            .with_cmd(vec!["mongod", "--replSet", "rs0", "--bind_ip_all"])
            .start()
            .await?;
        let host = container.get_host().await?.to_string();
        let port = container.get_host_port_ipv4(27017).await?;
        let uri = format!("mongodb://{host}:{port}/?directConnection=true");

        let instance = Self { container, uri };
        instance.initiate_replica_set().await?;
        Ok(instance)
    }

    async fn initiate_replica_set(&self) -> anyhow::Result<()> {
        let client = mongodb::Client::with_uri_str(&self.uri).await?;
        let admin = client.database("admin");

        let _ = admin
            .run_command(doc! {"replSetInitiate": {}}, None)
            .await;

        // Wait for the single node to elect itself primary.
        for _ in 0..60 {
            if let Ok(hello) = admin.run_command(doc! {"hello": 1}, None).await {
                if hello.get_bool("isWritablePrimary").unwrap_or(false) {
                    return Ok(());
                }
            }
            sleep(Duration::from_millis(500)).await;
        }
        anyhow::bail!("replica set never elected a primary")
    }

    async fn db(&self) -> mongodb::Database {
        mongodb::Client::with_uri_str(&self.uri)
            .await
            .expect("connect")
            .database("shop")
    }

    async fn reset(&self) {
        let db = self.db().await;
        for name in [
            "hermes_outbox",
            "hermes_outbox_aux",
            "hermes_consumer_state",
            "hermes_counters",
        ] {
            let _ = db.collection::<Document>(name).drop(None).await;
        }
    }
}

fn consumer_config(
    mongo: &MongoTestContainer,
    name: &str,
    publisher: Arc<dyn Publisher>,
) -> MongoConsumerConfig {
    let uri = mongo.uri.clone();
    let mut config = MongoConsumerConfig::new(
        name,
        Arc::new(move || MongoConnectOptions {
            uri: uri.clone(),
            database: "shop".to_string(),
        }),
        publisher,
    );
    config.wait_after_failed_publish = Duration::from_millis(500);
    config.dispose_on_signal = false;
    config
}

async fn wait_until<F, Fut>(timeout: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if probe().await {
            return true;
        }
        sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
#[ignore = "Requires Docker; run with --ignored"]
#[serial]
async fn test_end_to_end_single_message() {
    init_test_logging();
    let mongo = MongoTestContainer::start().await.unwrap();
    mongo.reset().await;

    let publisher = RecordingPublisher::new();
    let mut consumer = MongoOutboxConsumer::new(consumer_config(&mongo, "orders", publisher.clone()));
    let stop = consumer.start().await.unwrap();
    assert_eq!(consumer.status(), ConsumerStatus::Running);

    consumer
        .enqueue(
            &[OutboxMessage::new(
                "m1",
                "OrderCreated",
                serde_json::json!({"v": 1}),
            )],
            None,
        )
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(15), || async {
            !publisher.calls().await.is_empty()
        })
        .await,
        "publish callback was never invoked"
    );

    let calls = publisher.calls().await;
    assert_eq!(calls[0].len(), 1, "document backend delivers one per batch");
    let envelope = &calls[0][0];
    assert_eq!(envelope.message_id, "m1");
    assert_eq!(envelope.position, 1);
    assert_eq!(envelope.redelivery_count, 0);
    assert_eq!(envelope.data["v"], 1);

    // Resume token persisted in the state document.
    let db = mongo.db().await;
    assert!(
        wait_until(Duration::from_secs(10), || async {
            db.collection::<Document>("hermes_consumer_state")
                .find_one(
                    doc! {"consumer_name": "orders", "partition_key": "default"},
                    None,
                )
                .await
                .ok()
                .flatten()
                .map(|d| d.get_str("last_acked_token").is_ok())
                .unwrap_or(false)
        })
        .await,
        "resume token was never persisted"
    );

    stop.stop().await.unwrap();
    assert_eq!(consumer.status(), ConsumerStatus::Stopped);
}

#[tokio::test]
#[ignore = "Requires Docker; run with --ignored"]
#[serial]
async fn test_five_messages_arrive_in_order_one_call_each() {
    init_test_logging();
    let mongo = MongoTestContainer::start().await.unwrap();
    mongo.reset().await;

    let publisher = RecordingPublisher::new();
    let mut consumer = MongoOutboxConsumer::new(consumer_config(&mongo, "orders", publisher.clone()));
    let stop = consumer.start().await.unwrap();

    let messages: Vec<OutboxMessage> = (1..=5)
        .map(|i| OutboxMessage::new(format!("m{i}"), "X", serde_json::json!({"i": i})))
        .collect();
    consumer.enqueue(&messages, None).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(15), || async {
            publisher.delivered().await.len() >= 5
        })
        .await
    );

    let calls = publisher.calls().await;
    assert_eq!(calls.len(), 5, "document backend: five publish calls");
    let ids: Vec<_> = calls.iter().map(|c| c[0].message_id.clone()).collect();
    assert_eq!(ids, ["m1", "m2", "m3", "m4", "m5"]);

    stop.stop().await.unwrap();
}

#[tokio::test]
#[ignore = "Requires Docker; run with --ignored"]
#[serial]
async fn test_duplicate_start_fails_with_consumer_already_taken() {
    init_test_logging();
    let mongo = MongoTestContainer::start().await.unwrap();
    mongo.reset().await;

    let publisher_a = RecordingPublisher::new();
    let mut consumer_a =
        MongoOutboxConsumer::new(consumer_config(&mongo, "orders", publisher_a.clone()));
    let stop_a = consumer_a.start().await.unwrap();

    let publisher_b = RecordingPublisher::new();
    let mut consumer_b =
        MongoOutboxConsumer::new(consumer_config(&mongo, "orders", publisher_b.clone()));
    let err = consumer_b.start().await.unwrap_err();
    assert!(matches!(err, HermesError::ConsumerAlreadyTaken(_)));
    assert_eq!(consumer_b.status(), ConsumerStatus::Unstarted);

    stop_a.stop().await.unwrap();

    // The lock is released on stop; a later start succeeds.
    let publisher_c = RecordingPublisher::new();
    let mut consumer_c = MongoOutboxConsumer::new(consumer_config(&mongo, "orders", publisher_c));
    let stop_c = consumer_c.start().await.unwrap();
    stop_c.stop().await.unwrap();
}

#[tokio::test]
#[ignore = "Requires Docker; run with --ignored"]
#[serial]
async fn test_partition_scoping() {
    init_test_logging();
    let mongo = MongoTestContainer::start().await.unwrap();
    mongo.reset().await;

    let publisher = RecordingPublisher::new();
    let mut config = consumer_config(&mongo, "orders", publisher.clone());
    config.partition_key = "eu".to_string();
    let mut consumer = MongoOutboxConsumer::new(config);
    let stop = consumer.start().await.unwrap();

    consumer
        .enqueue(
            &[OutboxMessage::new("eu-1", "X", serde_json::json!({}))],
            Some("eu"),
        )
        .await
        .unwrap();
    consumer
        .enqueue(
            &[OutboxMessage::new("us-1", "X", serde_json::json!({}))],
            Some("us"),
        )
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(15), || async {
            publisher
                .delivered()
                .await
                .iter()
                .any(|m| m.message_id == "eu-1")
        })
        .await
    );
    sleep(Duration::from_secs(2)).await;

    // The us-partition row never reaches the eu consumer.
    let delivered = publisher.delivered().await;
    assert!(delivered.iter().all(|m| m.message_id != "us-1"));

    stop.stop().await.unwrap();
}

#[tokio::test]
#[ignore = "Requires Docker; run with --ignored"]
#[serial]
async fn test_auxiliary_polling_delivery() {
    init_test_logging();
    let mongo = MongoTestContainer::start().await.unwrap();
    mongo.reset().await;

    let publisher = RecordingPublisher::new();
    let mut config = consumer_config(&mongo, "orders", publisher.clone());
    config.auxiliary = Some(AuxiliaryConfig {
        check_interval: Duration::from_secs(1),
        batch_size: 10,
        wait_after_failed_publish: Duration::from_millis(200),
    });
    let mut consumer = MongoOutboxConsumer::new(config);
    let stop = consumer.start().await.unwrap();

    consumer
        .send(&[OutboxMessage::new(
            "c1",
            "Compensate",
            serde_json::json!({"x": 1}),
        )])
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || async {
            publisher
                .delivered()
                .await
                .iter()
                .any(|m| m.message_id == "c1")
        })
        .await,
        "auxiliary document was never delivered"
    );

    let db = mongo.db().await;
    let row = db
        .collection::<Document>("hermes_outbox_aux")
        .find_one(doc! {"message_id": "c1"}, None)
        .await
        .unwrap()
        .unwrap();
    assert!(row.get_bool("delivered").unwrap());
    assert!(row.get_datetime("sent_at").is_ok());

    stop.stop().await.unwrap();
}
