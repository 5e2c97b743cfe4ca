//! End-to-end delivery pipeline tests over in-memory doubles
//!
//! Drives the ingest channel → publishing queue → position store path the
//! way the backend ingestors do, and checks the delivery contract: ordered
//! per-partition delivery, no-gap monotonic acks, redelivery counters, and
//! cancellation behavior.

mod common;

use common::{batch_of, init_test_logging, RecordingPublisher, StoreAckSink};
use hermes_outbox::common::pipeline::{ingest_channel, run_delivery_loop};
use hermes_outbox::{
    build_queue, noop_error_sink, MemoryPositionStore, PositionStore, QueueSettings, Shutdown,
};
use std::sync::Arc;
use std::time::Duration;

fn queue_settings(serialization: bool, retry_delay: Duration) -> QueueSettings {
    QueueSettings {
        serialization,
        wait_after_failed_publish: retry_delay,
        max_in_flight: 8,
    }
}

struct Pipeline {
    publisher: Arc<RecordingPublisher>,
    store: Arc<MemoryPositionStore>,
    tx: tokio::sync::mpsc::Sender<hermes_outbox::TransactionBatch>,
    shutdown: Arc<Shutdown>,
    task: tokio::task::JoinHandle<()>,
}

/// Wire up channel → queue → store, as a backend consumer does at start.
fn pipeline(publisher: Arc<RecordingPublisher>, settings: QueueSettings) -> Pipeline {
    let store = Arc::new(MemoryPositionStore::new("orders", "default"));
    let shutdown = Shutdown::new();
    let queue = build_queue(
        settings,
        publisher.clone(),
        Arc::new(StoreAckSink {
            store: store.clone(),
        }),
        noop_error_sink(),
        noop_error_sink(),
        shutdown.clone(),
    );
    let (tx, rx) = ingest_channel();
    let task = tokio::spawn(run_delivery_loop(rx, queue, shutdown.clone()));
    Pipeline {
        publisher,
        store,
        tx,
        shutdown,
        task,
    }
}

impl Pipeline {
    /// Close the ingest side and wait for the queue to drain.
    async fn finish(self) -> (Arc<RecordingPublisher>, Arc<MemoryPositionStore>) {
        drop(self.tx);
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("pipeline should drain")
            .unwrap();
        (self.publisher, self.store)
    }
}

#[tokio::test]
async fn single_row_delivery() {
    init_test_logging();
    let p = pipeline(
        RecordingPublisher::new(),
        queue_settings(false, Duration::from_millis(10)),
    );
    p.store.load().await.unwrap();

    p.tx.send(batch_of(0x1A, 1, &["m1"])).await.unwrap();
    let (publisher, store) = p.finish().await;

    let calls = publisher.calls().await;
    assert_eq!(calls.len(), 1);
    let envelope = &calls[0][0];
    assert_eq!(envelope.position, 1);
    assert_eq!(envelope.message_id, "m1");
    assert_eq!(envelope.message_type, "Test");
    assert_eq!(envelope.redelivery_count, 0);
    assert_eq!(envelope.data["v"], 1);

    let state = store.load().await.unwrap();
    assert_eq!(state.last_acked_token.as_deref(), Some("0/1A"));
}

#[tokio::test]
async fn batch_of_five_single_publish_call_in_order() {
    init_test_logging();
    let p = pipeline(
        RecordingPublisher::new(),
        queue_settings(false, Duration::from_millis(10)),
    );

    p.tx.send(batch_of(0x20, 1, &["m1", "m2", "m3", "m4", "m5"]))
        .await
        .unwrap();
    let (publisher, store) = p.finish().await;

    let calls = publisher.calls().await;
    assert_eq!(calls.len(), 1, "one transaction = one publish call");
    let ids: Vec<_> = calls[0].iter().map(|m| m.message_id.as_str()).collect();
    assert_eq!(ids, ["m1", "m2", "m3", "m4", "m5"]);

    // The commit token is acked only once, after the whole batch.
    assert_eq!(store.ack_history().await, vec!["0/20"]);
}

#[tokio::test]
async fn retry_then_succeed_carries_redelivery_count() {
    init_test_logging();
    let p = pipeline(
        RecordingPublisher::failing(2),
        queue_settings(true, Duration::from_millis(10)),
    );
    p.store.load().await.unwrap();

    p.tx.send(batch_of(0x10, 1, &["m1"])).await.unwrap();
    p.tx.send(batch_of(0x20, 2, &["m2"])).await.unwrap();
    let (publisher, store) = p.finish().await;

    let calls = publisher.calls().await;
    // Exactly three invocations for m1, then one for m2; nothing else was
    // delivered while m1 retried.
    assert_eq!(calls.len(), 4);
    for (i, expected_count) in [(0usize, 0u32), (1, 1), (2, 2)] {
        assert_eq!(calls[i][0].message_id, "m1");
        assert_eq!(calls[i][0].redelivery_count, expected_count);
    }
    assert_eq!(calls[3][0].message_id, "m2");

    // Counter reset on the successful advance.
    let state = store.load().await.unwrap();
    assert_eq!(state.redelivery_count, 0);
    assert_eq!(store.ack_history().await, vec!["0/10", "0/20"]);
}

#[tokio::test]
async fn pipelined_acks_have_no_gaps_and_are_monotonic() {
    init_test_logging();
    let p = pipeline(
        RecordingPublisher::new(),
        queue_settings(false, Duration::from_millis(10)),
    );

    for n in 1..=40u64 {
        p.tx.send(batch_of(n * 0x10, n as i64, &[&format!("m{n}")]))
            .await
            .unwrap();
    }
    let (publisher, store) = p.finish().await;

    // Every enqueued message delivered at least once.
    let delivered = publisher.delivered().await;
    for n in 1..=40 {
        assert!(
            delivered.iter().any(|m| m.message_id == format!("m{n}")),
            "m{n} was never delivered"
        );
    }

    // Acked tokens are exactly the commit tokens, in commit order.
    let expected: Vec<String> = (1..=40u64).map(|n| format!("0/{:X}", n * 0x10)).collect();
    assert_eq!(store.ack_history().await, expected);
}

#[tokio::test]
async fn order_preserved_within_partition_under_serialization() {
    init_test_logging();
    let p = pipeline(
        RecordingPublisher::new(),
        queue_settings(true, Duration::from_millis(10)),
    );

    p.tx.send(batch_of(0x10, 1, &["a1", "a2"])).await.unwrap();
    p.tx.send(batch_of(0x20, 3, &["b1"])).await.unwrap();
    let (publisher, _) = p.finish().await;

    let delivered = publisher.delivered().await;
    let ids: Vec<_> = delivered.iter().map(|m| m.message_id.as_str()).collect();
    assert_eq!(ids, ["a1", "a2", "b1"]);
}

#[tokio::test]
async fn shutdown_cancels_retry_and_stops_deliveries() {
    init_test_logging();
    // Publisher that never succeeds, with an hour-long retry delay: the
    // only way out is cancellation.
    let p = pipeline(
        RecordingPublisher::failing(u32::MAX),
        queue_settings(true, Duration::from_secs(3600)),
    );

    p.tx.send(batch_of(0x10, 1, &["m1"])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    p.shutdown.trigger();

    tokio::time::timeout(Duration::from_secs(5), p.task)
        .await
        .expect("delivery loop should stop on shutdown")
        .unwrap();

    // One attempt happened, nothing was acked.
    assert_eq!(p.publisher.calls().await.len(), 1);
    assert!(p.store.ack_history().await.is_empty());
}

#[tokio::test]
async fn duplicate_emission_is_tolerated_downstream() {
    init_test_logging();
    // Simulates a reconnect replay: the same batch arrives twice. The
    // store's ack history may repeat the token, but delivery stays ordered
    // and the callback simply sees the duplicate message_id again.
    let p = pipeline(
        RecordingPublisher::new(),
        queue_settings(true, Duration::from_millis(10)),
    );

    p.tx.send(batch_of(0x10, 1, &["m1"])).await.unwrap();
    p.tx.send(batch_of(0x10, 1, &["m1"])).await.unwrap();
    let (publisher, store) = p.finish().await;

    assert_eq!(publisher.calls().await.len(), 2);
    assert_eq!(store.ack_history().await, vec!["0/10", "0/10"]);
}
