// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the store-backed queue.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use matterless_cluster::{MemoryTransport, Transport};
use matterless_queue::{LocalQueue, Message, MessageId, Queue, QueueError, Stats};
use matterless_store::{MemoryStore, ReplicatedStore, SqliteStore, Store};
use serde_json::json;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn stats(queued: usize, in_flight: usize) -> Stats {
    Stats {
        messages_in_queue: queued,
        messages_in_flight: in_flight,
    }
}

#[tokio::test]
async fn test_send_receive_ack() {
    init_tracing();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let queue = LocalQueue::new(store, "test", Duration::from_secs(30));

    let sent = Message::new(json!("My message"));
    queue.send(sent.clone()).await.unwrap();
    assert_eq!(queue.stats().await.unwrap(), stats(1, 0));

    let received = queue.receive().await.unwrap();
    assert_eq!(received.id, sent.id);
    assert_eq!(received.body, json!("My message"));
    assert_eq!(received.retries, 0);
    assert_eq!(queue.stats().await.unwrap(), stats(0, 1));

    queue.ack(&received.id).await.unwrap();
    assert_eq!(queue.stats().await.unwrap(), stats(0, 0));

    let err = queue.receive().await.unwrap_err();
    assert!(err.is_empty());
    queue.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unacked_messages_are_redelivered_after_lease() {
    init_tracing();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let queue = LocalQueue::new(store, "test", Duration::from_secs(1));

    let mut sent = BTreeSet::new();
    for i in 0..100 {
        let message = Message::new(json!(format!("message {i}")));
        sent.insert(message.id.clone());
        queue.send(message).await.unwrap();
    }

    let mut first = BTreeSet::new();
    for _ in 0..100 {
        first.insert(queue.receive().await.unwrap().id);
    }
    assert_eq!(first, sent);
    assert_eq!(queue.stats().await.unwrap(), stats(0, 100));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(queue.stats().await.unwrap(), stats(100, 0));

    let mut second = BTreeSet::new();
    for _ in 0..100 {
        let message = queue.receive().await.unwrap();
        assert_eq!(message.retries, 1);
        second.insert(message.id);
    }
    assert_eq!(second, sent);
    assert_eq!(queue.stats().await.unwrap(), stats(0, 100));
    assert!(matches!(queue.receive().await, Err(QueueError::NoMessage)));

    queue.close().await;
}

#[tokio::test]
async fn test_message_event_on_send() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let queue = LocalQueue::new(store, "events", Duration::from_secs(30));

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    queue.event_bus().subscribe("message", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    for _ in 0..3 {
        queue.send(Message::new(json!(null))).await.unwrap();
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while seen.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("three message events");
    queue.close().await;
}

#[tokio::test]
async fn test_queues_with_different_names_are_independent() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let jobs = LocalQueue::new(store.clone(), "jobs", Duration::from_secs(30));
    let mail = LocalQueue::new(store, "mail", Duration::from_secs(30));

    jobs.send(Message::with_id("1", json!("job"))).await.unwrap();
    assert!(matches!(mail.receive().await, Err(QueueError::NoMessage)));
    assert_eq!(jobs.receive().await.unwrap().id, MessageId::from("1"));

    jobs.close().await;
    mail.close().await;
}

#[tokio::test]
async fn test_queue_survives_restart_on_sqlite() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::from_path(&path).await.unwrap());
        let queue = LocalQueue::new(store.clone(), "durable", Duration::from_secs(30));
        queue.send(Message::with_id("a", json!({"n": 1}))).await.unwrap();
        queue.send(Message::with_id("b", json!({"n": 2}))).await.unwrap();
        queue.receive().await.unwrap();
        queue.close().await;
        store.close().await.unwrap();
    }

    let store: Arc<dyn Store> = Arc::new(SqliteStore::from_path(&path).await.unwrap());
    let queue = LocalQueue::new(store, "durable", Duration::from_secs(30));
    assert_eq!(queue.stats().await.unwrap(), stats(1, 1));

    let message = queue.receive().await.unwrap();
    assert_eq!(message.id, MessageId::from("b"));
    assert_eq!(message.body, json!({"n": 2}));

    queue.ack(&MessageId::from("a")).await.unwrap();
    queue.ack(&message.id).await.unwrap();
    assert_eq!(queue.stats().await.unwrap(), stats(0, 0));
    queue.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queue_over_replicated_store() {
    init_tracing();
    let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
    let timeout = Duration::from_secs(5);

    let replica = |transport: Arc<dyn Transport>| async move {
        let store = ReplicatedStore::new(transport, "queues", Arc::new(MemoryStore::new()))
            .await
            .unwrap();
        store.connect(timeout).await.unwrap();
        Arc::new(store)
    };

    let writer = replica(transport.clone()).await;
    let queue = LocalQueue::new(writer.clone(), "work", Duration::from_secs(30));
    queue.send(Message::with_id("x", json!("payload"))).await.unwrap();
    queue.close().await;

    // A second node picks the queue up from the replicated log.
    let reader = replica(transport).await;
    reader.sync(timeout).await.unwrap();
    let queue = LocalQueue::new(reader.clone(), "work", Duration::from_secs(30));
    let message = queue.receive().await.unwrap();
    assert_eq!(message.id, MessageId::from("x"));
    assert_eq!(message.body, json!("payload"));
    queue.ack(&message.id).await.unwrap();
    queue.close().await;

    writer.sync(timeout).await.unwrap();
    assert_eq!(writer.get("queue:work:x").await.unwrap(), None);
}
