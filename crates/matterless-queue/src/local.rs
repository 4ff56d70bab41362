// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue persisted in a key-value store.
//!
//! Store layout for a queue named `<name>`:
//!
//! | Key | Value |
//! |-----|-------|
//! | `queue:<name>:<id>` | message body (`{"id","body","Retries"}`) |
//! | `queue:<name>:_queue` | pending IDs, head first |
//! | `queue:<name>:_inflight` | ID to RFC 3339 lease expiry |
//!
//! A single worker task owns both structures. Every operation, including
//! the periodic reclaim of expired leases (every half lease), runs on that
//! task in arrival order, so a message ID is always in exactly one of the
//! pending list and the inflight map as seen by callers.
//!
//! Only one `LocalQueue` may operate on a given name in a given store at a time.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use matterless_eventbus::LocalEventBus;
use matterless_store::Store;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{Message, MessageId, Queue, QueueConfig, QueueError, Result, Stats};

/// Event published on [`Queue::event_bus`] whenever a message is enqueued.
pub const MESSAGE_EVENT: &str = "message";

enum Command {
    Send(Message, oneshot::Sender<Result<()>>),
    Receive(oneshot::Sender<Result<Message>>),
    Ack(MessageId, oneshot::Sender<Result<()>>),
    Stats(oneshot::Sender<Result<Stats>>),
}

/// Store-backed queue with lease-based redelivery.
pub struct LocalQueue {
    name: String,
    commands: mpsc::Sender<Command>,
    bus: LocalEventBus,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LocalQueue {
    /// Open queue `name` in `store` and start its redelivery loop.
    ///
    /// Messages left pending or in flight by a previous instance are picked up.
    pub fn new(store: Arc<dyn Store>, name: impl Into<String>, lease_duration: Duration) -> Self {
        let name = name.into();
        let bus = LocalEventBus::new();
        let cancel = CancellationToken::new();
        let (commands_tx, commands_rx) = mpsc::channel(256);

        let worker = QueueWorker {
            keys: Keys::new(&name),
            store,
            lease_duration,
            bus: bus.clone(),
        };
        let handle = tokio::spawn(worker.run(commands_rx, cancel.clone()));

        Self {
            name,
            commands: commands_tx,
            bus,
            cancel,
            worker: Mutex::new(Some(handle)),
        }
    }

    pub fn from_config(store: Arc<dyn Store>, name: impl Into<String>, config: &QueueConfig) -> Self {
        Self::new(store, name, config.lease_duration)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| QueueError::Closed)?;
        rx.await.map_err(|_| QueueError::Closed)?
    }
}

#[async_trait]
impl Queue for LocalQueue {
    async fn send(&self, message: Message) -> Result<()> {
        self.call(|reply| Command::Send(message, reply)).await
    }

    async fn receive(&self) -> Result<Message> {
        self.call(Command::Receive).await
    }

    async fn ack(&self, id: &MessageId) -> Result<()> {
        let id = id.clone();
        self.call(|reply| Command::Ack(id, reply)).await
    }

    async fn stats(&self) -> Result<Stats> {
        self.call(Command::Stats).await
    }

    fn event_bus(&self) -> &LocalEventBus {
        &self.bus
    }

    async fn close(&self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.lock().await.take()
            && let Err(e) = worker.await
        {
            error!(queue = %self.name, error = %e, "Queue worker failed");
        }
    }
}

struct Keys {
    prefix: String,
    pending: String,
    inflight: String,
}

impl Keys {
    fn new(name: &str) -> Self {
        Self {
            prefix: format!("queue:{name}:"),
            pending: format!("queue:{name}:_queue"),
            inflight: format!("queue:{name}:_inflight"),
        }
    }

    fn message(&self, id: &MessageId) -> String {
        format!("{}{}", self.prefix, id)
    }
}

struct QueueWorker {
    keys: Keys,
    store: Arc<dyn Store>,
    lease_duration: Duration,
    bus: LocalEventBus,
}

impl QueueWorker {
    async fn run(self, mut commands: mpsc::Receiver<Command>, cancel: CancellationToken) {
        let period = (self.lease_duration / 2).max(Duration::from_millis(1));
        let mut reclaim = tokio::time::interval_at(Instant::now() + period, period);
        reclaim.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(queue = %self.keys.prefix, lease_ms = self.lease_duration.as_millis() as u64, "Queue worker started");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                command = commands.recv() => match command {
                    Some(Command::Send(message, reply)) => {
                        let _ = reply.send(self.send(message).await);
                    }
                    Some(Command::Receive(reply)) => {
                        let _ = reply.send(self.receive().await);
                    }
                    Some(Command::Ack(id, reply)) => {
                        let _ = reply.send(self.ack(&id).await);
                    }
                    Some(Command::Stats(reply)) => {
                        let _ = reply.send(self.stats().await);
                    }
                    None => break,
                },

                _ = reclaim.tick() => {
                    if let Err(e) = self.reclaim_expired().await {
                        error!(queue = %self.keys.prefix, error = %e, "Failed to reclaim expired leases");
                    }
                }
            }
        }

        info!(queue = %self.keys.prefix, "Queue worker stopped");
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.put_message(&message).await?;
        let mut pending = self.load_pending().await?;
        pending.push(message.id.clone());
        self.save_pending(&pending).await?;
        debug!(queue = %self.keys.prefix, id = %message.id, "Message queued");
        self.bus.publish_async(MESSAGE_EVENT, json!({}));
        Ok(())
    }

    /// Lease the head of the pending list.
    ///
    /// The lease is persisted before the ID leaves the pending list, so a
    /// failed store write never leaves an unacknowledged ID in neither place.
    async fn receive(&self) -> Result<Message> {
        let mut pending = self.load_pending().await?;

        while let Some(id) = pending.first().cloned() {
            let Some(raw) = self.store.get(&self.keys.message(&id)).await? else {
                warn!(queue = %self.keys.prefix, id = %id, "Dropping queued ID without a message body");
                pending.remove(0);
                self.save_pending(&pending).await?;
                continue;
            };

            let message: Message = match serde_json::from_value(raw) {
                Ok(message) => message,
                Err(e) => {
                    // Keep it queued, but behind everything else.
                    error!(queue = %self.keys.prefix, id = %id, error = %e, "Undecodable message body");
                    pending.rotate_left(1);
                    self.save_pending(&pending).await?;
                    return Err(e.into());
                }
            };

            let expiry = chrono::Duration::from_std(self.lease_duration)
                .ok()
                .and_then(|lease| Utc::now().checked_add_signed(lease))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            let mut inflight = self.load_inflight().await?;
            inflight.insert(id.clone(), expiry);
            self.save_inflight(&inflight).await?;

            pending.remove(0);
            if let Err(e) = self.save_pending(&pending).await {
                inflight.remove(&id);
                if let Err(rollback) = self.save_inflight(&inflight).await {
                    error!(queue = %self.keys.prefix, id = %id, error = %rollback, "Message is both queued and in flight and may be delivered twice");
                }
                return Err(e);
            }

            return Ok(message);
        }

        Err(QueueError::NoMessage)
    }

    async fn ack(&self, id: &MessageId) -> Result<()> {
        let mut inflight = self.load_inflight().await?;
        if inflight.remove(id).is_none() {
            debug!(queue = %self.keys.prefix, id = %id, "Ack for message not in flight");
        }
        self.save_inflight(&inflight).await?;
        self.store.delete(&self.keys.message(id)).await?;
        Ok(())
    }

    async fn stats(&self) -> Result<Stats> {
        Ok(Stats {
            messages_in_queue: self.load_pending().await?.len(),
            messages_in_flight: self.load_inflight().await?.len(),
        })
    }

    /// Move every expired lease back to the pending tail with `Retries + 1`.
    async fn reclaim_expired(&self) -> Result<()> {
        let mut inflight = self.load_inflight().await?;
        let now = Utc::now();
        let expired: Vec<MessageId> = inflight
            .iter()
            .filter(|(_, expiry)| now > **expiry)
            .map(|(id, _)| id.clone())
            .collect();

        if expired.is_empty() {
            return Ok(());
        }

        let mut pending = self.load_pending().await?;
        let mut requeued = 0usize;
        for id in expired {
            inflight.remove(&id);
            let Some(raw) = self.store.get(&self.keys.message(&id)).await? else {
                warn!(queue = %self.keys.prefix, id = %id, "Expired lease without a message body");
                continue;
            };
            match serde_json::from_value::<Message>(raw) {
                Ok(mut message) => {
                    message.retries += 1;
                    self.put_message(&message).await?;
                }
                Err(e) => {
                    error!(queue = %self.keys.prefix, id = %id, error = %e, "Requeueing undecodable message without counting the retry");
                }
            }
            if !pending.contains(&id) {
                pending.push(id);
            }
            requeued += 1;
        }

        self.save_pending(&pending).await?;
        self.save_inflight(&inflight).await?;

        info!(queue = %self.keys.prefix, requeued, "Redelivering expired messages");
        for _ in 0..requeued {
            self.bus.publish_async(MESSAGE_EVENT, json!({}));
        }
        Ok(())
    }

    async fn put_message(&self, message: &Message) -> Result<()> {
        self.store
            .put(&self.keys.message(&message.id), serde_json::to_value(message)?)
            .await?;
        Ok(())
    }

    async fn load_pending(&self) -> Result<Vec<MessageId>> {
        match self.store.get(&self.keys.pending).await? {
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(value) => Ok(serde_json::from_value(value)?),
        }
    }

    async fn save_pending(&self, pending: &[MessageId]) -> Result<()> {
        self.store
            .put(&self.keys.pending, serde_json::to_value(pending)?)
            .await?;
        Ok(())
    }

    async fn load_inflight(&self) -> Result<BTreeMap<MessageId, DateTime<Utc>>> {
        let raw: BTreeMap<MessageId, String> = match self.store.get(&self.keys.inflight).await? {
            Some(Value::Null) | None => BTreeMap::new(),
            Some(value) => serde_json::from_value(value)?,
        };

        raw.into_iter()
            .map(|(id, expiry)| {
                let parsed = DateTime::parse_from_rfc3339(&expiry)
                    .map_err(|source| QueueError::InvalidExpiry {
                        value: expiry.clone(),
                        source,
                    })?
                    .with_timezone(&Utc);
                Ok::<_, QueueError>((id, parsed))
            })
            .collect()
    }

    async fn save_inflight(&self, inflight: &BTreeMap<MessageId, DateTime<Utc>>) -> Result<()> {
        let raw: BTreeMap<&MessageId, String> = inflight
            .iter()
            .map(|(id, expiry)| (id, expiry.to_rfc3339_opts(SecondsFormat::Millis, true)))
            .collect();
        self.store
            .put(&self.keys.inflight, serde_json::to_value(raw)?)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matterless_store::{MemoryStore, QueryResult, StoreError};

    fn queue(store: &Arc<MemoryStore>, lease: Duration) -> LocalQueue {
        LocalQueue::new(store.clone(), "test", lease)
    }

    /// Memory store whose next put to one chosen key fails.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_put: std::sync::Mutex<Option<String>>,
    }

    impl FlakyStore {
        fn fail_next_put(&self, key: &str) {
            *self.fail_put.lock().unwrap() = Some(key.to_string());
        }
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn put(&self, key: &str, value: Value) -> matterless_store::Result<()> {
            let fail = {
                let mut armed = self.fail_put.lock().unwrap();
                if armed.as_deref() == Some(key) {
                    armed.take();
                    true
                } else {
                    false
                }
            };
            if fail {
                return Err(StoreError::NotConnected);
            }
            self.inner.put(key, value).await
        }

        async fn get(&self, key: &str) -> matterless_store::Result<Option<Value>> {
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> matterless_store::Result<()> {
            self.inner.delete(key).await
        }

        async fn query_range(
            &self,
            start: &str,
            end: &str,
        ) -> matterless_store::Result<Vec<QueryResult>> {
            self.inner.query_range(start, end).await
        }

        async fn query_prefix(&self, prefix: &str) -> matterless_store::Result<Vec<QueryResult>> {
            self.inner.query_prefix(prefix).await
        }

        async fn close(&self) -> matterless_store::Result<()> {
            self.inner.close().await
        }

        async fn delete_store(&self) -> matterless_store::Result<()> {
            self.inner.delete_store().await
        }
    }

    #[tokio::test]
    async fn test_failed_lease_write_keeps_message_queued() {
        let store = Arc::new(FlakyStore::default());
        let q = LocalQueue::new(store.clone(), "test", Duration::from_secs(30));
        q.send(Message::with_id("m1", json!("body"))).await.unwrap();

        store.fail_next_put("queue:test:_inflight");
        let err = q.receive().await.unwrap_err();
        assert!(matches!(err, QueueError::Store(StoreError::NotConnected)));
        assert_eq!(
            q.stats().await.unwrap(),
            Stats {
                messages_in_queue: 1,
                messages_in_flight: 0
            }
        );

        let message = q.receive().await.unwrap();
        assert_eq!(message.id, MessageId::from("m1"));
        q.close().await;
    }

    #[tokio::test]
    async fn test_failed_pending_write_rolls_back_lease() {
        let store = Arc::new(FlakyStore::default());
        let q = LocalQueue::new(store.clone(), "test", Duration::from_secs(30));
        q.send(Message::with_id("m1", json!("body"))).await.unwrap();

        store.fail_next_put("queue:test:_queue");
        assert!(q.receive().await.is_err());
        assert_eq!(
            q.stats().await.unwrap(),
            Stats {
                messages_in_queue: 1,
                messages_in_flight: 0
            }
        );

        assert_eq!(q.receive().await.unwrap().id, MessageId::from("m1"));
        q.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_message_survives_failed_receive_and_is_redelivered() {
        let store = Arc::new(FlakyStore::default());
        let q = LocalQueue::new(store.clone(), "test", Duration::from_millis(200));
        q.send(Message::with_id("m1", json!("body"))).await.unwrap();

        store.fail_next_put("queue:test:_inflight");
        assert!(q.receive().await.is_err());

        let first = q.receive().await.unwrap();
        assert_eq!(first.retries, 0);

        tokio::time::sleep(Duration::from_millis(800)).await;
        let again = q.receive().await.unwrap();
        assert_eq!(again.id, MessageId::from("m1"));
        assert!(again.retries >= 1);
        q.close().await;
    }

    #[tokio::test]
    async fn test_undecodable_body_stays_queued_behind_others() {
        let store = Arc::new(MemoryStore::new());
        store.put("queue:test:bad", json!("not a message")).await.unwrap();
        store
            .put("queue:test:good", json!({"id": "good", "body": 1, "Retries": 0}))
            .await
            .unwrap();
        store
            .put("queue:test:_queue", json!(["bad", "good"]))
            .await
            .unwrap();
        let q = queue(&store, Duration::from_secs(30));

        assert!(matches!(
            q.receive().await,
            Err(QueueError::Serialization(_))
        ));
        assert_eq!(
            store.get("queue:test:_queue").await.unwrap(),
            Some(json!(["good", "bad"]))
        );

        assert_eq!(q.receive().await.unwrap().id, MessageId::from("good"));
        assert_eq!(
            q.stats().await.unwrap(),
            Stats {
                messages_in_queue: 1,
                messages_in_flight: 1
            }
        );
        q.close().await;
    }

    #[tokio::test]
    async fn test_persisted_layout() {
        let store = Arc::new(MemoryStore::new());
        let q = queue(&store, Duration::from_secs(30));

        q.send(Message::with_id("a", json!("first"))).await.unwrap();
        q.send(Message::with_id("b", json!("second"))).await.unwrap();
        assert_eq!(
            store.get("queue:test:_queue").await.unwrap(),
            Some(json!(["a", "b"]))
        );
        assert_eq!(
            store.get("queue:test:a").await.unwrap(),
            Some(json!({"id": "a", "body": "first", "Retries": 0}))
        );

        q.receive().await.unwrap();
        let inflight = store.get("queue:test:_inflight").await.unwrap().unwrap();
        let expiry = inflight["a"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(expiry).is_ok());
        assert_eq!(
            store.get("queue:test:_queue").await.unwrap(),
            Some(json!(["b"]))
        );

        q.ack(&MessageId::from("a")).await.unwrap();
        assert_eq!(store.get("queue:test:a").await.unwrap(), None);
        q.close().await;
    }

    #[tokio::test]
    async fn test_receive_skips_ids_without_body() {
        let store = Arc::new(MemoryStore::new());
        let q = queue(&store, Duration::from_secs(30));

        q.send(Message::with_id("gone", json!(1))).await.unwrap();
        q.send(Message::with_id("here", json!(2))).await.unwrap();
        store.delete("queue:test:gone").await.unwrap();

        let message = q.receive().await.unwrap();
        assert_eq!(message.id, MessageId::from("here"));
        assert!(matches!(q.receive().await, Err(QueueError::NoMessage)));
        assert_eq!(
            q.stats().await.unwrap(),
            Stats {
                messages_in_queue: 0,
                messages_in_flight: 1
            }
        );
        q.close().await;
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let store = Arc::new(MemoryStore::new());
        let q = queue(&store, Duration::from_secs(30));
        q.close().await;

        assert!(matches!(
            q.send(Message::new(json!(null))).await,
            Err(QueueError::Closed)
        ));
        assert!(matches!(q.receive().await, Err(QueueError::Closed)));
        assert!(matches!(q.stats().await, Err(QueueError::Closed)));
    }

    #[tokio::test]
    async fn test_corrupt_expiry_is_reported() {
        let store = Arc::new(MemoryStore::new());
        store
            .put("queue:test:_inflight", json!({"x": "yesterday"}))
            .await
            .unwrap();
        let q = queue(&store, Duration::from_secs(30));

        let err = q.stats().await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidExpiry { .. }));
        q.close().await;
    }
}
