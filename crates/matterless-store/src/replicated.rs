// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Log-replicated key-value store.
//!
//! All mutations are records appended to one transport stream named after
//! the store (subjects `<name>.put`, `<name>.delete`, `<name>.sync`). Every
//! node, the writer included, follows that stream with a single sequential
//! apply loop that writes each record into a local cache [`Store`] together
//! with the record's sequence number (under the reserved key `$$seq`). A
//! reconnecting node resumes after the last applied sequence instead of
//! replaying the whole log.
//!
//! Writes are acknowledged by echo: `put`/`delete` register a completion
//! channel under a fresh correlation ID, publish, and return once the apply
//! loop has applied the record carrying that ID. [`ReplicatedStore::sync`]
//! does the same with a marker record, which makes it a read barrier for
//! everything published before it.
//!
//! Reads are served from the local cache and never touch the network.
//!
//! Wire records (JSON):
//!
//! ```text
//! put     {"id": "<uuid>", "k": "<key>", "v": <value>}
//! delete  {"id": "<uuid>", "k": "<key>"}
//! sync    {"id": "<uuid>"}
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use matterless_cluster::{
    ClusterConfig, ClusterError, ClusterEventBus, DeliverPolicy, StreamConfig, StreamMessage,
    StreamSubscription, SubscriptionId, Transport,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{QueryResult, Result, Store, StoreError};

/// Reserved cache key holding the last applied stream sequence.
pub const SEQUENCE_KEY: &str = "$$seq";

#[derive(Debug, Serialize, Deserialize)]
struct PutRecord {
    id: String,
    #[serde(rename = "k")]
    key: String,
    #[serde(rename = "v")]
    value: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct DeleteRecord {
    id: String,
    #[serde(rename = "k")]
    key: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SyncMarker {
    id: String,
}

/// What the apply loop does with a record it cannot decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MalformedRecordPolicy {
    /// Log, count and continue with the next record.
    #[default]
    Skip,
    /// Stop applying and fail every pending write and sync.
    Halt,
}

/// A mutation observed on the log by [`ReplicatedStore::subscribe_changes`].
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Put { key: String, value: Value },
    Delete { key: String },
}

#[derive(Debug, Clone)]
struct Subjects {
    put: String,
    delete: String,
    sync: String,
}

impl Subjects {
    fn new(stream: &str) -> Self {
        Self {
            put: format!("{stream}.put"),
            delete: format!("{stream}.delete"),
            sync: format!("{stream}.sync"),
        }
    }
}

/// How a waiter learns the fate of its record.
#[derive(Debug)]
enum Ack {
    Applied,
    Halted(String),
}

type Waiters = Arc<Mutex<HashMap<String, oneshot::Sender<Ack>>>>;

struct Connection {
    subscription_id: SubscriptionId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Key-value store replicated through a transport stream.
pub struct ReplicatedStore {
    transport: Arc<dyn Transport>,
    stream: String,
    subjects: Subjects,
    cache: Arc<dyn Store>,
    waiters: Waiters,
    connection: Mutex<Option<Connection>>,
    connected: Arc<AtomicBool>,
    skipped: Arc<AtomicU64>,
    policy: MalformedRecordPolicy,
    ack_timeout: Duration,
}

impl ReplicatedStore {
    /// Create the store's stream (if missing) on `transport`, caching into `cache`.
    ///
    /// The store starts disconnected; call [`connect`](Self::connect) before writing.
    pub async fn new(
        transport: Arc<dyn Transport>,
        name: impl Into<String>,
        cache: Arc<dyn Store>,
    ) -> Result<Self> {
        let stream = name.into();
        transport
            .add_stream(StreamConfig {
                name: stream.clone(),
                subjects: vec![format!("{stream}.*")],
            })
            .await?;

        Ok(Self {
            transport,
            subjects: Subjects::new(&stream),
            stream,
            cache,
            waiters: Arc::new(Mutex::new(HashMap::new())),
            connection: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            skipped: Arc::new(AtomicU64::new(0)),
            policy: MalformedRecordPolicy::default(),
            ack_timeout: ClusterConfig::default().sync_timeout,
        })
    }

    /// Create a store whose stream is namespaced by the bus prefix (`<prefix>-<name>`).
    pub async fn for_cluster(
        bus: &ClusterEventBus,
        name: &str,
        cache: Arc<dyn Store>,
    ) -> Result<Self> {
        Self::new(bus.transport().clone(), format!("{}-{name}", bus.prefix()), cache).await
    }

    /// How long `put`/`delete` wait for their echo.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_malformed_record_policy(mut self, policy: MalformedRecordPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn stream_name(&self) -> &str {
        &self.stream
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of malformed records skipped by the apply loop.
    pub fn skipped_records(&self) -> u64 {
        self.skipped.load(Ordering::SeqCst)
    }

    /// Start following the log and wait until caught up.
    ///
    /// Resumes after the sequence persisted in the cache, or replays the whole
    /// log for a fresh cache. Connecting an already connected store only syncs.
    pub async fn connect(&self, timeout: Duration) -> Result<()> {
        {
            let mut connection = self.connection.lock().await;

            // A halted apply loop leaves a finished task behind; resubscribe.
            let halted = connection.as_ref().is_some_and(|c| c.task.is_finished());
            if halted && let Some(stale) = connection.take() {
                let _ = self.transport.unsubscribe(stale.subscription_id).await;
            }

            if connection.is_none() {
                let policy = match self.cache.get(SEQUENCE_KEY).await?.and_then(|v| v.as_u64()) {
                    Some(applied) => DeliverPolicy::StartSequence(applied + 1),
                    None => DeliverPolicy::All,
                };
                let StreamSubscription { id, messages } =
                    self.transport.stream_subscribe(&self.stream, policy).await?;

                let cancel = CancellationToken::new();
                let apply = ApplyLoop {
                    stream: self.stream.clone(),
                    subjects: self.subjects.clone(),
                    cache: self.cache.clone(),
                    waiters: self.waiters.clone(),
                    connected: self.connected.clone(),
                    skipped: self.skipped.clone(),
                    policy: self.policy,
                    cancel: cancel.clone(),
                };
                self.connected.store(true, Ordering::SeqCst);
                let task = tokio::spawn(apply.run(messages));

                info!(stream = %self.stream, ?policy, "Replicated store connected");
                *connection = Some(Connection {
                    subscription_id: id,
                    cancel,
                    task,
                });
            }
        }

        self.sync(timeout).await
    }

    /// Stop following the log.
    ///
    /// The cache keeps its contents and sequence. Pending writes and syncs
    /// fail with [`StoreError::Disconnected`].
    pub async fn disconnect(&self) {
        let Some(connection) = self.connection.lock().await.take() else {
            return;
        };

        connection.cancel.cancel();
        if let Err(e) = connection.task.await {
            error!(stream = %self.stream, error = %e, "Apply loop task failed");
        }
        if let Err(e) = self.transport.unsubscribe(connection.subscription_id).await {
            warn!(stream = %self.stream, error = %e, "Failed to unsubscribe from stream");
        }
        self.connected.store(false, Ordering::SeqCst);

        // Dropping the senders wakes every waiter with Disconnected.
        let drained = {
            let mut waiters = self.waiters.lock().await;
            let count = waiters.len();
            waiters.clear();
            count
        };
        info!(stream = %self.stream, pending = drained, "Replicated store disconnected");
    }

    /// Wait until every record published before this call has been applied locally.
    pub async fn sync(&self, timeout: Duration) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        let payload = serde_json::to_vec(&SyncMarker { id: id.clone() })?;

        let ack = self.publish_and_register(&self.subjects.sync, &id, payload).await?;
        self.await_ack(&id, ack, timeout, StoreError::SyncTimeout(timeout))
            .await
    }

    /// Follow new puts and deletes from now on.
    pub async fn subscribe_changes(&self) -> Result<ChangeSubscription> {
        let StreamSubscription { id, messages } = self
            .transport
            .stream_subscribe(&self.stream, DeliverPolicy::New)
            .await?;
        Ok(ChangeSubscription {
            id,
            messages,
            subjects: self.subjects.clone(),
            transport: self.transport.clone(),
        })
    }

    async fn write(&self, subject: &str, id: &str, payload: Vec<u8>) -> Result<()> {
        let ack = self.publish_and_register(subject, id, payload).await?;
        self.await_ack(id, ack, self.ack_timeout, StoreError::WriteTimeout(self.ack_timeout))
            .await
    }

    /// Register a waiter for `id`, then publish. The waiter exists before the echo can arrive.
    async fn publish_and_register(
        &self,
        subject: &str,
        id: &str,
        payload: Vec<u8>,
    ) -> Result<oneshot::Receiver<Ack>> {
        let (tx, rx) = oneshot::channel();
        {
            // Checked under the waiters lock: disconnect flips the flag before draining.
            let mut waiters = self.waiters.lock().await;
            if !self.is_connected() {
                return Err(StoreError::NotConnected);
            }
            waiters.insert(id.to_string(), tx);
        }

        if let Err(e) = self
            .transport
            .stream_publish(subject, Bytes::from(payload))
            .await
        {
            self.waiters.lock().await.remove(id);
            return Err(e.into());
        }
        Ok(rx)
    }

    async fn await_ack(
        &self,
        id: &str,
        ack: oneshot::Receiver<Ack>,
        timeout: Duration,
        on_timeout: StoreError,
    ) -> Result<()> {
        match tokio::time::timeout(timeout, ack).await {
            Ok(Ok(Ack::Applied)) => Ok(()),
            Ok(Ok(Ack::Halted(reason))) => Err(StoreError::ApplyHalted(reason)),
            Ok(Err(_)) => Err(StoreError::Disconnected),
            Err(_) => {
                self.waiters.lock().await.remove(id);
                Err(on_timeout)
            }
        }
    }
}

#[async_trait]
impl Store for ReplicatedStore {
    /// Publish a put and wait for it to be applied locally.
    ///
    /// The reserved key `$$seq` holds the replication position and is rejected.
    async fn put(&self, key: &str, value: Value) -> Result<()> {
        reject_reserved(key)?;
        let id = Uuid::new_v4().to_string();
        let payload = serde_json::to_vec(&PutRecord {
            id: id.clone(),
            key: key.to_string(),
            value,
        })?;
        self.write(&self.subjects.put, &id, payload).await
    }

    /// Read from the local cache. `$$seq` reads back the last applied sequence.
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.cache.get(key).await
    }

    /// Publish a delete and wait for it to be applied locally.
    async fn delete(&self, key: &str) -> Result<()> {
        reject_reserved(key)?;
        let id = Uuid::new_v4().to_string();
        let payload = serde_json::to_vec(&DeleteRecord {
            id: id.clone(),
            key: key.to_string(),
        })?;
        self.write(&self.subjects.delete, &id, payload).await
    }

    async fn query_range(&self, start: &str, end: &str) -> Result<Vec<QueryResult>> {
        let mut results = self.cache.query_range(start, end).await?;
        results.retain(|r| r.key != SEQUENCE_KEY);
        Ok(results)
    }

    async fn query_prefix(&self, prefix: &str) -> Result<Vec<QueryResult>> {
        let mut results = self.cache.query_prefix(prefix).await?;
        results.retain(|r| r.key != SEQUENCE_KEY);
        Ok(results)
    }

    async fn close(&self) -> Result<()> {
        self.disconnect().await;
        self.cache.close().await
    }

    /// Delete the local cache and the shared stream.
    ///
    /// Another node deleting the stream first is not an error.
    async fn delete_store(&self) -> Result<()> {
        self.disconnect().await;
        self.cache.delete_store().await?;
        match self.transport.delete_stream(&self.stream).await {
            Ok(()) | Err(ClusterError::StreamNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn reject_reserved(key: &str) -> Result<()> {
    if key == SEQUENCE_KEY {
        return Err(StoreError::ReservedKey(key.to_string()));
    }
    Ok(())
}

/// The single writer of the local cache.
struct ApplyLoop {
    stream: String,
    subjects: Subjects,
    cache: Arc<dyn Store>,
    waiters: Waiters,
    connected: Arc<AtomicBool>,
    skipped: Arc<AtomicU64>,
    policy: MalformedRecordPolicy,
    cancel: CancellationToken,
}

impl ApplyLoop {
    async fn run(self, mut messages: mpsc::UnboundedReceiver<StreamMessage>) {
        debug!(stream = %self.stream, "Apply loop started");

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                record = messages.recv() => {
                    let Some(record) = record else {
                        warn!(stream = %self.stream, "Stream subscription closed");
                        self.release_waiters().await;
                        break;
                    };
                    if let Err(reason) = self.apply(record).await {
                        error!(stream = %self.stream, reason = %reason, "Apply loop halted");
                        self.halt(reason).await;
                        break;
                    }
                }
            }
        }

        debug!(stream = %self.stream, "Apply loop stopped");
    }

    /// Apply one record. An `Err` halts the loop.
    async fn apply(&self, record: StreamMessage) -> std::result::Result<(), String> {
        let sequence = record.sequence;

        let decoded = if record.subject == self.subjects.put {
            serde_json::from_slice::<PutRecord>(&record.payload).map(Applied::Put)
        } else if record.subject == self.subjects.delete {
            serde_json::from_slice::<DeleteRecord>(&record.payload).map(Applied::Delete)
        } else if record.subject == self.subjects.sync {
            serde_json::from_slice::<SyncMarker>(&record.payload).map(Applied::Sync)
        } else {
            warn!(stream = %self.stream, subject = %record.subject, sequence, "Ignoring record on unknown subject");
            Ok(Applied::Ignored)
        };

        let applied = match decoded {
            Ok(applied) => applied,
            Err(e) => match self.policy {
                MalformedRecordPolicy::Skip => {
                    self.skipped.fetch_add(1, Ordering::SeqCst);
                    error!(stream = %self.stream, sequence, error = %e, "Skipping malformed record");
                    Applied::Ignored
                }
                MalformedRecordPolicy::Halt => {
                    return Err(format!("malformed record at sequence {sequence}: {e}"));
                }
            },
        };

        let correlation_id = match applied {
            Applied::Put(put) => {
                self.cache
                    .put(&put.key, put.value)
                    .await
                    .map_err(|e| format!("cache put at sequence {sequence}: {e}"))?;
                Some(put.id)
            }
            Applied::Delete(delete) => {
                self.cache
                    .delete(&delete.key)
                    .await
                    .map_err(|e| format!("cache delete at sequence {sequence}: {e}"))?;
                Some(delete.id)
            }
            Applied::Sync(marker) => Some(marker.id),
            Applied::Ignored => None,
        };

        self.cache
            .put(SEQUENCE_KEY, json!(sequence))
            .await
            .map_err(|e| format!("persisting sequence {sequence}: {e}"))?;

        if let Some(id) = correlation_id
            && let Some(waiter) = self.waiters.lock().await.remove(&id)
        {
            let _ = waiter.send(Ack::Applied);
        }
        Ok(())
    }

    /// Mark disconnected and drop every waiter, failing it with `Disconnected`.
    async fn release_waiters(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut waiters = self.waiters.lock().await;
        let pending = waiters.len();
        waiters.clear();
        if pending > 0 {
            warn!(stream = %self.stream, pending, "Failed pending writes after losing the stream");
        }
    }

    async fn halt(&self, reason: String) {
        self.connected.store(false, Ordering::SeqCst);
        let mut waiters = self.waiters.lock().await;
        for (_, waiter) in waiters.drain() {
            let _ = waiter.send(Ack::Halted(reason.clone()));
        }
    }
}

enum Applied {
    Put(PutRecord),
    Delete(DeleteRecord),
    Sync(SyncMarker),
    Ignored,
}

/// New puts and deletes on a replicated store's log.
pub struct ChangeSubscription {
    id: SubscriptionId,
    messages: mpsc::UnboundedReceiver<StreamMessage>,
    subjects: Subjects,
    transport: Arc<dyn Transport>,
}

impl ChangeSubscription {
    /// Next change, or `None` once the subscription ends.
    ///
    /// Sync markers and undecodable records are skipped.
    pub async fn next(&mut self) -> Option<Change> {
        while let Some(record) = self.messages.recv().await {
            if record.subject == self.subjects.put {
                match serde_json::from_slice::<PutRecord>(&record.payload) {
                    Ok(put) => {
                        return Some(Change::Put {
                            key: put.key,
                            value: put.value,
                        });
                    }
                    Err(e) => error!(error = %e, "Could not decode put record"),
                }
            } else if record.subject == self.subjects.delete {
                match serde_json::from_slice::<DeleteRecord>(&record.payload) {
                    Ok(delete) => return Some(Change::Delete { key: delete.key }),
                    Err(e) => error!(error = %e, "Could not decode delete record"),
                }
            }
        }
        None
    }

    pub async fn unsubscribe(self) -> Result<()> {
        self.transport.unsubscribe(self.id).await?;
        Ok(())
    }
}
