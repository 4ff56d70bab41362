// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transport over a NATS server.
//!
//! Plain subjects and queue groups map directly onto core NATS. Streams are
//! JetStream streams; stream subscriptions are ordered ephemeral consumers,
//! so records arrive in sequence order without acknowledgment.
//!
//! Each subscription is drained by a forwarding task into the channel handed
//! to the caller. Unsubscribing aborts that task, which drops the underlying
//! NATS subscription.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_nats::jetstream::consumer::DeliverPolicy as JetStreamDeliverPolicy;
use async_nats::jetstream::consumer::push::OrderedConfig;
use async_nats::jetstream::context::PublishErrorKind;
use async_nats::jetstream::{self, stream};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    DeliverPolicy, Message, RawSubscription, StreamConfig, StreamMessage, StreamSubscription,
    SubscriptionId, Transport,
};
use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};

/// Transport backed by a NATS connection with JetStream enabled.
pub struct NatsTransport {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    closed: AtomicBool,
    next_id: AtomicU64,
    forwarders: Mutex<HashMap<SubscriptionId, JoinHandle<()>>>,
}

impl NatsTransport {
    /// Connect to the NATS server at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url).await.map_err(transport_error)?;
        info!(url = %url, "Connected to NATS");
        Ok(Self::new(client))
    }

    /// Connect to the server named by [`ClusterConfig::nats_url`].
    pub async fn from_config(config: &ClusterConfig) -> Result<Self> {
        Self::connect(&config.nats_url).await
    }

    /// Wrap an existing client.
    pub fn new(client: async_nats::Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            forwarders: Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ClusterError::Closed)
        } else {
            Ok(())
        }
    }

    async fn register(&self, task: JoinHandle<()>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.forwarders.lock().await.insert(id, task);
        id
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.ensure_open()?;
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(transport_error)
    }

    async fn publish_request(&self, subject: &str, reply: &str, payload: Bytes) -> Result<()> {
        self.ensure_open()?;
        self.client
            .publish_with_reply(subject.to_string(), reply.to_string(), payload)
            .await
            .map_err(transport_error)
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<RawSubscription> {
        self.ensure_open()?;

        let mut subscriber = match queue_group {
            Some(group) => self
                .client
                .queue_subscribe(subject.to_string(), group.to_string())
                .await
                .map_err(transport_error)?,
            None => self
                .client
                .subscribe(subject.to_string())
                .await
                .map_err(transport_error)?,
        };

        let (sender, messages) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let forwarded = Message {
                    subject: message.subject.to_string(),
                    payload: message.payload,
                    reply: message.reply.map(|reply| reply.to_string()),
                };
                if sender.send(forwarded).is_err() {
                    break;
                }
            }
        });

        let id = self.register(task).await;
        debug!(subscription_id = id, subject = %subject, queue_group = ?queue_group, "Subscribed");
        Ok(RawSubscription { id, messages })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        if let Some(task) = self.forwarders.lock().await.remove(&id) {
            task.abort();
        }
        Ok(())
    }

    async fn add_stream(&self, config: StreamConfig) -> Result<()> {
        self.ensure_open()?;
        self.jetstream
            .get_or_create_stream(stream::Config {
                name: config.name.clone(),
                subjects: config.subjects,
                ..Default::default()
            })
            .await
            .map_err(transport_error)?;
        debug!(stream = %config.name, "Stream ready");
        Ok(())
    }

    async fn stream_publish(&self, subject: &str, payload: Bytes) -> Result<u64> {
        self.ensure_open()?;

        let pending = self
            .jetstream
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| match e.kind() {
                PublishErrorKind::StreamNotFound => ClusterError::StreamNotFound(subject.to_string()),
                _ => transport_error(e),
            })?;
        let ack = pending.await.map_err(|e| match e.kind() {
            PublishErrorKind::StreamNotFound => ClusterError::StreamNotFound(subject.to_string()),
            _ => transport_error(e),
        })?;
        Ok(ack.sequence)
    }

    async fn stream_subscribe(
        &self,
        stream: &str,
        policy: DeliverPolicy,
    ) -> Result<StreamSubscription> {
        self.ensure_open()?;

        let handle = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(|e| stream_error(stream, e))?;

        let deliver_policy = match policy {
            DeliverPolicy::All => JetStreamDeliverPolicy::All,
            DeliverPolicy::StartSequence(start_sequence) => {
                JetStreamDeliverPolicy::ByStartSequence { start_sequence }
            }
            DeliverPolicy::New => JetStreamDeliverPolicy::New,
        };

        let consumer = handle
            .create_consumer(OrderedConfig {
                deliver_subject: self.client.new_inbox(),
                deliver_policy,
                ..Default::default()
            })
            .await
            .map_err(transport_error)?;
        let mut records = consumer.messages().await.map_err(transport_error)?;

        let (sender, messages) = mpsc::unbounded_channel();
        let stream_name = stream.to_string();
        let task = tokio::spawn(async move {
            while let Some(record) = records.next().await {
                let record = match record {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(stream = %stream_name, error = %e, "Stream consumer error");
                        continue;
                    }
                };
                let sequence = match record.info() {
                    Ok(info) => info.stream_sequence,
                    Err(e) => {
                        warn!(stream = %stream_name, error = %e, "Record without stream metadata");
                        continue;
                    }
                };
                let forwarded = StreamMessage {
                    subject: record.subject.to_string(),
                    payload: record.payload.clone(),
                    sequence,
                };
                if sender.send(forwarded).is_err() {
                    break;
                }
            }
        });

        let id = self.register(task).await;
        debug!(subscription_id = id, stream = %stream, ?policy, "Stream subscribed");
        Ok(StreamSubscription { id, messages })
    }

    async fn delete_stream(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.jetstream
            .delete_stream(name)
            .await
            .map_err(|e| stream_error(name, e))?;
        debug!(stream = %name, "Stream deleted");
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for (_, task) in self.forwarders.lock().await.drain() {
            task.abort();
        }
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "Failed to flush NATS connection on close");
        }
    }
}

fn transport_error(e: impl Display) -> ClusterError {
    ClusterError::Transport(e.to_string())
}

/// JetStream reports a missing stream as an API error with this description.
fn is_stream_not_found(message: &str) -> bool {
    message.contains("stream not found")
}

fn stream_error(stream: &str, e: impl Display) -> ClusterError {
    let message = e.to_string();
    if is_stream_not_found(&message) {
        ClusterError::StreamNotFound(stream.to_string())
    } else {
        ClusterError::Transport(message)
    }
}
