// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process transport.
//!
//! Every clone of a [`MemoryTransport`] shares the same broker state, so a
//! set of cluster components in one process can talk to each other as if
//! they were connected to the same message server.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use super::{
    DeliverPolicy, Message, RawSubscription, StreamConfig, StreamMessage, StreamSubscription,
    SubscriptionId, Transport,
};
use crate::error::{ClusterError, Result};
use crate::subject::subject_matches;

struct Subscriber {
    pattern: String,
    queue_group: Option<String>,
    sender: mpsc::UnboundedSender<Message>,
}

struct Stream {
    config: StreamConfig,
    records: Vec<StreamMessage>,
}

impl Stream {
    fn captures(&self, subject: &str) -> bool {
        self.config
            .subjects
            .iter()
            .any(|pattern| subject_matches(pattern, subject))
    }
}

struct StreamConsumer {
    stream: String,
    sender: mpsc::UnboundedSender<StreamMessage>,
}

#[derive(Default)]
struct BrokerState {
    closed: bool,
    next_id: SubscriptionId,
    subscribers: HashMap<SubscriptionId, Subscriber>,
    streams: HashMap<String, Stream>,
    consumers: HashMap<SubscriptionId, StreamConsumer>,
}

impl BrokerState {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(ClusterError::Closed)
        } else {
            Ok(())
        }
    }

    fn allocate_id(&mut self) -> SubscriptionId {
        self.next_id += 1;
        self.next_id
    }

    /// Fan a message out: every plain subscriber, one random member per group.
    fn dispatch(&mut self, message: Message) {
        let mut groups: HashMap<&str, Vec<&mpsc::UnboundedSender<Message>>> = HashMap::new();

        for subscriber in self.subscribers.values() {
            if subscriber.sender.is_closed() || !subject_matches(&subscriber.pattern, &message.subject)
            {
                continue;
            }
            match &subscriber.queue_group {
                Some(group) => groups.entry(group.as_str()).or_default().push(&subscriber.sender),
                None => {
                    let _ = subscriber.sender.send(message.clone());
                }
            }
        }

        let mut rng = rand::thread_rng();
        for members in groups.values() {
            let chosen = members[rng.gen_range(0..members.len())];
            let _ = chosen.send(message.clone());
        }

        self.subscribers.retain(|_, s| !s.sender.is_closed());
    }
}

/// Broker living inside the current process.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held by `stream`.
    pub async fn stream_len(&self, stream: &str) -> Option<usize> {
        let state = self.state.lock().await;
        state.streams.get(stream).map(|s| s.records.len())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        state.dispatch(Message {
            subject: subject.to_string(),
            payload,
            reply: None,
        });
        Ok(())
    }

    async fn publish_request(&self, subject: &str, reply: &str, payload: Bytes) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        state.dispatch(Message {
            subject: subject.to_string(),
            payload,
            reply: Some(reply.to_string()),
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<RawSubscription> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;

        let id = state.allocate_id();
        let (sender, messages) = mpsc::unbounded_channel();
        state.subscribers.insert(
            id,
            Subscriber {
                pattern: subject.to_string(),
                queue_group: queue_group.map(str::to_string),
                sender,
            },
        );
        debug!(subscription_id = id, subject = %subject, queue_group = ?queue_group, "Subscribed");

        Ok(RawSubscription { id, messages })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.subscribers.remove(&id);
        state.consumers.remove(&id);
        Ok(())
    }

    async fn add_stream(&self, config: StreamConfig) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        if !state.streams.contains_key(&config.name) {
            debug!(stream = %config.name, subjects = ?config.subjects, "Stream created");
            state.streams.insert(
                config.name.clone(),
                Stream {
                    config,
                    records: Vec::new(),
                },
            );
        }
        Ok(())
    }

    async fn stream_publish(&self, subject: &str, payload: Bytes) -> Result<u64> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;

        let stream = state
            .streams
            .values_mut()
            .find(|s| s.captures(subject))
            .ok_or_else(|| ClusterError::StreamNotFound(subject.to_string()))?;

        let record = StreamMessage {
            subject: subject.to_string(),
            payload: payload.clone(),
            sequence: stream.records.len() as u64 + 1,
        };
        stream.records.push(record.clone());
        let stream_name = stream.config.name.clone();
        let sequence = record.sequence;

        state.consumers.retain(|_, c| !c.sender.is_closed());
        for consumer in state.consumers.values() {
            if consumer.stream == stream_name {
                let _ = consumer.sender.send(record.clone());
            }
        }

        // Stream subjects are ordinary subjects too.
        state.dispatch(Message {
            subject: subject.to_string(),
            payload,
            reply: None,
        });

        Ok(sequence)
    }

    async fn stream_subscribe(
        &self,
        stream: &str,
        policy: DeliverPolicy,
    ) -> Result<StreamSubscription> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;

        let (sender, messages) = mpsc::unbounded_channel();
        let records = &state
            .streams
            .get(stream)
            .ok_or_else(|| ClusterError::StreamNotFound(stream.to_string()))?
            .records;

        let start = match policy {
            DeliverPolicy::All => 0,
            DeliverPolicy::StartSequence(seq) => seq.saturating_sub(1) as usize,
            DeliverPolicy::New => records.len(),
        };
        // Replay and registration happen under one lock: no record is missed or duplicated.
        for record in records.iter().skip(start) {
            let _ = sender.send(record.clone());
        }

        let id = state.allocate_id();
        state.consumers.insert(
            id,
            StreamConsumer {
                stream: stream.to_string(),
                sender,
            },
        );
        debug!(subscription_id = id, stream = %stream, ?policy, "Stream subscribed");

        Ok(StreamSubscription { id, messages })
    }

    async fn delete_stream(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        state
            .streams
            .remove(name)
            .ok_or_else(|| ClusterError::StreamNotFound(name.to_string()))?;
        state.consumers.retain(|_, c| c.stream != name);
        debug!(stream = %name, "Stream deleted");
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.subscribers.clear();
        state.consumers.clear();
    }
}
