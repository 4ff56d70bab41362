// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Messaging transport contract.
//!
//! A transport provides subject-based publish/subscribe with wildcard
//! matching, competing-consumer queue groups, and named append-only streams
//! that can be replayed from any position. Everything in the cluster layer is
//! built on this trait; [`MemoryTransport`] implements it in-process and,
//! with the `nats` feature, `NatsTransport` implements it over a NATS server
//! with JetStream.

mod memory;
#[cfg(feature = "nats")]
mod nats;

pub use memory::MemoryTransport;
#[cfg(feature = "nats")]
pub use nats::NatsTransport;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{ClusterError, Result};

/// Identifier of a live subscription, unique per transport.
pub type SubscriptionId = u64;

/// A message delivered on a plain subscription.
#[derive(Debug, Clone)]
pub struct Message {
    /// Concrete subject the message was published on.
    pub subject: String,
    pub payload: Bytes,
    /// Reply subject for request/reply, if the publisher expects an answer.
    pub reply: Option<String>,
}

/// Receiving half of a plain subscription.
#[derive(Debug)]
pub struct RawSubscription {
    pub id: SubscriptionId,
    pub messages: mpsc::UnboundedReceiver<Message>,
}

/// Definition of a named stream and the subjects it captures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
}

/// Where a stream subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverPolicy {
    /// Replay the whole stream.
    All,
    /// Replay starting at this (1-based) sequence number.
    StartSequence(u64),
    /// Only records appended after subscribing.
    New,
}

/// A record read from a stream.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub subject: String,
    pub payload: Bytes,
    /// Transport-assigned position, strictly increasing from 1.
    pub sequence: u64,
}

/// Receiving half of a stream subscription. Records arrive in sequence order.
#[derive(Debug)]
pub struct StreamSubscription {
    pub id: SubscriptionId,
    pub messages: mpsc::UnboundedReceiver<StreamMessage>,
}

/// Messaging substrate used by the cluster event bus, election and store.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish `payload` to every matching subscriber (one per queue group).
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Publish with a reply subject attached.
    async fn publish_request(&self, subject: &str, reply: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to a subject pattern, optionally as a member of a queue group.
    async fn subscribe(&self, subject: &str, queue_group: Option<&str>)
    -> Result<RawSubscription>;

    /// Cancel a plain or stream subscription. Unknown IDs are ignored.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;

    /// Publish on `subject` and wait for the first reply.
    ///
    /// A request nobody answers fails with [`ClusterError::Timeout`].
    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> Result<Message> {
        let inbox = format!("_INBOX.{}", Uuid::new_v4().simple());
        let mut sub = self.subscribe(&inbox, None).await?;

        let outcome = match self.publish_request(subject, &inbox, payload).await {
            Ok(()) => match tokio::time::timeout(timeout, sub.messages.recv()).await {
                Ok(Some(reply)) => Ok(reply),
                Ok(None) => Err(ClusterError::Closed),
                Err(_) => Err(ClusterError::Timeout(timeout)),
            },
            Err(e) => Err(e),
        };

        // The inbox is single-use; failing to drop it must not mask the answer.
        let _ = self.unsubscribe(sub.id).await;
        outcome
    }

    /// Create a stream. Adding an existing stream with the same name is a no-op.
    async fn add_stream(&self, config: StreamConfig) -> Result<()>;

    /// Append to the stream capturing `subject`, returning the new sequence.
    async fn stream_publish(&self, subject: &str, payload: Bytes) -> Result<u64>;

    /// Read a stream from the given position, then follow new records.
    async fn stream_subscribe(
        &self,
        stream: &str,
        policy: DeliverPolicy,
    ) -> Result<StreamSubscription>;

    /// Remove a stream and all its records.
    async fn delete_stream(&self, name: &str) -> Result<()>;

    /// Close the transport. Every later operation fails with [`ClusterError::Closed`].
    async fn close(&self);
}
