// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! At-least-once message queue on top of a key-value [`Store`](matterless_store::Store).
//!
//! Received messages are leased, not removed: unless acknowledged within
//! the lease they return to the back of the queue with their `Retries`
//! counter incremented. There is no retry limit or dead-letter handling.

pub mod config;
pub mod error;
pub mod local;

pub use config::QueueConfig;
pub use error::{QueueError, Result};
pub use local::LocalQueue;

use std::fmt;

use async_trait::async_trait;
use matterless_eventbus::LocalEventBus;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A fresh random message ID.
pub fn generate_message_id() -> MessageId {
    MessageId(uuid::Uuid::new_v4().to_string())
}

/// A queued message: `{"id": string, "body": any, "Retries": int}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(default)]
    pub body: Value,
    /// Number of times this message has been redelivered after a lease expired.
    #[serde(rename = "Retries", default)]
    pub retries: u32,
}

impl Message {
    /// New message with a generated ID.
    pub fn new(body: Value) -> Self {
        Self::with_id(generate_message_id(), body)
    }

    pub fn with_id(id: impl Into<MessageId>, body: Value) -> Self {
        Self {
            id: id.into(),
            body,
            retries: 0,
        }
    }
}

/// Queue depth snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Stats {
    pub messages_in_queue: usize,
    pub messages_in_flight: usize,
}

/// At-least-once queue.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Persist and enqueue a message at the tail.
    async fn send(&self, message: Message) -> Result<()>;

    /// Lease the message at the head.
    ///
    /// Returns [`QueueError::NoMessage`] immediately when nothing is queued.
    async fn receive(&self) -> Result<Message>;

    /// Acknowledge a leased message, deleting it permanently.
    async fn ack(&self, id: &MessageId) -> Result<()>;

    async fn stats(&self) -> Result<Stats>;

    /// Bus that receives a `"message"` event whenever a message is enqueued.
    fn event_bus(&self) -> &LocalEventBus;

    /// Stop the redelivery loop. Later operations fail with [`QueueError::Closed`].
    async fn close(&self);
}
