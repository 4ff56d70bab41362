// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue errors.

use matterless_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// Nothing is waiting. A normal outcome of [`receive`](crate::Queue::receive), not a failure.
    #[error("no message queued")]
    NoMessage,

    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A persisted message, pending list or inflight map could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted lease expiry is not a valid RFC 3339 timestamp.
    #[error("invalid lease expiry '{value}': {source}")]
    InvalidExpiry {
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    /// The queue has been closed.
    #[error("queue closed")]
    Closed,
}

impl QueueError {
    /// True for [`QueueError::NoMessage`].
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::NoMessage)
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
