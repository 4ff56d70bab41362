// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for cluster messaging and coordination.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the transport, the cluster event bus and leader election.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ClusterError {
    /// Publishing or subscribing on the transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The transport (or the component using it) has been closed.
    #[error("connection closed")]
    Closed,

    /// A request, sync or bootstrap deadline passed without an answer.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// An envelope or record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A remote handler ran and reported a failure.
    ///
    /// Displays as the bare remote message so callers can match on it.
    #[error("{0}")]
    RemoteHandler(String),

    /// The named stream does not exist.
    #[error("stream not found: {0}")]
    StreamNotFound(String),
}

impl ClusterError {
    /// True for [`ClusterError::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

/// Result type using [`ClusterError`].
pub type Result<T> = std::result::Result<T, ClusterError>;
