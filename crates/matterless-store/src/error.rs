// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for key-value stores.

use std::time::Duration;

use matterless_cluster::ClusterError;
use thiserror::Error;

/// Errors returned by [`Store`](crate::Store) implementations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The transport rejected a publish or subscription.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// The local SQLite cache failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed while opening a SQLite cache.
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A value or log record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error while preparing or removing an on-disk cache.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A write was attempted while the replicated store is not connected.
    #[error("store is not connected")]
    NotConnected,

    /// The store disconnected while a write or sync was waiting.
    #[error("store disconnected while waiting for acknowledgment")]
    Disconnected,

    /// A sync marker was not seen back within the deadline.
    #[error("sync timeout after {0:?}")]
    SyncTimeout(Duration),

    /// A put or delete was not echoed back within the deadline.
    #[error("write not acknowledged after {0:?}")]
    WriteTimeout(Duration),

    /// The key is reserved for replication bookkeeping.
    #[error("key '{0}' is reserved")]
    ReservedKey(String),

    /// The apply loop stopped on a record it could not apply.
    #[error("apply loop halted: {0}")]
    ApplyHalted(String),
}

impl StoreError {
    /// True for sync and write acknowledgment timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::SyncTimeout(_) | Self::WriteTimeout(_))
    }
}

/// Result type using [`StoreError`].
pub type Result<T> = std::result::Result<T, StoreError>;
