// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Key-value stores for matterless.
//!
//! Every store speaks the same [`Store`] interface over JSON values:
//!
//! - [`MemoryStore`]: ordered in-memory map
//! - [`SqliteStore`]: durable local cache backed by SQLite
//! - [`EventedStore`]: wraps another store and announces mutations on a
//!   [`LocalEventBus`](matterless_eventbus::LocalEventBus)
//! - [`ReplicatedStore`]: replicates mutations through a transport stream
//!   into a local cache, with echo-back write acknowledgment and a sync barrier

pub mod error;
pub mod evented;
pub mod memory;
pub mod replicated;
pub mod sqlite;

pub use error::{Result, StoreError};
pub use evented::EventedStore;
pub use memory::MemoryStore;
pub use replicated::{Change, ChangeSubscription, MalformedRecordPolicy, ReplicatedStore};
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One row of a range or prefix query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub key: String,
    pub value: Value,
}

/// Ordered key-value store over JSON values.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or overwrite `key`.
    async fn put(&self, key: &str, value: Value) -> Result<()>;

    /// Value stored under `key`, or `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Entries with `start <= key < end`, ordered by key.
    async fn query_range(&self, start: &str, end: &str) -> Result<Vec<QueryResult>>;

    /// Entries whose key starts with `prefix`, ordered by key.
    async fn query_prefix(&self, prefix: &str) -> Result<Vec<QueryResult>>;

    /// Release resources. The store must not be used afterwards.
    async fn close(&self) -> Result<()>;

    /// Permanently remove all data held by the store.
    async fn delete_store(&self) -> Result<()>;
}
