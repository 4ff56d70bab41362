// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Store decorator that announces mutations on a local event bus.
//!
//! After a successful write the wrapped store's caller is not blocked on
//! listeners; events are published asynchronously:
//!
//! - `store:put:<key>` with `{"key", "new_value"}`
//! - `store:del:<key>` with `{"key"}`

use async_trait::async_trait;
use matterless_eventbus::LocalEventBus;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{QueryResult, Result, Store};

/// Payload of a `store:put:<key>` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutEvent {
    pub key: String,
    pub new_value: Value,
}

/// Payload of a `store:del:<key>` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteEvent {
    pub key: String,
}

pub struct EventedStore<S> {
    inner: S,
    bus: LocalEventBus,
}

impl<S: Store> EventedStore<S> {
    pub fn new(inner: S, bus: LocalEventBus) -> Self {
        Self { inner, bus }
    }

    pub fn event_bus(&self) -> &LocalEventBus {
        &self.bus
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: Store> Store for EventedStore<S> {
    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.inner.put(key, value.clone()).await?;
        let event = serde_json::to_value(PutEvent {
            key: key.to_string(),
            new_value: value,
        })?;
        self.bus.publish_async(&format!("store:put:{key}"), event);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await?;
        let event = serde_json::to_value(DeleteEvent {
            key: key.to_string(),
        })?;
        self.bus.publish_async(&format!("store:del:{key}"), event);
        Ok(())
    }

    async fn query_range(&self, start: &str, end: &str) -> Result<Vec<QueryResult>> {
        self.inner.query_range(start, end).await
    }

    async fn query_prefix(&self, prefix: &str) -> Result<Vec<QueryResult>> {
        self.inner.query_prefix(prefix).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    async fn delete_store(&self) -> Result<()> {
        self.inner.delete_store().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_mutations_are_announced() {
        let bus = LocalEventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe("store:*", move |name, data| {
            let _ = tx.send((name.to_string(), data.clone()));
        });

        let store = EventedStore::new(MemoryStore::new(), bus);
        store.put("name", json!("Pete")).await.unwrap();
        store.delete("name").await.unwrap();

        let mut events = Vec::new();
        for _ in 0..2 {
            events.push(
                tokio::time::timeout(Duration::from_secs(1), rx.recv())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        events.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(events[0].0, "store:del:name");
        assert_eq!(events[0].1, json!({"key": "name"}));
        assert_eq!(events[1].0, "store:put:name");
        assert_eq!(events[1].1, json!({"key": "name", "new_value": "Pete"}));
        assert_eq!(store.get("name").await.unwrap(), None);
    }
}
