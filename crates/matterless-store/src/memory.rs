// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory store.

use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{QueryResult, Result, Store};

/// Ordered in-memory store. Contents are lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn query_range(&self, start: &str, end: &str) -> Result<Vec<QueryResult>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let entries = self.entries.read().await;
        Ok(entries
            .range::<str, _>((Bound::Included(start), Bound::Excluded(end)))
            .map(|(key, value)| QueryResult {
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    async fn query_prefix(&self, prefix: &str) -> Result<Vec<QueryResult>> {
        let entries = self.entries.read().await;
        Ok(entries
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| QueryResult {
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn delete_store(&self) -> Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        for (key, value) in [
            ("person:1", json!({"name": "John"})),
            ("person:2", json!({"name": "Jane"})),
            ("pet:1", json!({"name": "Rex"})),
            ("z", json!(null)),
        ] {
            store.put(key, value).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        assert_eq!(store.get("name").await.unwrap(), None);

        store.put("name", json!("Pete")).await.unwrap();
        assert_eq!(store.get("name").await.unwrap(), Some(json!("Pete")));

        store.delete("name").await.unwrap();
        store.delete("name").await.unwrap();
        assert_eq!(store.get("name").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_query_prefix_is_ordered() {
        let store = seeded().await;
        let people = store.query_prefix("person:").await.unwrap();
        let keys: Vec<_> = people.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, ["person:1", "person:2"]);
        assert_eq!(people[0].value["name"], "John");
    }

    #[tokio::test]
    async fn test_query_range_is_half_open() {
        let store = seeded().await;
        assert_eq!(store.query_range("person:", "person:~").await.unwrap().len(), 2);
        assert_eq!(store.query_range("person:1", "person:2").await.unwrap().len(), 1);
        assert!(store.query_range("z", "a").await.unwrap().is_empty());
        assert!(store.query_range("pet:1", "pet:1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_prefix_stops_at_first_non_match() {
        let store = seeded().await;
        let pets = store.query_prefix("pet").await.unwrap();
        assert_eq!(pets.len(), 1);
        assert_eq!(pets[0].key, "pet:1");
        assert!(store.query_prefix("zz").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_store_clears_everything() {
        let store = seeded().await;
        store.delete_store().await.unwrap();
        assert!(store.is_empty().await);
    }
}
