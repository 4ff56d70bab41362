// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replicated store over a real NATS server.
//!
//! Each replica gets its own connection, so writes travel through
//! JetStream rather than an in-process log. Requires `TEST_NATS_URL`.

#![cfg(feature = "nats")]

use std::sync::Arc;
use std::time::Duration;

use matterless_cluster::{NatsTransport, Transport};
use matterless_store::{MemoryStore, ReplicatedStore, Store};
use serde_json::json;

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replicas_on_separate_connections_converge() {
    let Ok(url) = std::env::var("TEST_NATS_URL") else {
        eprintln!("Skipping test: TEST_NATS_URL not set");
        return;
    };
    let stream = format!("kv{}", uuid::Uuid::new_v4().simple());

    let mut transports: Vec<Arc<dyn Transport>> = Vec::new();
    let mut replicas = Vec::new();
    for _ in 0..2 {
        let transport: Arc<dyn Transport> = Arc::new(NatsTransport::connect(&url).await.unwrap());
        let replica =
            ReplicatedStore::new(transport.clone(), stream.clone(), Arc::new(MemoryStore::new()))
                .await
                .unwrap();
        replica.connect(TIMEOUT).await.unwrap();
        transports.push(transport);
        replicas.push(replica);
    }

    replicas[0].put("name", json!("Pete")).await.unwrap();
    replicas[0].put("gone", json!(true)).await.unwrap();
    replicas[0].delete("gone").await.unwrap();

    replicas[1].sync(TIMEOUT).await.unwrap();
    assert_eq!(replicas[1].get("name").await.unwrap(), Some(json!("Pete")));
    assert_eq!(replicas[1].get("gone").await.unwrap(), None);

    for replica in &replicas {
        replica.disconnect().await;
    }
    transports[0].delete_stream(&stream).await.unwrap();
    for transport in transports {
        transport.close().await;
    }
}
