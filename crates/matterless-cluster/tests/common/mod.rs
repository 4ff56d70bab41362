// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for cluster integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use matterless_cluster::{ClusterEventBus, MemoryTransport, Transport};
use tracing_subscriber::EnvFilter;

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A bus on a fresh in-process transport.
pub fn memory_bus(prefix: &str) -> (Arc<dyn Transport>, ClusterEventBus) {
    let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
    let bus = ClusterEventBus::new(transport.clone(), prefix);
    (transport, bus)
}

/// Skip the test when no NATS server is configured through `TEST_NATS_URL`.
#[macro_export]
macro_rules! skip_if_no_nats {
    () => {
        if std::env::var("TEST_NATS_URL").is_err() {
            eprintln!("Skipping test: TEST_NATS_URL not set");
            return;
        }
    };
}

/// A prefix unique to one test run, so runs sharing a server do not collide.
pub fn unique_prefix(name: &str) -> String {
    format!("{name}{}", uuid::Uuid::new_v4().simple())
}
