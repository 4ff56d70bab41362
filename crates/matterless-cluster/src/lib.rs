// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster coordination primitives for matterless.
//!
//! - [`Transport`]: subject-based messaging with queue groups and replayable
//!   streams ([`MemoryTransport`] runs it in-process; `NatsTransport`, behind
//!   the `nats` feature, spans processes)
//! - [`ClusterEventBus`]: prefix-scoped pub/sub, queue groups and RPC
//! - [`LeaderElection`]: heartbeat-gossip leader hint
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use matterless_cluster::{ClusterEventBus, MemoryTransport};
//! use serde_json::json;
//!
//! # async fn example() -> matterless_cluster::Result<()> {
//! let bus = ClusterEventBus::new(Arc::new(MemoryTransport::new()), "mls");
//! bus.subscribe_invoke_function("greet", |event| async move {
//!     Ok::<_, anyhow::Error>(json!({ "hello": event["name"] }))
//! })
//! .await?;
//!
//! let reply = bus.invoke_function("greet", json!({ "name": "Pete" })).await?;
//! assert_eq!(reply["hello"], "Pete");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod election;
pub mod error;
pub mod event_bus;
pub mod model;
pub mod subject;
pub mod transport;

pub use config::{ClusterConfig, ConfigError};
pub use election::LeaderElection;
pub use error::{ClusterError, Result};
pub use event_bus::{ClusterEventBus, Subscription};
pub use model::NodeId;
pub use transport::{
    DeliverPolicy, MemoryTransport, Message, RawSubscription, StreamConfig, StreamMessage,
    StreamSubscription, SubscriptionId, Transport,
};

#[cfg(feature = "nats")]
pub use transport::NatsTransport;
