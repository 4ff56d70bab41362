// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue configuration.

use std::time::Duration;

use matterless_cluster::config::{ConfigError, duration_ms_var};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a received message stays hidden before it is redelivered.
    pub lease_duration: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional:
    /// - `MLS_QUEUE_LEASE_MS`: lease duration in milliseconds (default: 30000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            lease_duration: duration_ms_var("MLS_QUEUE_LEASE_MS", Self::default().lease_duration)?,
        })
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }
}
