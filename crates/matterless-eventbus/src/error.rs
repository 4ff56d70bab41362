// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event bus errors.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EventBusError {
    /// Nobody responded to a [`call`](crate::LocalEventBus::call) in time.
    #[error("no response to '{event}' within {timeout:?}")]
    Timeout { event: String, timeout: Duration },
}

pub type Result<T> = std::result::Result<T, EventBusError>;
