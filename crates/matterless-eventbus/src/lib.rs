// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process event bus.
//!
//! Subscribers register a pattern where `*` matches any (possibly empty)
//! span of characters. Publishing invokes every matching callback
//! synchronously on the publisher's thread. [`LocalEventBus::call`] layers
//! request/response on top by injecting a unique `$response_event` name into
//! the request that responders publish their answer to.

mod error;

pub use error::{EventBusError, Result};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use regex::Regex;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, error};
use uuid::Uuid;

/// Key injected into [`LocalEventBus::call`] requests naming the response event.
pub const RESPONSE_EVENT_KEY: &str = "$response_event";

/// Callback invoked with `(event_name, event_data)`.
pub type Callback = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Identifies one registration made with [`LocalEventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    pattern: String,
    matcher: Regex,
    callback: Callback,
}

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<Subscriber>>,
}

/// Cheaply cloneable handle to a shared in-process bus.
#[derive(Clone, Default)]
pub struct LocalEventBus {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LocalEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Compile a `*` pattern into an anchored regex. Everything else is literal.
pub fn pattern_to_regex(pattern: &str) -> Regex {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join("(.*)");
    // Escaped literals joined by groups always compile.
    Regex::new(&format!("^{body}$")).unwrap_or_else(|_| unreachable!("escaped pattern"))
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for events whose name matches `pattern`.
    pub fn subscribe<F>(&self, pattern: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let subscriber = Subscriber {
            id,
            pattern: pattern.to_string(),
            matcher: pattern_to_regex(pattern),
            callback: Arc::new(callback),
        };
        self.write_subscribers().push(subscriber);
        id
    }

    /// Remove one registration. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.write_subscribers();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Remove every registration whose *pattern text* matches `pattern`.
    ///
    /// `unsubscribe_all_matching_pattern("app:*")` drops subscriptions made
    /// for `app:start`, `app:*` and so on.
    pub fn unsubscribe_all_matching_pattern(&self, pattern: &str) -> usize {
        let matcher = pattern_to_regex(pattern);
        let mut subscribers = self.write_subscribers();
        let before = subscribers.len();
        subscribers.retain(|s| !matcher.is_match(&s.pattern));
        let removed = before - subscribers.len();
        debug!(pattern = %pattern, removed, "Unsubscribed matching pattern");
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver an event to every matching subscriber on the current thread.
    ///
    /// Callbacks run outside the subscriber lock, so they may subscribe,
    /// unsubscribe or publish themselves.
    pub fn publish(&self, event_name: &str, event_data: &Value) {
        let matching: Vec<Callback> = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.matcher.is_match(event_name))
            .map(|s| s.callback.clone())
            .collect();

        for callback in matching {
            callback(event_name, event_data);
        }
    }

    /// Publish on a Tokio task. Must be called from within a runtime.
    pub fn publish_async(&self, event_name: &str, event_data: Value) {
        let bus = self.clone();
        let event_name = event_name.to_string();
        tokio::spawn(async move {
            bus.publish(&event_name, &event_data);
        });
    }

    /// Publish a request and wait for a responder to call [`respond`](Self::respond).
    pub async fn call(
        &self,
        event_name: &str,
        mut event_data: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let response_event = format!("resp:{}", Uuid::new_v4());
        event_data.insert(
            RESPONSE_EVENT_KEY.to_string(),
            Value::String(response_event.clone()),
        );

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let subscription = self.subscribe(&response_event, move |_, data| {
            if let Some(tx) = tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = tx.send(data.clone());
            }
        });

        self.publish_async(event_name, Value::Object(event_data));

        let outcome = tokio::time::timeout(timeout, rx).await;
        self.unsubscribe(subscription);

        match outcome {
            Ok(Ok(response)) => Ok(response),
            _ => Err(EventBusError::Timeout {
                event: event_name.to_string(),
                timeout,
            }),
        }
    }

    /// Answer a request produced by [`call`](Self::call).
    ///
    /// Requests without a string `$response_event` are logged and ignored.
    pub fn respond(&self, request: &Value, response: &Value) {
        match request.get(RESPONSE_EVENT_KEY) {
            Some(Value::String(response_event)) => self.publish(response_event, response),
            Some(other) => error!(value = %other, "$response_event is not a string"),
            None => error!(request = %request, "No $response_event in request"),
        }
    }

    fn write_subscribers(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Subscriber>> {
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
