// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster-wide event bus.
//!
//! Wraps a [`Transport`] and scopes every subject under `<prefix>.`. Offers
//! broadcast pub/sub, competing-consumer queue groups, and request/reply RPC
//! including the function invocation protocol:
//!
//! - request: `{"Data": <event>}` on `<prefix>.function.<name>`
//! - response: `{"IsError": bool, "Error": string, "Data": <result>}`
//!
//! Function workers share the queue group `<prefix>.function.<name>.workers`,
//! so each invocation is answered by exactly one worker. A worker that dies
//! before replying shows up as a timeout on the caller side; nothing retries.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::model::{
    ClusterInfo, EVENT_FETCH_NODE_INFO, EVENT_RESTART_APP, EVENT_START_JOB_WORKER,
    FetchNodeInfo, FunctionInvoke, FunctionResult, LogMessage, NodeInfo, PublishEvent, RestartApp,
    StartJobWorker,
};
use crate::subject::{prefixed, safe_subject, strip_prefix};
use crate::transport::{Message, RawSubscription, SubscriptionId, Transport};

/// Handle to a callback-driven subscription.
///
/// Dropping the handle leaves the subscription running; call
/// [`Subscription::unsubscribe`] to stop it.
pub struct Subscription {
    id: SubscriptionId,
    transport: Arc<dyn Transport>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Stop delivery and the dispatch task.
    pub async fn unsubscribe(self) -> Result<()> {
        self.task.abort();
        self.transport.unsubscribe(self.id).await
    }
}

/// Prefix-scoped pub/sub and RPC over a shared transport.
#[derive(Clone)]
pub struct ClusterEventBus {
    transport: Arc<dyn Transport>,
    prefix: String,
    request_timeout: Duration,
}

impl ClusterEventBus {
    pub fn new(transport: Arc<dyn Transport>, prefix: impl Into<String>) -> Self {
        Self {
            transport,
            prefix: prefix.into(),
            request_timeout: ClusterConfig::default().request_timeout,
        }
    }

    /// Build from a [`ClusterConfig`], taking the prefix and RPC timeout from it.
    pub fn from_config(transport: Arc<dyn Transport>, config: &ClusterConfig) -> Self {
        Self::new(transport, config.cluster_prefix.clone()).with_request_timeout(config.request_timeout)
    }

    /// Timeout used by [`ClusterEventBus::invoke_function`].
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Full subject for a logical name.
    pub fn subject(&self, name: &str) -> String {
        prefixed(&self.prefix, name)
    }

    /// Fire-and-forget broadcast.
    pub async fn publish(&self, name: &str, payload: Bytes) -> Result<()> {
        self.transport.publish(&self.subject(name), payload).await
    }

    /// Send `payload` and wait up to `timeout` for the first reply.
    pub async fn request(&self, name: &str, payload: Bytes, timeout: Duration) -> Result<Message> {
        self.transport
            .request(&self.subject(name), payload, timeout)
            .await
    }

    /// Answer a request received through a subscription.
    ///
    /// Messages published without a reply subject are ignored.
    pub async fn respond(&self, request: &Message, payload: Bytes) -> Result<()> {
        match &request.reply {
            Some(reply) => self.transport.publish(reply, payload).await,
            None => {
                debug!(subject = %request.subject, "Respond called on message without reply subject");
                Ok(())
            }
        }
    }

    /// Broadcast subscription: every subscriber sees every matching message.
    pub async fn subscribe<F, Fut>(&self, name: &str, callback: F) -> Result<Subscription>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let raw = self.subscribe_raw(name, None).await?;
        Ok(self.spawn_dispatch(raw, callback))
    }

    /// Competing-consumer subscription: one member of `group` gets each message.
    pub async fn queue_subscribe<F, Fut>(
        &self,
        name: &str,
        group: &str,
        callback: F,
    ) -> Result<Subscription>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let raw = self.subscribe_raw(name, Some(group)).await?;
        Ok(self.spawn_dispatch(raw, callback))
    }

    /// Channel-based subscription for callers that run their own receive loop.
    ///
    /// Both `name` and `group` are scoped under the prefix.
    pub async fn subscribe_raw(&self, name: &str, group: Option<&str>) -> Result<RawSubscription> {
        let group = group.map(|g| self.subject(g));
        self.transport
            .subscribe(&self.subject(name), group.as_deref())
            .await
    }

    fn spawn_dispatch<F, Fut>(&self, raw: RawSubscription, callback: F) -> Subscription
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let RawSubscription { id, mut messages } = raw;
        let task = tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                callback(message).await;
            }
        });
        Subscription {
            id,
            transport: self.transport.clone(),
            task,
        }
    }

    async fn publish_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish(name, Bytes::from(payload)).await
    }

    async fn respond_json<T: Serialize>(&self, request: &Message, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.respond(request, Bytes::from(payload)).await
    }

    // ------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------

    /// Invoke a function on whichever worker picks it up.
    ///
    /// Returns [`ClusterError::RemoteHandler`] carrying the worker's error
    /// message when the handler failed, and [`ClusterError::Timeout`] when no
    /// worker answered within the configured request timeout.
    pub async fn invoke_function(&self, name: &str, event: Value) -> Result<Value> {
        let payload = serde_json::to_vec(&FunctionInvoke { data: event })?;
        let reply = self
            .request(
                &format!("function.{}", safe_subject(name)),
                Bytes::from(payload),
                self.request_timeout,
            )
            .await?;

        let result: FunctionResult = serde_json::from_slice(&reply.payload)?;
        if result.is_error {
            return Err(ClusterError::RemoteHandler(result.error));
        }
        Ok(result.data)
    }

    /// Register a worker for a function.
    ///
    /// Handler failures and undecodable requests are reported back to the
    /// caller inside the response envelope.
    pub async fn subscribe_invoke_function<F, Fut>(
        &self,
        name: &str,
        handler: F,
    ) -> Result<Subscription>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let safe = safe_subject(name);
        let bus = self.clone();
        self.queue_subscribe(
            &format!("function.{safe}"),
            &format!("function.{safe}.workers"),
            move |message: Message| {
                let bus = bus.clone();
                let pending = serde_json::from_slice::<FunctionInvoke>(&message.payload)
                    .map(|request| handler(request.data));
                async move {
                    let result = match pending {
                        Ok(call) => match call.await {
                            Ok(data) => FunctionResult::ok(data),
                            Err(e) => FunctionResult::error(e.to_string()),
                        },
                        Err(e) => {
                            error!(error = %e, subject = %message.subject, "Could not decode function request");
                            FunctionResult::error(e.to_string())
                        }
                    };
                    if let Err(e) = bus.respond_json(&message, &result).await {
                        error!(error = %e, subject = %message.subject, "Could not send function response");
                    }
                }
            },
        )
        .await
    }

    // ------------------------------------------------------------------
    // Named events
    // ------------------------------------------------------------------

    /// Broadcast a named event as `{"name", "data"}`.
    pub async fn publish_event(&self, name: &str, data: Value) -> Result<()> {
        self.publish_json(
            &safe_subject(name),
            &PublishEvent {
                name: name.to_string(),
                data,
            },
        )
        .await
    }

    /// Send a named event as a request and wait for the reply.
    pub async fn request_event(&self, name: &str, data: Value, timeout: Duration) -> Result<Message> {
        let payload = serde_json::to_vec(&PublishEvent {
            name: name.to_string(),
            data,
        })?;
        self.request(&safe_subject(name), Bytes::from(payload), timeout)
            .await
    }

    /// Receive named events whose subject matches `pattern`.
    ///
    /// The callback gets the event name, its data and the raw message (for replying).
    pub async fn subscribe_event<F, Fut>(&self, pattern: &str, callback: F) -> Result<Subscription>
    where
        F: Fn(String, Value, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(&safe_subject(pattern), event_dispatcher(callback))
            .await
    }

    /// Like [`ClusterEventBus::subscribe_event`] but load-balanced over `<pattern>.workers`.
    pub async fn queue_subscribe_event<F, Fut>(
        &self,
        pattern: &str,
        callback: F,
    ) -> Result<Subscription>
    where
        F: Fn(String, Value, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let safe = safe_subject(pattern);
        self.queue_subscribe(&safe, &format!("{safe}.workers"), event_dispatcher(callback))
            .await
    }

    // ------------------------------------------------------------------
    // Logs
    // ------------------------------------------------------------------

    /// Publish a log line for a function on `<function>.log`.
    pub async fn publish_log(&self, function: &str, message: &str) -> Result<()> {
        let data = serde_json::to_value(LogMessage {
            function: function.to_string(),
            message: message.to_string(),
        })?;
        self.publish_event(&format!("{}.log", safe_subject(function)), data)
            .await
    }

    /// Follow the logs of a single function. Callback gets `(function, message)`.
    pub async fn subscribe_logs<F>(&self, function: &str, callback: F) -> Result<Subscription>
    where
        F: Fn(String, String) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        self.subscribe_event(&format!("{}.log", safe_subject(function)), move |_, data, _| {
            let callback = callback.clone();
            async move {
                match serde_json::from_value::<LogMessage>(data) {
                    Ok(log) => callback(log.function, log.message),
                    Err(e) => error!(error = %e, "Could not decode log message"),
                }
            }
        })
        .await
    }

    /// Follow the logs of every function of every app (`*.*.log`).
    ///
    /// Callback gets `(app, function, message)`; the app is the first
    /// subject token after the prefix.
    pub async fn subscribe_all_logs<F>(&self, callback: F) -> Result<Subscription>
    where
        F: Fn(String, String, String) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        let prefix = self.prefix.clone();
        self.subscribe("*.*.log", move |message: Message| {
            let callback = callback.clone();
            let app = strip_prefix(&prefix, &message.subject)
                .split('.')
                .next()
                .unwrap_or_default()
                .to_string();
            async move {
                let event = match serde_json::from_slice::<PublishEvent>(&message.payload) {
                    Ok(event) => event,
                    Err(e) => {
                        error!(error = %e, subject = %message.subject, "Could not decode log event");
                        return;
                    }
                };
                match serde_json::from_value::<LogMessage>(event.data) {
                    Ok(log) => callback(app, log.function, log.message),
                    Err(e) => error!(error = %e, "Could not decode log message"),
                }
            }
        })
        .await
    }

    // ------------------------------------------------------------------
    // Cluster introspection, jobs and restarts
    // ------------------------------------------------------------------

    /// Ask every node to describe itself and collect answers for `wait`.
    pub async fn fetch_cluster_info(&self, wait: Duration) -> Result<ClusterInfo> {
        let reply_to = format!("clusterinfo.{}", Uuid::new_v4().simple());
        let mut replies = self.subscribe_raw(&reply_to, None).await?;

        let outcome = self
            .publish_json(EVENT_FETCH_NODE_INFO, &FetchNodeInfo {
                reply_to: reply_to.clone(),
            })
            .await;
        if let Err(e) = outcome {
            let _ = self.transport.unsubscribe(replies.id).await;
            return Err(e);
        }

        tokio::time::sleep(wait).await;
        self.transport.unsubscribe(replies.id).await?;

        let mut info = ClusterInfo::default();
        while let Some(message) = replies.messages.recv().await {
            match serde_json::from_slice::<NodeInfo>(&message.payload) {
                Ok(node) => {
                    info.nodes.insert(node.id, node);
                }
                Err(e) => warn!(error = %e, "Could not decode node info"),
            }
        }
        Ok(info)
    }

    /// Answer cluster introspection requests with the callback's [`NodeInfo`].
    pub async fn subscribe_fetch_cluster_info<F>(&self, callback: F) -> Result<Subscription>
    where
        F: Fn() -> NodeInfo + Send + Sync + 'static,
    {
        let bus = self.clone();
        let callback = Arc::new(callback);
        self.subscribe(EVENT_FETCH_NODE_INFO, move |message: Message| {
            let bus = bus.clone();
            let callback = callback.clone();
            async move {
                let request = match serde_json::from_slice::<FetchNodeInfo>(&message.payload) {
                    Ok(request) => request,
                    Err(e) => {
                        error!(error = %e, "Could not decode fetch node info request");
                        return;
                    }
                };
                if let Err(e) = bus.publish_json(&request.reply_to, &callback()).await {
                    error!(error = %e, "Could not publish node info");
                }
            }
        })
        .await
    }

    /// Ask for `n` job workers for `name`, one competing request at a time.
    pub async fn request_job_workers(&self, name: &str, n: usize, timeout: Duration) -> Result<()> {
        let payload = Bytes::from(serde_json::to_vec(&StartJobWorker {
            name: name.to_string(),
        })?);
        for _ in 0..n {
            self.request(EVENT_START_JOB_WORKER, payload.clone(), timeout)
                .await?;
        }
        Ok(())
    }

    /// Volunteer to start job workers. Answers with an empty reply once the callback returns.
    pub async fn subscribe_request_job_worker<F>(&self, callback: F) -> Result<Subscription>
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let bus = self.clone();
        let callback = Arc::new(callback);
        self.queue_subscribe(
            EVENT_START_JOB_WORKER,
            &format!("{EVENT_START_JOB_WORKER}.workers"),
            move |message: Message| {
                let bus = bus.clone();
                let callback = callback.clone();
                async move {
                    match serde_json::from_slice::<StartJobWorker>(&message.payload) {
                        Ok(request) => callback(request.name),
                        Err(e) => {
                            error!(error = %e, "Could not decode start job worker request");
                            return;
                        }
                    }
                    if let Err(e) = bus.respond(&message, Bytes::new()).await {
                        error!(error = %e, "Could not acknowledge job worker request");
                    }
                }
            },
        )
        .await
    }

    /// Broadcast that an application should be restarted on every node.
    pub async fn restart_app(&self, name: &str) -> Result<()> {
        self.publish_json(EVENT_RESTART_APP, &RestartApp {
            name: name.to_string(),
        })
        .await
    }

    pub async fn subscribe_restart_app<F>(&self, callback: F) -> Result<Subscription>
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        self.subscribe(EVENT_RESTART_APP, move |message: Message| {
            let callback = callback.clone();
            async move {
                match serde_json::from_slice::<RestartApp>(&message.payload) {
                    Ok(restart) => callback(restart.name),
                    Err(e) => error!(error = %e, "Could not decode restart app message"),
                }
            }
        })
        .await
    }
}

type EventFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Adapt a `(name, data, message)` callback to raw message delivery.
fn event_dispatcher<F, Fut>(callback: F) -> impl Fn(Message) -> EventFuture + Send + Sync + 'static
where
    F: Fn(String, Value, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    move |message: Message| -> EventFuture {
        let decoded = serde_json::from_slice::<PublishEvent>(&message.payload);
        match decoded {
            Ok(event) => Box::pin(callback(event.name, event.data, message)),
            Err(e) => {
                error!(error = %e, subject = %message.subject, "Could not decode event");
                Box::pin(std::future::ready(()))
            }
        }
    }
}
