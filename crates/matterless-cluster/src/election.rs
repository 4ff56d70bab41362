// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Heartbeat-gossip leader election.
//!
//! Every node broadcasts `{"NodeID": id}` on the heartbeat subject once per
//! interval `I`. The leader is the smallest node ID heard from within the
//! last `3×I`. A joining node waits up to `3×I` (plus up to `I` of jitter)
//! for a heartbeat; if one arrives it picks a random ID greater than the
//! peer's, otherwise it elects itself with a fresh ID. There is no
//! "who is the leader" request: a joiner learns the leader from heartbeats.
//!
//! The result is a leader *hint*. Partitioned groups of nodes each compute
//! their own leader, so this must not be used as a mutual-exclusion lock.
//!
//! All election state (heartbeat table, own ID, broadcaster) is owned by one
//! actor task. The handle talks to it through a command channel.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::event_bus::ClusterEventBus;
use crate::model::{Heartbeat, NodeId};
use crate::transport::RawSubscription;

/// Default logical subject for election heartbeats.
pub const DEFAULT_HEARTBEAT_SUBJECT: &str = "election.heartbeat";

/// Heartbeats older than this many intervals are stale.
const STALE_AFTER_INTERVALS: u32 = 3;

enum Command {
    Leader(oneshot::Sender<NodeId>),
}

/// Handle to a running election participant.
pub struct LeaderElection {
    commands: mpsc::Sender<Command>,
    id: watch::Receiver<Option<NodeId>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LeaderElection {
    /// Join the election on `heartbeat_name` with broadcast interval `interval`.
    pub async fn start(
        bus: &ClusterEventBus,
        heartbeat_name: &str,
        interval: Duration,
    ) -> Result<Self> {
        let subscription = bus.subscribe_raw(heartbeat_name, None).await?;

        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (id_tx, id_rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        let actor = ElectionActor {
            bus: bus.clone(),
            heartbeat_name: heartbeat_name.to_string(),
            interval,
            stale_after: interval * STALE_AFTER_INTERVALS,
            subscription,
            commands: commands_rx,
            heartbeats: HashMap::new(),
            id: id_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(actor.run());

        Ok(Self {
            commands: commands_tx,
            id: id_rx,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Join using the heartbeat interval from `config` and the default subject.
    pub async fn from_config(bus: &ClusterEventBus, config: &ClusterConfig) -> Result<Self> {
        Self::start(bus, DEFAULT_HEARTBEAT_SUBJECT, config.heartbeat_interval).await
    }

    /// This node's ID, once bootstrap has finished.
    pub fn id(&self) -> Option<NodeId> {
        *self.id.borrow()
    }

    /// Current cluster leader.
    ///
    /// Waits for bootstrap to finish if this node has no ID yet.
    pub async fn leader(&self) -> Result<NodeId> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Leader(tx))
            .await
            .map_err(|_| ClusterError::Closed)?;
        rx.await.map_err(|_| ClusterError::Closed)
    }

    /// True when this node is the current leader. Always false after [`close`](Self::close).
    pub async fn is_leader(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        match self.leader().await {
            Ok(leader) => Some(leader) == self.id(),
            Err(_) => false,
        }
    }

    /// Stop broadcasting, leave the heartbeat subject and wait for the actor to exit.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take()
            && let Err(e) = task.await
        {
            error!(error = %e, "Election task failed");
        }
    }
}

struct ElectionActor {
    bus: ClusterEventBus,
    heartbeat_name: String,
    interval: Duration,
    stale_after: Duration,
    subscription: RawSubscription,
    commands: mpsc::Receiver<Command>,
    heartbeats: HashMap<NodeId, Instant>,
    id: watch::Sender<Option<NodeId>>,
    cancel: CancellationToken,
}

impl ElectionActor {
    async fn run(mut self) {
        if let Some(node_id) = self.bootstrap().await {
            self.serve(node_id).await;
        }

        if let Err(e) = self.bus.transport().unsubscribe(self.subscription.id).await {
            warn!(error = %e, "Failed to leave heartbeat subject");
        }
    }

    /// Obtain an ID. Returns `None` if stopped first.
    async fn bootstrap(&mut self) -> Option<NodeId> {
        let jitter_ms = rand::thread_rng().gen_range(0..=self.interval.as_millis() as u64);
        let deadline = tokio::time::sleep(self.stale_after + Duration::from_millis(jitter_ms));
        tokio::pin!(deadline);

        let mut waiting: Vec<oneshot::Sender<NodeId>> = Vec::new();

        let node_id = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return None,

                message = self.subscription.messages.recv() => {
                    let Some(message) = message else {
                        warn!("Heartbeat subscription closed during bootstrap");
                        return None;
                    };
                    if let Some(peer) = decode_heartbeat(&message.payload) {
                        self.heartbeats.insert(peer, Instant::now());
                        let node_id = generate_node_id(peer);
                        debug!(peer_id = peer, node_id, "Derived node ID from peer heartbeat");
                        break node_id;
                    }
                }

                command = self.commands.recv() => match command {
                    Some(Command::Leader(reply)) => waiting.push(reply),
                    None => return None,
                },

                _ = &mut deadline => {
                    let node_id = generate_node_id(0);
                    debug!(node_id, "No heartbeat seen, electing self");
                    break node_id;
                }
            }
        };

        self.heartbeats.insert(node_id, Instant::now());
        self.id.send_replace(Some(node_id));
        info!(node_id, "Joined leader election");

        let leader = self.current_leader(node_id);
        for reply in waiting {
            let _ = reply.send(leader);
        }
        Some(node_id)
    }

    async fn serve(&mut self, node_id: NodeId) {
        let heartbeat = match serde_json::to_vec(&Heartbeat { node_id }) {
            Ok(payload) => bytes::Bytes::from(payload),
            Err(e) => {
                error!(error = %e, "Could not encode heartbeat");
                return;
            }
        };

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                _ = ticker.tick() => {
                    if let Err(e) = self.bus.publish(&self.heartbeat_name, heartbeat.clone()).await {
                        error!(error = %e, node_id, "Could not broadcast heartbeat");
                    }
                }

                message = self.subscription.messages.recv() => {
                    let Some(message) = message else {
                        warn!(node_id, "Heartbeat subscription closed");
                        break;
                    };
                    if let Some(peer) = decode_heartbeat(&message.payload) {
                        self.heartbeats.insert(peer, Instant::now());
                    }
                }

                command = self.commands.recv() => match command {
                    Some(Command::Leader(reply)) => {
                        let _ = reply.send(self.current_leader(node_id));
                    }
                    None => break,
                },
            }
        }

        info!(node_id, "Left leader election");
    }

    /// Smallest live ID. Evicts stale entries as a side effect.
    fn current_leader(&mut self, node_id: NodeId) -> NodeId {
        let now = Instant::now();
        let stale_after = self.stale_after;
        self.heartbeats.retain(|id, seen| {
            let live = now.duration_since(*seen) <= stale_after;
            if !live {
                info!(evicted_id = *id, "Evicting stale node");
            }
            live
        });
        self.heartbeats
            .keys()
            .copied()
            .min()
            .unwrap_or(node_id)
    }
}

fn decode_heartbeat(payload: &[u8]) -> Option<NodeId> {
    match serde_json::from_slice::<Heartbeat>(payload) {
        Ok(heartbeat) => Some(heartbeat.node_id),
        Err(e) => {
            error!(error = %e, "Could not decode heartbeat");
            None
        }
    }
}

/// Random node ID strictly greater than `min` (saturating at `u64::MAX`).
pub fn generate_node_id(min: NodeId) -> NodeId {
    rand::thread_rng().gen_range(min.saturating_add(1)..=NodeId::MAX)
}
