// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection hub: owns every live viewer and agent channel.
//!
//! Registry mutations are serialized through a single router task fed by a
//! command channel; envelope routing reads the registries under a read lock
//! from each connection's own pump. All sends go through bounded per-channel
//! queues so the hub never blocks on a slow peer.

pub mod presence;
pub mod pubsub;
pub mod routing;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_protocol::{Envelope, Payload};

use crate::hub::presence::PresenceMap;
use crate::hub::pubsub::PubSub;

/// Per-send deadline on the critical (drain-and-send) path.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to one live connection's outbound queue.
///
/// Cloneable; closing cancels the connection's pumps and releases every
/// blocked operation on the channel.
#[derive(Clone)]
pub struct ChannelHandle {
    id: u64,
    tx: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
}

impl ChannelHandle {
    /// Create a handle plus the receiver its write pump drains.
    pub fn new(queue_depth: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(queue_depth);
        let handle = Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            cancel: CancellationToken::new(),
        };
        (handle, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue an envelope, dropping it (newest-first policy) when the queue
    /// is full. Never blocks.
    pub fn enqueue(&self, envelope: Envelope) -> bool {
        match self.tx.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                warn!(
                    channel = self.id,
                    kind = envelope.payload.kind(),
                    "outbound queue full, dropping envelope"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Drain-and-send slow path for envelopes that must not be dropped
    /// (`terminal:exit`, `session:create`). Waits for queue space up to the
    /// write deadline.
    pub async fn enqueue_critical(&self, envelope: Envelope) -> bool {
        match tokio::time::timeout(WRITE_DEADLINE, self.tx.send(envelope)).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                warn!(channel = self.id, "write deadline exceeded on critical send");
                false
            }
        }
    }

    /// Cancel the connection. Both pumps observe this and exit.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

struct AgentChannel {
    user_id: i64,
    instance_id: String,
    channel: ChannelHandle,
}

#[derive(Default)]
struct Registry {
    /// One user may have several viewers open.
    viewers: HashMap<i64, Vec<ChannelHandle>>,
    /// Exactly one live channel per agent id.
    agents: HashMap<i64, AgentChannel>,
    /// Reverse index: user id -> connected agent ids.
    user_agents: HashMap<i64, HashSet<i64>>,
}

enum Command {
    AddViewer { user_id: i64, channel: ChannelHandle, done: oneshot::Sender<()> },
    RemoveViewer { user_id: i64, channel_id: u64, done: oneshot::Sender<()> },
    AddAgent {
        agent_id: i64,
        user_id: i64,
        instance_id: String,
        channel: ChannelHandle,
        done: oneshot::Sender<()>,
    },
    /// Remove an agent channel if it is still the registered instance.
    /// Replies whether it was (the caller then ends the agent's sessions).
    RemoveAgent { agent_id: i64, channel_id: u64, done: oneshot::Sender<bool> },
    /// Cross-process eviction: another broker instance now owns this agent.
    /// Closes the local channel without presence or session side effects.
    EvictAgent { agent_id: i64, unless_instance: String },
}

pub struct Hub {
    registry: RwLock<Registry>,
    presence: PresenceMap,
    router_tx: mpsc::Sender<Command>,
    pubsub: OnceLock<Arc<PubSub>>,
}

impl Hub {
    /// Create the hub and spawn its registration router task.
    pub fn new(shutdown: CancellationToken) -> Arc<Self> {
        let (router_tx, router_rx) = mpsc::channel(64);
        let hub = Arc::new(Self {
            registry: RwLock::new(Registry::default()),
            presence: PresenceMap::new(),
            router_tx,
            pubsub: OnceLock::new(),
        });
        tokio::spawn(run_router(Arc::clone(&hub), router_rx, shutdown));
        hub
    }

    /// Attach the cross-process fan-out once, at startup.
    pub fn set_pubsub(&self, pubsub: Arc<PubSub>) {
        let _ = self.pubsub.set(pubsub);
    }

    pub fn presence(&self) -> &PresenceMap {
        &self.presence
    }

    // -- Registration (serialized through the router task) --------------------

    pub async fn register_viewer(&self, user_id: i64, channel: ChannelHandle) {
        let (done, wait) = oneshot::channel();
        if self.router_tx.send(Command::AddViewer { user_id, channel, done }).await.is_ok() {
            let _ = wait.await;
        }
    }

    pub async fn unregister_viewer(&self, user_id: i64, channel_id: u64) {
        let (done, wait) = oneshot::channel();
        if self.router_tx.send(Command::RemoveViewer { user_id, channel_id, done }).await.is_ok() {
            let _ = wait.await;
        }
    }

    /// Register an agent channel. Any previous channel for the same agent id
    /// is closed before the new one becomes routable; presence flips online
    /// and `desktop:online` fans out to the owning user's viewers.
    pub async fn register_agent(
        &self,
        agent_id: i64,
        user_id: i64,
        instance_id: String,
        channel: ChannelHandle,
    ) {
        let (done, wait) = oneshot::channel();
        let cmd = Command::AddAgent { agent_id, user_id, instance_id, channel, done };
        if self.router_tx.send(cmd).await.is_ok() {
            let _ = wait.await;
        }
    }

    /// Unregister an agent channel on close. Returns true when the channel
    /// was still the registered instance; the caller is then responsible for
    /// ending the agent's sessions.
    pub async fn unregister_agent(&self, agent_id: i64, channel_id: u64) -> bool {
        let (done, wait) = oneshot::channel();
        if self.router_tx.send(Command::RemoveAgent { agent_id, channel_id, done }).await.is_err() {
            return false;
        }
        wait.await.unwrap_or(false)
    }

    pub(crate) async fn evict_stale_agent(&self, agent_id: i64, unless_instance: String) {
        let _ = self.router_tx.send(Command::EvictAgent { agent_id, unless_instance }).await;
    }

    // -- Delivery -------------------------------------------------------------

    /// Send an envelope to an agent. Local delivery first; when the agent is
    /// not held locally the envelope goes to the pub/sub fallback (if
    /// configured). Returns false when neither path could take it.
    pub async fn send_to_agent(&self, agent_id: i64, envelope: Envelope) -> bool {
        let local = {
            let registry = self.registry.read().await;
            registry.agents.get(&agent_id).map(|a| a.channel.clone())
        };
        match local {
            Some(channel) => {
                if envelope.payload.is_critical() {
                    channel.enqueue_critical(envelope).await
                } else {
                    channel.enqueue(envelope)
                }
            }
            None => match self.pubsub.get() {
                Some(pubsub) => pubsub.publish_agent(agent_id, &envelope).await,
                None => false,
            },
        }
    }

    /// Deliver an envelope to the local channel of an agent, if any.
    /// Used by the pub/sub subscriber; never republished.
    pub(crate) async fn deliver_agent_local(&self, agent_id: i64, envelope: Envelope) -> bool {
        let local = {
            let registry = self.registry.read().await;
            registry.agents.get(&agent_id).map(|a| a.channel.clone())
        };
        match local {
            Some(channel) => {
                if envelope.payload.is_critical() {
                    channel.enqueue_critical(envelope).await
                } else {
                    channel.enqueue(envelope)
                }
            }
            None => false,
        }
    }

    /// Fan an envelope to every viewer of a user, locally and (when
    /// configured) across broker instances.
    pub async fn fan_to_user(&self, user_id: i64, payload: Payload) {
        self.fan_envelope_to_user(user_id, Envelope::new(payload)).await;
    }

    /// Same, for an envelope forwarded verbatim.
    pub async fn fan_envelope_to_user(&self, user_id: i64, envelope: Envelope) {
        self.fan_to_user_local(user_id, &envelope).await;
        if let Some(pubsub) = self.pubsub.get() {
            pubsub.publish_user(user_id, &envelope).await;
        }
    }

    pub(crate) async fn fan_to_user_local(&self, user_id: i64, envelope: &Envelope) {
        let registry = self.registry.read().await;
        if let Some(channels) = registry.viewers.get(&user_id) {
            for channel in channels {
                channel.enqueue(envelope.clone());
            }
        }
    }

    /// Whether the agent's channel is held by this broker process.
    pub async fn agent_is_local(&self, agent_id: i64) -> bool {
        self.registry.read().await.agents.contains_key(&agent_id)
    }

    /// Agent ids currently connected for a user (local registry view).
    pub async fn agents_of_user(&self, user_id: i64) -> Vec<i64> {
        let registry = self.registry.read().await;
        registry.user_agents.get(&user_id).map(|s| s.iter().copied().collect()).unwrap_or_default()
    }

    pub async fn viewer_count(&self, user_id: i64) -> usize {
        self.registry.read().await.viewers.get(&user_id).map(Vec::len).unwrap_or(0)
    }
}

/// Registration router: the only task that mutates the registries.
async fn run_router(hub: Arc<Hub>, mut rx: mpsc::Receiver<Command>, shutdown: CancellationToken) {
    loop {
        let command = tokio::select! {
            _ = shutdown.cancelled() => break,
            cmd = rx.recv() => match cmd {
                Some(c) => c,
                None => break,
            },
        };

        match command {
            Command::AddViewer { user_id, channel, done } => {
                let mut registry = hub.registry.write().await;
                registry.viewers.entry(user_id).or_default().push(channel);
                drop(registry);
                debug!(user_id, "viewer registered");
                let _ = done.send(());
            }

            Command::RemoveViewer { user_id, channel_id, done } => {
                let mut registry = hub.registry.write().await;
                if let Some(channels) = registry.viewers.get_mut(&user_id) {
                    channels.retain(|c| c.id() != channel_id);
                    if channels.is_empty() {
                        registry.viewers.remove(&user_id);
                    }
                }
                drop(registry);
                debug!(user_id, "viewer unregistered");
                let _ = done.send(());
            }

            Command::AddAgent { agent_id, user_id, instance_id, channel, done } => {
                let mut registry = hub.registry.write().await;
                // New instance wins: close the stale channel before the new
                // one becomes routable.
                if let Some(old) = registry.agents.remove(&agent_id) {
                    info!(agent_id, "replacing existing agent channel");
                    old.channel.close();
                }
                registry.agents.insert(
                    agent_id,
                    AgentChannel { user_id, instance_id: instance_id.clone(), channel },
                );
                registry.user_agents.entry(user_id).or_default().insert(agent_id);
                hub.presence.set_online(agent_id, &instance_id);

                let online = Envelope::new(Payload::DesktopOnline { desktop_id: agent_id });
                if let Some(channels) = registry.viewers.get(&user_id) {
                    for viewer in channels {
                        viewer.enqueue(online.clone());
                    }
                }
                drop(registry);

                if let Some(pubsub) = hub.pubsub.get() {
                    pubsub.publish_claim(agent_id, &instance_id).await;
                    pubsub.publish_user(user_id, &online).await;
                }
                info!(agent_id, user_id, "agent registered");
                let _ = done.send(());
            }

            Command::RemoveAgent { agent_id, channel_id, done } => {
                let mut registry = hub.registry.write().await;
                let was_current =
                    registry.agents.get(&agent_id).is_some_and(|a| a.channel.id() == channel_id);
                if !was_current {
                    drop(registry);
                    let _ = done.send(false);
                    continue;
                }
                let Some(agent) = registry.agents.remove(&agent_id) else {
                    drop(registry);
                    let _ = done.send(false);
                    continue;
                };
                let user_id = agent.user_id;
                if let Some(set) = registry.user_agents.get_mut(&user_id) {
                    set.remove(&agent_id);
                    if set.is_empty() {
                        registry.user_agents.remove(&user_id);
                    }
                }
                hub.presence.set_offline(agent_id);

                let offline = Envelope::new(Payload::DesktopOffline { desktop_id: agent_id });
                if let Some(channels) = registry.viewers.get(&user_id) {
                    for viewer in channels {
                        viewer.enqueue(offline.clone());
                    }
                }
                drop(registry);

                if let Some(pubsub) = hub.pubsub.get() {
                    pubsub.publish_user(user_id, &offline).await;
                }
                info!(agent_id, user_id, "agent unregistered");
                let _ = done.send(true);
            }

            Command::EvictAgent { agent_id, unless_instance } => {
                let mut registry = hub.registry.write().await;
                let stale = registry
                    .agents
                    .get(&agent_id)
                    .is_some_and(|a| a.instance_id != unless_instance);
                if stale {
                    if let Some(old) = registry.agents.remove(&agent_id) {
                        if let Some(set) = registry.user_agents.get_mut(&old.user_id) {
                            set.remove(&agent_id);
                        }
                        old.channel.close();
                        info!(agent_id, "evicted agent channel claimed by another broker instance");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "hub_tests.rs"]
mod tests;
