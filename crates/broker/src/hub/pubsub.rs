// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cross-process fan-out for multi-instance broker deployments.
//!
//! Two subjects: `{prefix}.users` carries viewer-targeted envelopes keyed by
//! user id, `{prefix}.agents` carries agent-targeted envelopes plus claim
//! records that let another instance close a stale channel when an agent
//! reconnects elsewhere. Every relay carries the origin instance id;
//! own-origin deliveries are dropped so a local peer is never served twice.

use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_protocol::Envelope;

use crate::hub::Hub;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
enum RelayTarget {
    User { user_id: i64 },
    Agent { agent_id: i64 },
    /// An agent registered with the publishing instance; holders of a stale
    /// channel for the same agent id must close it.
    Claim { agent_id: i64, instance_id: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct Relay {
    origin: String,
    #[serde(flatten)]
    target: RelayTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    envelope: Option<Envelope>,
}

pub struct PubSub {
    client: async_nats::Client,
    prefix: String,
    origin: String,
}

impl PubSub {
    /// Connect to the NATS server.
    ///
    /// `origin` is this broker process's instance id, used to filter out
    /// republishes of our own messages.
    pub async fn connect(
        url: &str,
        token: Option<&str>,
        prefix: &str,
        origin: &str,
    ) -> anyhow::Result<Arc<Self>> {
        let mut opts = async_nats::ConnectOptions::new();
        if let Some(token) = token {
            opts = opts.token(token.to_owned());
        }
        opts = opts.retry_on_initial_connect();

        info!(url, prefix, "connecting broker pub/sub");
        let client = opts.connect(url).await?;
        Ok(Arc::new(Self {
            client,
            prefix: prefix.to_owned(),
            origin: origin.to_owned(),
        }))
    }

    fn users_subject(&self) -> String {
        format!("{}.users", self.prefix)
    }

    fn agents_subject(&self) -> String {
        format!("{}.agents", self.prefix)
    }

    async fn publish(&self, subject: String, relay: &Relay) {
        let Ok(payload) = serde_json::to_vec(relay) else {
            return;
        };
        if let Err(e) = self.client.publish(subject, payload.into()).await {
            warn!(err = %e, "pub/sub publish failed");
        }
    }

    /// Relay a viewer-targeted envelope to every other broker instance.
    pub async fn publish_user(&self, user_id: i64, envelope: &Envelope) {
        let relay = Relay {
            origin: self.origin.clone(),
            target: RelayTarget::User { user_id },
            envelope: Some(envelope.clone()),
        };
        self.publish(self.users_subject(), &relay).await;
    }

    /// Relay an agent-targeted envelope; used when the agent's channel is
    /// not held by this process. Returns true when the publish went out.
    pub async fn publish_agent(&self, agent_id: i64, envelope: &Envelope) -> bool {
        let relay = Relay {
            origin: self.origin.clone(),
            target: RelayTarget::Agent { agent_id },
            envelope: Some(envelope.clone()),
        };
        let Ok(payload) = serde_json::to_vec(&relay) else {
            return false;
        };
        match self.client.publish(self.agents_subject(), payload.into()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(err = %e, agent_id, "pub/sub agent publish failed");
                false
            }
        }
    }

    /// Announce that this instance now owns an agent's channel.
    pub async fn publish_claim(&self, agent_id: i64, instance_id: &str) {
        let relay = Relay {
            origin: self.origin.clone(),
            target: RelayTarget::Claim { agent_id, instance_id: instance_id.to_owned() },
            envelope: None,
        };
        self.publish(self.agents_subject(), &relay).await;
    }
}

/// Run the subscriber side: deliver relays from other instances to local
/// registries only (never republished).
pub fn spawn_subscriber(hub: Arc<Hub>, pubsub: Arc<PubSub>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = run_subscriber(hub, pubsub, shutdown).await {
            warn!(err = %e, "pub/sub subscriber failed");
        }
    });
}

async fn run_subscriber(
    hub: Arc<Hub>,
    pubsub: Arc<PubSub>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut users = pubsub.client.subscribe(pubsub.users_subject()).await?;
    let mut agents = pubsub.client.subscribe(pubsub.agents_subject()).await?;
    info!(prefix = %pubsub.prefix, "pub/sub subscriber running");

    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = users.next() => msg,
            msg = agents.next() => msg,
        };
        let Some(message) = message else { break };

        let relay: Relay = match serde_json::from_slice(&message.payload) {
            Ok(r) => r,
            Err(e) => {
                debug!(err = %e, "dropping malformed pub/sub relay");
                continue;
            }
        };
        if relay.origin == pubsub.origin {
            continue;
        }

        match relay.target {
            RelayTarget::User { user_id } => {
                if let Some(envelope) = relay.envelope {
                    hub.fan_to_user_local(user_id, &envelope).await;
                }
            }
            RelayTarget::Agent { agent_id } => {
                if let Some(envelope) = relay.envelope {
                    if !hub.deliver_agent_local(agent_id, envelope).await {
                        debug!(agent_id, "pub/sub relay for agent not held here");
                    }
                }
            }
            RelayTarget::Claim { agent_id, instance_id } => {
                hub.evict_stale_agent(agent_id, instance_id).await;
            }
        }
    }

    Ok(())
}
