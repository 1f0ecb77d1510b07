//! Cross-instance broadcast plane over Redis pub/sub.
//!
//! Every cluster-wide dispatch is mirrored: delivered locally through the
//! hub, and published on a channel keyed by its target (`ws:broadcast`,
//! `ws:room:<id>`, `ws:user:<uid>`). Each instance subscribes permanently to
//! the broadcast channel and, driven by hub interest notifications, to the
//! room and user channels it can currently deliver to. Inbound messages
//! stamped with this instance's id are dropped (loop suppression).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use rand::distr::Alphanumeric;
use rand::Rng;
use redis::aio::{ConnectionManager, PubSubSink};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::hub::{Hub, Interest};
use crate::protocol::Envelope;

pub const CHANNEL_BROADCAST: &str = "ws:broadcast";

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub fn room_channel(room_id: &str) -> String {
    format!("ws:room:{room_id}")
}

pub fn user_channel(user_id: &str) -> String {
    format!("ws:user:{user_id}")
}

/// Short random id stamped on every publication for loop suppression.
pub fn generate_instance_id() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("failed to serialize bus envelope: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Envelope carried on the inter-instance bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEnvelope {
    pub source_instance: String,
    pub message: Envelope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_room: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user: Option<String>,
}

/// Outbound half of the plane.
#[derive(Clone)]
pub struct BusPublisher {
    redis: ConnectionManager,
    instance_id: String,
}

impl BusPublisher {
    pub fn new(redis: ConnectionManager, instance_id: String) -> Self {
        Self { redis, instance_id }
    }

    pub async fn publish_to_room(&self, room_id: &str, message: &Envelope) -> Result<(), ClusterError> {
        let envelope = ClusterEnvelope {
            source_instance: self.instance_id.clone(),
            message: message.clone(),
            target_room: Some(room_id.to_string()),
            target_user: None,
        };
        self.publish(&room_channel(room_id), &envelope).await
    }

    pub async fn publish_to_user(&self, user_id: &str, message: &Envelope) -> Result<(), ClusterError> {
        let envelope = ClusterEnvelope {
            source_instance: self.instance_id.clone(),
            message: message.clone(),
            target_room: None,
            target_user: Some(user_id.to_string()),
        };
        self.publish(&user_channel(user_id), &envelope).await
    }

    pub async fn publish_broadcast(&self, message: &Envelope) -> Result<(), ClusterError> {
        let envelope = ClusterEnvelope {
            source_instance: self.instance_id.clone(),
            message: message.clone(),
            target_room: None,
            target_user: None,
        };
        self.publish(CHANNEL_BROADCAST, &envelope).await
    }

    async fn publish(&self, channel: &str, envelope: &ClusterEnvelope) -> Result<(), ClusterError> {
        let payload = serde_json::to_string(envelope)?;
        let mut conn = self.redis.clone();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }
}

/// Cluster-wide dispatch: local hub delivery plus the bus mirror. Bus
/// failures are logged and never block local delivery. Without a publisher
/// (single-instance or test setups) only the local half runs.
#[derive(Clone)]
pub struct Fanout {
    hub: Arc<Hub>,
    bus: Option<BusPublisher>,
}

impl Fanout {
    pub fn new(hub: Arc<Hub>, bus: Option<BusPublisher>) -> Self {
        Self { hub, bus }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub async fn send_to_user(&self, user_id: &str, envelope: &Envelope) {
        self.hub.send_to_user(user_id, envelope);
        if let Some(bus) = &self.bus {
            if let Err(e) = bus.publish_to_user(user_id, envelope).await {
                tracing::warn!(user_id, error = %e, "failed to mirror user message to bus");
            }
        }
    }

    pub async fn send_to_room(&self, room_id: &str, envelope: &Envelope) {
        self.hub.send_to_room(room_id, envelope);
        if let Some(bus) = &self.bus {
            if let Err(e) = bus.publish_to_room(room_id, envelope).await {
                tracing::warn!(room_id, error = %e, "failed to mirror room message to bus");
            }
        }
    }

    pub async fn broadcast(&self, envelope: &Envelope) {
        self.hub.broadcast(envelope);
        if let Some(bus) = &self.bus {
            if let Err(e) = bus.publish_broadcast(envelope).await {
                tracing::warn!(error = %e, "failed to mirror broadcast to bus");
            }
        }
    }
}

/// Inbound half of the plane: one process-wide subscriber task.
pub struct Subscriber {
    client: redis::Client,
    hub: Arc<Hub>,
    instance_id: String,
    /// Channels beyond `ws:broadcast` this instance is subscribed to,
    /// kept so a reconnect can restore them.
    channels: HashSet<String>,
}

impl Subscriber {
    pub fn new(client: redis::Client, hub: Arc<Hub>, instance_id: String) -> Self {
        Self {
            client,
            hub,
            instance_id,
            channels: HashSet::new(),
        }
    }

    /// Run until the interest channel closes. The subscription is
    /// re-established after connection loss; messages published during the
    /// outage are lost.
    pub async fn run(mut self, mut interest: mpsc::UnboundedReceiver<Interest>) {
        loop {
            let pubsub = match self.client.get_async_pubsub().await {
                Ok(pubsub) => pubsub,
                Err(e) => {
                    tracing::warn!(error = %e, "cluster bus connection failed, retrying");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            let (mut sink, mut stream) = pubsub.split();

            if let Err(e) = self.restore_subscriptions(&mut sink).await {
                tracing::warn!(error = %e, "cluster bus subscribe failed, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }

            tracing::info!(
                instance_id = %self.instance_id,
                channels = self.channels.len() + 1,
                "cluster bus subscriber started"
            );

            loop {
                tokio::select! {
                    change = interest.recv() => {
                        let Some(change) = change else {
                            // Hub is gone; the process is shutting down.
                            return;
                        };
                        if let Err(e) = self.apply_interest(&mut sink, change).await {
                            tracing::warn!(error = %e, "cluster bus subscription change failed");
                            break;
                        }
                    }
                    message = stream.next() => {
                        match message {
                            Some(message) => self.handle_message(message),
                            None => {
                                tracing::warn!("cluster bus subscription lost, reconnecting");
                                break;
                            }
                        }
                    }
                }
            }

            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn restore_subscriptions(&mut self, sink: &mut PubSubSink) -> redis::RedisResult<()> {
        sink.subscribe(CHANNEL_BROADCAST).await?;
        for channel in &self.channels {
            sink.subscribe(channel).await?;
        }
        Ok(())
    }

    async fn apply_interest(
        &mut self,
        sink: &mut PubSubSink,
        change: Interest,
    ) -> redis::RedisResult<()> {
        match change {
            Interest::SubscribeRoom(room_id) => {
                let channel = room_channel(&room_id);
                sink.subscribe(&channel).await?;
                self.channels.insert(channel);
            }
            Interest::UnsubscribeRoom(room_id) => {
                let channel = room_channel(&room_id);
                sink.unsubscribe(&channel).await?;
                self.channels.remove(&channel);
            }
            Interest::SubscribeUser(user_id) => {
                let channel = user_channel(&user_id);
                sink.subscribe(&channel).await?;
                self.channels.insert(channel);
            }
            Interest::UnsubscribeUser(user_id) => {
                let channel = user_channel(&user_id);
                sink.unsubscribe(&channel).await?;
                self.channels.remove(&channel);
            }
        }
        Ok(())
    }

    fn handle_message(&self, message: redis::Msg) {
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "unreadable bus message payload");
                return;
            }
        };
        apply_bus_payload(&self.hub, &self.instance_id, &payload);
    }
}

/// Decode one bus payload and apply it locally, unless this instance
/// originated it.
pub fn apply_bus_payload(hub: &Hub, instance_id: &str, payload: &str) {
    let envelope: ClusterEnvelope = match serde_json::from_str(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(error = %e, "failed to decode bus envelope");
            return;
        }
    };

    if envelope.source_instance == instance_id {
        return;
    }

    tracing::debug!(
        source_instance = %envelope.source_instance,
        target_room = envelope.target_room.as_deref().unwrap_or(""),
        target_user = envelope.target_user.as_deref().unwrap_or(""),
        "applying bus message"
    );

    if let Some(room_id) = &envelope.target_room {
        hub.send_to_room(room_id, &envelope.message);
    } else if let Some(user_id) = &envelope.target_user {
        hub.send_to_user(user_id, &envelope.message);
    } else {
        hub.broadcast(&envelope.message);
    }
}
