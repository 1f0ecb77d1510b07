//! Central registry for live connections and dispatch entry points.
//!
//! Structural changes (register/unregister) are funneled through one serial
//! task so they never race; read-heavy dispatch paths take short read locks,
//! snapshot their targets, and deliver without holding anything. A slow
//! consumer never stalls fan-out: a full send queue drops the connection on
//! directed sends and is silently skipped on broadcast-style sends.

pub mod connection;
pub mod room;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use axum::extract::ws::Message;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;

use crate::protocol::{
    Envelope, JoinRoomPayload, LeaveRoomPayload, MessageType, RoomJoinedPayload, RoomLeftPayload,
    ERR_INVALID_PAYLOAD, ERR_INVALID_ROOM, ERR_PARSE, ERR_UNKNOWN_TYPE,
};
use connection::Connection;
use room::RoomManager;

/// Structural change requests processed by the hub's serial task. The
/// optional ack on unregister resolves once the removal has been applied,
/// for callers that must observe post-unregister index state.
pub enum HubCommand {
    Register(Arc<Connection>),
    Unregister(Arc<Connection>, Option<oneshot::Sender<()>>),
}

/// Local-interest transitions, consumed by the cross-instance plane to keep
/// its channel subscriptions in step with what this instance can deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interest {
    SubscribeRoom(String),
    UnsubscribeRoom(String),
    SubscribeUser(String),
    UnsubscribeUser(String),
}

#[derive(Default)]
struct Indices {
    /// All live connections, keyed by connection id.
    connections: HashMap<String, Arc<Connection>>,
    /// Principal id → ids of that principal's connections. Never holds an
    /// empty set.
    by_user: HashMap<String, HashSet<String>>,
}

pub struct Hub {
    indices: RwLock<Indices>,
    rooms: RoomManager,
    commands: mpsc::UnboundedSender<HubCommand>,
    interest: Option<mpsc::UnboundedSender<Interest>>,
}

impl Hub {
    /// Create the hub and the command receiver for its serial task. Pass an
    /// interest sender when a cross-instance plane is attached.
    pub fn new(
        interest: Option<mpsc::UnboundedSender<Interest>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<HubCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let hub = Arc::new(Self {
            indices: RwLock::new(Indices::default()),
            rooms: RoomManager::new(),
            commands,
            interest,
        });
        (hub, rx)
    }

    /// Serial register/unregister loop. Runs until every command sender is
    /// dropped.
    pub async fn run(self: Arc<Self>, mut commands: mpsc::UnboundedReceiver<HubCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                HubCommand::Register(conn) => self.register_connection(&conn),
                HubCommand::Unregister(conn, ack) => {
                    self.unregister_connection(&conn);
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                }
            }
        }
    }

    pub fn schedule_register(&self, conn: &Arc<Connection>) {
        let _ = self.commands.send(HubCommand::Register(Arc::clone(conn)));
    }

    pub fn schedule_unregister(&self, conn: &Arc<Connection>) {
        let _ = self
            .commands
            .send(HubCommand::Unregister(Arc::clone(conn), None));
    }

    /// Unregister and resolve only after the serial task has applied the
    /// removal, so the caller reads post-unregister index state (e.g. the
    /// user's remaining connection count).
    pub async fn unregister_and_wait(&self, conn: &Arc<Connection>) {
        let (ack, applied) = oneshot::channel();
        if self
            .commands
            .send(HubCommand::Unregister(Arc::clone(conn), Some(ack)))
            .is_ok()
        {
            let _ = applied.await;
        }
    }

    fn register_connection(&self, conn: &Arc<Connection>) {
        let (first_for_user, total) = {
            let mut indices = self.indices.write().expect("hub indices lock poisoned");
            indices
                .connections
                .insert(conn.id.clone(), Arc::clone(conn));
            let user_conns = indices.by_user.entry(conn.user_id().to_string()).or_default();
            let first = user_conns.is_empty();
            user_conns.insert(conn.id.clone());
            (first, indices.connections.len())
        };

        if first_for_user {
            self.notify_interest(Interest::SubscribeUser(conn.user_id().to_string()));
        }

        tracing::info!(
            client_id = %conn.id,
            user_id = %conn.user_id(),
            total_clients = total,
            "client registered"
        );
    }

    /// Tear a connection down: leave every room, drop it from both indices,
    /// close its send queue. A second call for the same connection is a
    /// no-op.
    fn unregister_connection(&self, conn: &Arc<Connection>) {
        let (dropped_rooms, last_for_user, total) = {
            let mut indices = self.indices.write().expect("hub indices lock poisoned");
            if indices.connections.remove(&conn.id).is_none() {
                return;
            }

            let dropped_rooms = self.rooms.leave_all(conn);

            let mut last = false;
            if let Some(user_conns) = indices.by_user.get_mut(conn.user_id()) {
                user_conns.remove(&conn.id);
                if user_conns.is_empty() {
                    indices.by_user.remove(conn.user_id());
                    last = true;
                }
            }
            (dropped_rooms, last, indices.connections.len())
        };

        conn.close();

        for room_id in dropped_rooms {
            self.notify_interest(Interest::UnsubscribeRoom(room_id));
        }
        if last_for_user {
            self.notify_interest(Interest::UnsubscribeUser(conn.user_id().to_string()));
        }

        tracing::info!(
            client_id = %conn.id,
            user_id = %conn.user_id(),
            total_clients = total,
            "client unregistered"
        );
    }

    /// Parse an inbound frame and route it by message type.
    pub fn dispatch_inbound(&self, conn: &Arc<Connection>, data: &[u8]) {
        let envelope = match Envelope::parse(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(client_id = %conn.id, error = %e, "failed to parse message");
                self.send_error(conn, ERR_PARSE, "Invalid message format", None);
                return;
            }
        };

        tracing::debug!(
            client_id = %conn.id,
            message_type = envelope.kind.as_str(),
            "processing message"
        );

        match envelope.kind {
            MessageType::JoinRoom => self.handle_join_room(conn, envelope),
            MessageType::LeaveRoom => self.handle_leave_room(conn, envelope),
            MessageType::Ping => {
                let reply = Envelope::empty(MessageType::Pong).with_request_id(envelope.request_id);
                self.send_to_connection(conn, &reply);
            }
            _ => {
                self.send_error(conn, ERR_UNKNOWN_TYPE, "Unknown message type", envelope.request_id)
            }
        }
    }

    fn handle_join_room(&self, conn: &Arc<Connection>, envelope: Envelope) {
        let payload: JoinRoomPayload = match envelope
            .payload
            .map(serde_json::from_value)
            .transpose()
        {
            Ok(Some(payload)) => payload,
            _ => {
                self.send_error(
                    conn,
                    ERR_INVALID_PAYLOAD,
                    "Invalid join room payload",
                    envelope.request_id,
                );
                return;
            }
        };

        if payload.room_id.is_empty() {
            self.send_error(conn, ERR_INVALID_ROOM, "Room ID is required", envelope.request_id);
            return;
        }

        let (room, created) = self.rooms.join(&payload.room_id, conn);
        if created {
            self.notify_interest(Interest::SubscribeRoom(payload.room_id.clone()));
        }

        tracing::info!(
            client_id = %conn.id,
            room_id = %payload.room_id,
            member_count = room.member_count(),
            "client joined room"
        );

        let Ok(reply) = Envelope::new(
            MessageType::RoomJoined,
            RoomJoinedPayload {
                room_id: payload.room_id,
                member_count: room.member_count(),
            },
        ) else {
            return;
        };
        self.send_to_connection(conn, &reply.with_request_id(envelope.request_id));
    }

    fn handle_leave_room(&self, conn: &Arc<Connection>, envelope: Envelope) {
        let payload: LeaveRoomPayload = match envelope
            .payload
            .map(serde_json::from_value)
            .transpose()
        {
            Ok(Some(payload)) => payload,
            _ => {
                self.send_error(
                    conn,
                    ERR_INVALID_PAYLOAD,
                    "Invalid leave room payload",
                    envelope.request_id,
                );
                return;
            }
        };

        if self.rooms.leave(&payload.room_id, conn) {
            self.notify_interest(Interest::UnsubscribeRoom(payload.room_id.clone()));
        }

        tracing::info!(
            client_id = %conn.id,
            room_id = %payload.room_id,
            "client left room"
        );

        let Ok(reply) = Envelope::new(
            MessageType::RoomLeft,
            RoomLeftPayload {
                room_id: payload.room_id,
            },
        ) else {
            return;
        };
        self.send_to_connection(conn, &reply.with_request_id(envelope.request_id));
    }

    /// Directed send to one connection. A full queue drops the connection.
    pub fn send_to_connection(&self, conn: &Arc<Connection>, envelope: &Envelope) {
        let Some(frame) = encode_frame(envelope) else {
            return;
        };
        self.deliver(conn, frame, true);
    }

    /// Send to every connection of a principal on this instance. The target
    /// set is snapshotted under the read lock and released before delivery.
    pub fn send_to_user(&self, user_id: &str, envelope: &Envelope) {
        let targets: Vec<Arc<Connection>> = {
            let indices = self.indices.read().expect("hub indices lock poisoned");
            indices
                .by_user
                .get(user_id)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| indices.connections.get(id).cloned())
                        .collect()
                })
                .unwrap_or_default()
        };

        let Some(frame) = encode_frame(envelope) else {
            return;
        };
        for conn in targets {
            self.deliver(&conn, frame.clone(), true);
        }
    }

    /// Send to every member of a room on this instance. Encoded once; full
    /// queues are skipped so one slow member cannot stall the room.
    pub fn send_to_room(&self, room_id: &str, envelope: &Envelope) {
        let Some(room) = self.rooms.get(room_id) else {
            return;
        };
        let Some(frame) = encode_frame(envelope) else {
            return;
        };
        for conn in room.members() {
            self.deliver(&conn, frame.clone(), false);
        }
    }

    /// Send to every connection on this instance.
    pub fn broadcast(&self, envelope: &Envelope) {
        let targets: Vec<Arc<Connection>> = {
            let indices = self.indices.read().expect("hub indices lock poisoned");
            indices.connections.values().cloned().collect()
        };

        let Some(frame) = encode_frame(envelope) else {
            return;
        };
        for conn in targets {
            self.deliver(&conn, frame.clone(), false);
        }
    }

    fn deliver(&self, conn: &Arc<Connection>, frame: Message, directed: bool) {
        match conn.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if directed {
                    tracing::warn!(
                        client_id = %conn.id,
                        "client send buffer full, disconnecting"
                    );
                    self.schedule_unregister(conn);
                }
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    fn send_error(
        &self,
        conn: &Arc<Connection>,
        code: &str,
        message: &str,
        request_id: Option<String>,
    ) {
        let envelope = Envelope::error(code, message, request_id);
        self.send_to_connection(conn, &envelope);
    }

    fn notify_interest(&self, interest: Interest) {
        if let Some(tx) = &self.interest {
            let _ = tx.send(interest);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.indices
            .read()
            .expect("hub indices lock poisoned")
            .connections
            .len()
    }

    /// Number of this principal's connections on this instance.
    pub fn user_connection_count(&self, user_id: &str) -> usize {
        self.indices
            .read()
            .expect("hub indices lock poisoned")
            .by_user
            .get(user_id)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    pub fn room_member_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map(|r| r.member_count()).unwrap_or(0)
    }

    pub fn has_room(&self, room_id: &str) -> bool {
        self.rooms.get(room_id).is_some()
    }

    /// Registry snapshot served by `GET /ready`.
    pub fn stats(&self) -> serde_json::Value {
        let indices = self.indices.read().expect("hub indices lock poisoned");
        serde_json::json!({
            "totalClients": indices.connections.len(),
            "totalUsers": indices.by_user.len(),
            "rooms": self.rooms.stats(),
        })
    }
}

fn encode_frame(envelope: &Envelope) -> Option<Message> {
    match envelope.to_bytes() {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Some(Message::Text(text.into())),
            Err(_) => None,
        },
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize envelope");
            None
        }
    }
}
