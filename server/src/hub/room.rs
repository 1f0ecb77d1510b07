//! Rooms: named membership sets of connections.
//!
//! Room ids are opaque strings. `"global"` is the permanent global room;
//! every other id follows `"<type>:<entity>"`. Non-global rooms are created
//! lazily on first join and dropped when their last member leaves.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::connection::Connection;

pub const GLOBAL_ROOM_ID: &str = "global";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomType {
    Global,
    Contest,
    Problem,
    User,
}

impl RoomType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Contest => "contest",
            Self::Problem => "problem",
            Self::User => "user",
        }
    }
}

/// Classify a room id by its `<type>:` prefix. Unrecognized shapes fall back
/// to the global type.
pub fn parse_room_type(room_id: &str) -> RoomType {
    if room_id == GLOBAL_ROOM_ID {
        return RoomType::Global;
    }
    match room_id.split_once(':') {
        Some(("contest", _)) => RoomType::Contest,
        Some(("problem", _)) => RoomType::Problem,
        Some(("user", _)) => RoomType::User,
        _ => RoomType::Global,
    }
}

/// Build the canonical room id for a typed entity.
pub fn build_room_id(room_type: RoomType, entity_id: &str) -> String {
    match room_type {
        RoomType::Global => GLOBAL_ROOM_ID.to_string(),
        _ => format!("{}:{}", room_type.as_str(), entity_id),
    }
}

pub struct Room {
    pub id: String,
    pub room_type: RoomType,
    pub created_at: DateTime<Utc>,
    members: RwLock<HashMap<String, Arc<Connection>>>,
}

impl Room {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            room_type: parse_room_type(id),
            created_at: Utc::now(),
            members: RwLock::new(HashMap::new()),
        }
    }

    fn add(&self, conn: &Arc<Connection>) {
        self.members
            .write()
            .expect("room members lock poisoned")
            .insert(conn.id.clone(), Arc::clone(conn));
    }

    fn remove(&self, conn: &Arc<Connection>) {
        self.members
            .write()
            .expect("room members lock poisoned")
            .remove(&conn.id);
    }

    pub fn has_member(&self, conn: &Arc<Connection>) -> bool {
        self.members
            .read()
            .expect("room members lock poisoned")
            .contains_key(&conn.id)
    }

    /// Snapshot of the member set, taken under the room lock and released
    /// before any delivery happens.
    pub fn members(&self) -> Vec<Arc<Connection>> {
        self.members
            .read()
            .expect("room members lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn member_count(&self) -> usize {
        self.members
            .read()
            .expect("room members lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.member_count() == 0
    }
}

/// Room registry. The sharded map gives each entry its own lock; member sets
/// carry their own lock inside [`Room`].
pub struct RoomManager {
    rooms: DashMap<String, Arc<Room>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    /// Add a connection to a room, creating the room on first join.
    /// Returns the room and whether this join created it.
    pub fn join(&self, room_id: &str, conn: &Arc<Connection>) -> (Arc<Room>, bool) {
        let (room, created) = match self.rooms.entry(room_id.to_string()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let room = Arc::new(Room::new(room_id));
                entry.insert(Arc::clone(&room));
                (room, true)
            }
        };
        room.add(conn);
        conn.join_room(room_id);
        (room, created)
    }

    /// Remove a connection from a room. Empty non-global rooms are dropped;
    /// returns whether this leave dropped the room.
    pub fn leave(&self, room_id: &str, conn: &Arc<Connection>) -> bool {
        let Some(room) = self.rooms.get(room_id).map(|r| Arc::clone(r.value())) else {
            return false;
        };
        room.remove(conn);
        conn.leave_room(room_id);

        if room.is_empty() && room.room_type != RoomType::Global {
            return self.rooms.remove_if(room_id, |_, r| r.is_empty()).is_some();
        }
        false
    }

    /// Remove a connection from every room it joined. Returns the ids of
    /// rooms dropped as a result.
    pub fn leave_all(&self, conn: &Arc<Connection>) -> Vec<String> {
        let mut dropped = Vec::new();
        for room_id in conn.rooms_snapshot() {
            if self.leave(&room_id, conn) {
                dropped.push(room_id);
            }
        }
        dropped
    }

    pub fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|r| Arc::clone(r.value()))
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn stats(&self) -> serde_json::Value {
        let mut by_type: HashMap<&'static str, usize> = HashMap::new();
        let mut total_members = 0;
        for entry in self.rooms.iter() {
            *by_type.entry(entry.value().room_type.as_str()).or_default() += 1;
            total_members += entry.value().member_count();
        }
        serde_json::json!({
            "totalRooms": self.rooms.len(),
            "totalClients": total_members,
            "byType": by_type,
        })
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;

    fn test_conn(user_id: &str) -> Arc<Connection> {
        let principal = Principal {
            user_id: user_id.to_string(),
            email: None,
            role: 0,
        };
        let (conn, _rx, _shutdown) = Connection::new(format!("conn-{user_id}"), principal);
        conn
    }

    #[test]
    fn room_type_classification() {
        assert_eq!(parse_room_type("global"), RoomType::Global);
        assert_eq!(parse_room_type("contest:42"), RoomType::Contest);
        assert_eq!(parse_room_type("problem:9"), RoomType::Problem);
        assert_eq!(parse_room_type("user:u1"), RoomType::User);
        assert_eq!(parse_room_type("weird"), RoomType::Global);
        assert_eq!(parse_room_type("mystery:7"), RoomType::Global);
    }

    #[test]
    fn build_room_id_formats() {
        assert_eq!(build_room_id(RoomType::Contest, "42"), "contest:42");
        assert_eq!(build_room_id(RoomType::Global, "ignored"), "global");
    }

    #[test]
    fn join_creates_room_once() {
        let manager = RoomManager::new();
        let a = test_conn("u1");
        let b = test_conn("u2");

        let (room, created) = manager.join("contest:1", &a);
        assert!(created);
        assert_eq!(room.member_count(), 1);

        let (room, created) = manager.join("contest:1", &b);
        assert!(!created);
        assert_eq!(room.member_count(), 2);
    }

    #[test]
    fn membership_mirror() {
        let manager = RoomManager::new();
        let conn = test_conn("u1");

        manager.join("contest:1", &conn);
        manager.join("problem:9", &conn);

        let room = manager.get("contest:1").unwrap();
        assert!(room.has_member(&conn));
        assert!(conn.rooms_snapshot().contains(&"contest:1".to_string()));
        assert!(conn.rooms_snapshot().contains(&"problem:9".to_string()));

        manager.leave("contest:1", &conn);
        assert!(!conn.rooms_snapshot().contains(&"contest:1".to_string()));
    }

    #[test]
    fn empty_non_global_room_is_dropped() {
        let manager = RoomManager::new();
        let a = test_conn("u1");
        let b = test_conn("u2");

        manager.join("contest:1", &a);
        manager.join("contest:1", &b);

        assert!(!manager.leave("contest:1", &a), "room still has a member");
        assert!(manager.get("contest:1").is_some());

        assert!(manager.leave("contest:1", &b), "last leave drops the room");
        assert!(manager.get("contest:1").is_none());
    }

    #[test]
    fn global_room_survives_emptying() {
        let manager = RoomManager::new();
        let conn = test_conn("u1");

        manager.join(GLOBAL_ROOM_ID, &conn);
        assert!(!manager.leave(GLOBAL_ROOM_ID, &conn));
        assert!(manager.get(GLOBAL_ROOM_ID).is_some());
        assert_eq!(manager.get(GLOBAL_ROOM_ID).unwrap().member_count(), 0);
    }

    #[test]
    fn leave_all_reports_dropped_rooms() {
        let manager = RoomManager::new();
        let a = test_conn("u1");
        let b = test_conn("u2");

        manager.join("contest:1", &a);
        manager.join("contest:1", &b);
        manager.join("problem:9", &a);

        let dropped = manager.leave_all(&a);
        assert_eq!(dropped, vec!["problem:9".to_string()]);
        assert!(manager.get("contest:1").is_some());
        assert!(manager.get("problem:9").is_none());
        assert!(a.rooms_snapshot().is_empty());
    }

    #[test]
    fn leave_unknown_room_is_noop() {
        let manager = RoomManager::new();
        let conn = test_conn("u1");
        assert!(!manager.leave("contest:404", &conn));
    }
}
