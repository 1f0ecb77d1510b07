//! Per-user per-instance liveness in the shared store.
//!
//! `presence:user:<uid>` is a hash of instance-id → last-refresh unix
//! seconds with a 5-minute TTL refreshed on every write. The registry is
//! advisory: it is not atomic with connect/disconnect, and routing never
//! depends on it.

use std::collections::HashMap;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

const PRESENCE_TTL_SECS: i64 = 300;

fn presence_key(user_id: &str) -> String {
    format!("presence:user:{user_id}")
}

#[derive(Clone)]
pub struct PresenceManager {
    redis: ConnectionManager,
    instance_id: String,
}

impl PresenceManager {
    pub fn new(redis: ConnectionManager, instance_id: String) -> Self {
        Self { redis, instance_id }
    }

    /// Record this instance for the user and refresh the key TTL.
    pub async fn set_online(&self, user_id: &str) -> Result<(), redis::RedisError> {
        let key = presence_key(user_id);
        let mut conn = self.redis.clone();
        let _: () = conn
            .hset(&key, &self.instance_id, Utc::now().timestamp())
            .await?;
        let _: () = conn.expire(&key, PRESENCE_TTL_SECS).await?;
        Ok(())
    }

    /// Drop this instance's entry for the user.
    pub async fn set_offline(&self, user_id: &str) -> Result<(), redis::RedisError> {
        let mut conn = self.redis.clone();
        let _: () = conn.hdel(presence_key(user_id), &self.instance_id).await?;
        Ok(())
    }

    /// Refresh the TTL for a still-connected user.
    pub async fn refresh(&self, user_id: &str) -> Result<(), redis::RedisError> {
        self.set_online(user_id).await
    }

    /// TTL-accurate liveness: online iff the hash has any entry.
    pub async fn is_online(&self, user_id: &str) -> Result<bool, redis::RedisError> {
        let mut conn = self.redis.clone();
        let count: i64 = conn.hlen(presence_key(user_id)).await?;
        Ok(count > 0)
    }

    /// Instances currently holding a connection for the user, with their
    /// last-refresh unix seconds.
    pub async fn user_instances(
        &self,
        user_id: &str,
    ) -> Result<HashMap<String, String>, redis::RedisError> {
        let mut conn = self.redis.clone();
        conn.hgetall(presence_key(user_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_scheme() {
        assert_eq!(presence_key("u1"), "presence:user:u1");
    }
}
