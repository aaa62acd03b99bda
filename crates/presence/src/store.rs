//! Redis-backed presence store with timestamp-CAS registration.

use crate::error::{PresenceError, Result};
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult, Script};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Redis key prefix for presence records: presence:{userId}
pub const PRESENCE_KEY_PREFIX: &str = "presence:";

/// Default per-operation deadline.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(2);

/// Atomic register: reject if the stored timestamp is newer, otherwise
/// write all fields and reset the TTL. A delayed write from a gateway the
/// user has already left must not clobber the newer record.
const REGISTER_SCRIPT: &str = r#"
local key = KEYS[1]
local new_gw = ARGV[1]
local new_conn = ARGV[2]
local new_ts = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local current_ts = redis.call('HGET', key, 'ts')
if current_ts and tonumber(current_ts) > new_ts then
    return 0
end

redis.call('HSET', key, 'gwId', new_gw, 'connId', new_conn, 'ts', new_ts)
redis.call('EXPIRE', key, ttl)
return 1
"#;

/// Atomic refresh-if-exists: a heartbeat that races a disconnect must not
/// resurrect a record the owner already deleted.
const REFRESH_SCRIPT: &str = r#"
local key = KEYS[1]
if redis.call('EXISTS', key) == 0 then
    return 0
end
redis.call('HSET', key, 'ts', ARGV[1])
redis.call('EXPIRE', key, ARGV[2])
return 1
"#;

/// A user's presence record as stored in the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub user_id: String,
    /// Gateway instance that owns the attachment.
    pub gateway_id: String,
    /// Connection id local to that instance.
    pub conn_id: String,
    /// Unix seconds at the writing instance.
    pub timestamp: i64,
}

impl PresenceRecord {
    fn from_hash(user_id: &str, mut fields: HashMap<String, String>) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }
        let timestamp = fields
            .get("ts")
            .and_then(|ts| ts.parse().ok())
            .unwrap_or(0);
        Some(Self {
            user_id: user_id.to_string(),
            gateway_id: fields.remove("gwId").unwrap_or_default(),
            conn_id: fields.remove("connId").unwrap_or_default(),
            timestamp,
        })
    }
}

/// Shared handle to the presence directory.
///
/// Cheap to clone; every operation runs against a multiplexed connection
/// and is bounded by a per-operation deadline.
#[derive(Clone)]
pub struct PresenceStore {
    connection: ConnectionManager,
    register_script: Arc<Script>,
    refresh_script: Arc<Script>,
    ttl: Duration,
    op_timeout: Duration,
}

impl PresenceStore {
    /// Connect to Redis and build a store with the given record TTL.
    pub async fn connect(redis_url: &str, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let connection = client.get_connection_manager().await?;
        Ok(Self::new(connection, ttl))
    }

    /// Build a store over an existing connection.
    pub fn new(connection: ConnectionManager, ttl: Duration) -> Self {
        Self {
            connection,
            register_script: Arc::new(Script::new(REGISTER_SCRIPT)),
            refresh_script: Arc::new(Script::new(REFRESH_SCRIPT)),
            ttl,
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    /// Override the per-operation deadline.
    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    fn key(user_id: &str) -> String {
        format!("{PRESENCE_KEY_PREFIX}{user_id}")
    }

    async fn bounded<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(PresenceError::from),
            Err(_) => Err(PresenceError::Timeout),
        }
    }

    /// Claim ownership of a user's attachment for this gateway.
    ///
    /// Returns `PresenceError::Stale` when a record with a newer timestamp
    /// already exists; the stored record is left untouched in that case.
    pub async fn register(&self, user_id: &str, gateway_id: &str, conn_id: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let timestamp = Utc::now().timestamp();
        let mut invocation = self.register_script.key(Self::key(user_id));
        invocation
            .arg(gateway_id)
            .arg(conn_id)
            .arg(timestamp)
            .arg(self.ttl.as_secs());
        let updated: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        if updated == 0 {
            return Err(PresenceError::Stale {
                user_id: user_id.to_string(),
            });
        }
        debug!(user_id, gateway_id, conn_id, timestamp, "presence registered");
        Ok(())
    }

    /// Refresh the record's timestamp and TTL, if the record still exists.
    ///
    /// Returns `false` when the record was already gone.
    pub async fn refresh(&self, user_id: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let timestamp = Utc::now().timestamp();
        let mut invocation = self.refresh_script.key(Self::key(user_id));
        invocation.arg(timestamp).arg(self.ttl.as_secs());
        let updated: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        Ok(updated == 1)
    }

    /// Look up a user's record. `None` means offline (absent or expired),
    /// a terminal outcome for routing.
    pub async fn lookup(&self, user_id: &str) -> Result<Option<PresenceRecord>> {
        let mut conn = self.connection.clone();
        let fields: HashMap<String, String> =
            self.bounded(conn.hgetall(Self::key(user_id))).await?;
        Ok(PresenceRecord::from_hash(user_id, fields))
    }

    /// Delete a user's record. Absence is not an error.
    pub async fn remove(&self, user_id: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let _removed: i64 = self.bounded(conn.del(Self::key(user_id))).await?;
        debug!(user_id, "presence removed");
        Ok(())
    }

    /// Check whether a user currently has a live record.
    pub async fn is_online(&self, user_id: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let exists: bool = self.bounded(conn.exists(Self::key(user_id))).await?;
        Ok(exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_namespaced() {
        assert_eq!(PresenceStore::key("alice"), "presence:alice");
    }

    #[test]
    fn record_parses_all_fields() {
        let mut fields = HashMap::new();
        fields.insert("gwId".to_string(), "G1".to_string());
        fields.insert("connId".to_string(), "conn-42".to_string());
        fields.insert("ts".to_string(), "1700000000".to_string());

        let record = PresenceRecord::from_hash("alice", fields).unwrap();
        assert_eq!(record.user_id, "alice");
        assert_eq!(record.gateway_id, "G1");
        assert_eq!(record.conn_id, "conn-42");
        assert_eq!(record.timestamp, 1_700_000_000);
    }

    #[test]
    fn empty_hash_means_offline() {
        assert_eq!(PresenceRecord::from_hash("alice", HashMap::new()), None);
    }

    #[test]
    fn unparseable_timestamp_defaults_to_zero() {
        let mut fields = HashMap::new();
        fields.insert("gwId".to_string(), "G1".to_string());
        fields.insert("connId".to_string(), "conn-42".to_string());
        fields.insert("ts".to_string(), "not-a-number".to_string());

        let record = PresenceRecord::from_hash("alice", fields).unwrap();
        assert_eq!(record.timestamp, 0);
    }
}
