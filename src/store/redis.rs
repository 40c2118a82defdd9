//! Redis sorted-set window store.
//!
//! The admission step runs as one Lua script, so Redis serializes it against every other
//! limiter instance sharing the server. A multiplexed connection is obtained per call.

use super::{WindowRequest, WindowStore};
use crate::error::StoreError;
use async_trait::async_trait;
use redis::{Client, ErrorKind, RedisError};
use tracing::debug;

// KEYS[1] = storage key
// ARGV = window_ms, limit, now_ms, member, ttl_ms
// A member already present means this call was admitted before and its reply was lost.
const ACQUIRE_SCRIPT: &str = r"
local key = KEYS[1]
local window = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local member = ARGV[4]
local ttl = tonumber(ARGV[5])

if redis.call('ZSCORE', key, member) then
  redis.call('PEXPIRE', key, ttl)
  return 1
end

redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. (now - window))
local count = redis.call('ZCARD', key)
local allowed = 0
if count < limit then
  redis.call('ZADD', key, now, member)
  allowed = 1
end
redis.call('PEXPIRE', key, ttl)
return allowed
";

/// Window store backed by a Redis server (or cluster-compatible proxy).
#[derive(Debug, Clone)]
pub struct RedisWindowStore {
    client: Client,
    script: redis::Script,
}

impl RedisWindowStore {
    pub fn new(client: Client) -> Self {
        Self { client, script: redis::Script::new(ACQUIRE_SCRIPT) }
    }

    /// Build from a `redis://` URL.
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(StoreError::from)?;
        Ok(Self::new(client))
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        self.client.get_multiplexed_async_connection().await.map_err(StoreError::from)
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn acquire(&self, key: &str, request: WindowRequest) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let allowed: i64 = self
            .script
            .key(key)
            .arg(request.window_millis)
            .arg(request.limit)
            .arg(request.now_millis)
            .arg(&request.member)
            .arg(request.ttl_millis)
            .invoke_async(&mut conn)
            .await?;
        debug!(key, allowed, "redis window script");
        Ok(allowed == 1)
    }

    async fn count(&self, key: &str, min_score: u64, max_score: u64) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let count: u64 =
            redis::cmd("ZCOUNT").arg(key).arg(min_score).arg(max_score).query_async(&mut conn).await?;
        Ok(count)
    }
}

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        let msg = err.to_string();
        if err.is_timeout() {
            StoreError::Timeout(msg)
        } else if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped()
        {
            StoreError::Connection(msg)
        } else if err.code() == Some("WRONGTYPE")
            || matches!(err.kind(), ErrorKind::InvalidClientConfig | ErrorKind::TypeError)
        {
            StoreError::Rejected(msg)
        } else {
            StoreError::Protocol(msg)
        }
    }
}
