//! Shared key-value lock backend on Redis.
//!
//! Acquisition is a single `SET key value NX PX lease`; ownership checks for
//! release and renewal run server-side in Lua so compare and write are one
//! atomic step.

use super::{LockBackend, LockError};
use crate::models::SyncLock;
use async_trait::async_trait;
use bb8_redis::{bb8, RedisConnectionManager};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

const RELEASE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then return 0 end
local ok, record = pcall(cjson.decode, current)
if ok and record['lockId'] == ARGV[1] then
  redis.call('DEL', KEYS[1])
  return 1
end
return 0
"#;

const RENEW_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then return 0 end
local ok, record = pcall(cjson.decode, current)
if not ok or record['lockId'] ~= ARGV[1] then return 0 end
record['acquiredAt'] = ARGV[2]
redis.call('SET', KEYS[1], cjson.encode(record), 'PX', record['leaseDurationMs'])
return 1
"#;

const TAKE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current then redis.call('DEL', KEYS[1]) end
return current
"#;

/// `acquiredAt` as written by the renew script; must parse back as a `SyncLock`.
fn renewal_stamp(acquired_at: DateTime<Utc>) -> String {
    acquired_at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn redis_err(e: impl std::fmt::Display) -> LockError {
    LockError::Redis(e.to_string())
}

pub struct RedisLockBackend {
    pool: bb8::Pool<RedisConnectionManager>,
    key: String,
    release: redis::Script,
    renew: redis::Script,
    take: redis::Script,
}

impl RedisLockBackend {
    pub async fn connect(url: &str, key: impl Into<String>) -> Result<Self, LockError> {
        let manager = RedisConnectionManager::new(url).map_err(redis_err)?;
        let pool = bb8::Pool::builder().max_size(4).build(manager).await.map_err(redis_err)?;
        Ok(Self {
            pool,
            key: key.into(),
            release: redis::Script::new(RELEASE_SCRIPT),
            renew: redis::Script::new(RENEW_SCRIPT),
            take: redis::Script::new(TAKE_SCRIPT),
        })
    }

    fn decode(raw: Option<String>) -> Result<Option<SyncLock>, LockError> {
        raw.map(|txt| serde_json::from_str(&txt)).transpose().map_err(Into::into)
    }
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn put_if_absent(&self, lock: &SyncLock) -> Result<Option<SyncLock>, LockError> {
        let value = serde_json::to_string(lock)?;
        let mut conn = self.pool.get().await.map_err(redis_err)?;

        // the key may expire between a failed SET and the GET; retry once
        for _ in 0..2 {
            let set: Option<String> = redis::cmd("SET")
                .arg(&self.key)
                .arg(&value)
                .arg("NX")
                .arg("PX")
                .arg(lock.lease_duration_ms)
                .query_async(&mut *conn)
                .await
                .map_err(redis_err)?;
            if set.is_some() {
                return Ok(None);
            }
            let existing: Option<String> = redis::cmd("GET")
                .arg(&self.key)
                .query_async(&mut *conn)
                .await
                .map_err(redis_err)?;
            if let Some(existing) = Self::decode(existing)? {
                return Ok(Some(existing));
            }
            debug!(key = %self.key, "lock key vanished during acquisition, retrying");
        }
        Err(LockError::Redis("lock key kept vanishing during acquisition".into()))
    }

    async fn load(&self) -> Result<Option<SyncLock>, LockError> {
        let mut conn = self.pool.get().await.map_err(redis_err)?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(&self.key)
            .query_async(&mut *conn)
            .await
            .map_err(redis_err)?;
        Self::decode(raw)
    }

    async fn remove_if_owner(&self, lock_id: &str) -> Result<bool, LockError> {
        let mut conn = self.pool.get().await.map_err(redis_err)?;
        let removed: i64 = self
            .release
            .key(&self.key)
            .arg(lock_id)
            .invoke_async(&mut *conn)
            .await
            .map_err(redis_err)?;
        Ok(removed == 1)
    }

    async fn renew(&self, lock_id: &str, acquired_at: DateTime<Utc>) -> Result<bool, LockError> {
        let mut conn = self.pool.get().await.map_err(redis_err)?;
        let renewed: i64 = self
            .renew
            .key(&self.key)
            .arg(lock_id)
            .arg(renewal_stamp(acquired_at))
            .invoke_async(&mut *conn)
            .await
            .map_err(redis_err)?;
        Ok(renewed == 1)
    }

    async fn remove_any(&self) -> Result<Option<SyncLock>, LockError> {
        let mut conn = self.pool.get().await.map_err(redis_err)?;
        let raw: Option<String> = self
            .take
            .key(&self.key)
            .invoke_async(&mut *conn)
            .await
            .map_err(redis_err)?;
        Self::decode(raw)
    }
}
