//! Redis backing store.
//!
//! Maps the store primitives onto Redis commands:
//!
//! - lists: `RPUSH`, `LMOVE src dst LEFT RIGHT`, `LREM key 1`, `LLEN`, `LRANGE`
//! - sorted sets: `ZADD`, `ZRANGEBYSCORE -inf max LIMIT 0 n`, `ZREM`, `ZCARD`
//! - hashes: `HINCRBY`, `HGETALL`
//! - batches: `MULTI`/`EXEC` pipeline
//! - leased moves and guarded batches: Lua scripts, so the whole step runs
//!   atomically on the server
//!
//! A single multiplexed [`ConnectionManager`] is shared by all callers and
//! reconnects on its own after a dropped connection.

use super::{BackingStore, StoreOp};
use crate::error::StoreError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use tracing::info;

/// KEYS: source, destination, lease set. ARGV: lease score.
const MOVE_LEASED_SCRIPT: &str = r#"
local value = redis.call('LMOVE', KEYS[1], KEYS[2], 'LEFT', 'RIGHT')
if value then
  redis.call('ZADD', KEYS[3], ARGV[1], value)
end
return value
"#;

/// One key per op in KEYS; three ARGV slots per op: opcode and two operands.
/// The first op is the guard.
const GUARDED_BATCH_SCRIPT: &str = r#"
local function run(index)
  local base = (index - 1) * 3
  local op, key, a, b = ARGV[base + 1], KEYS[index], ARGV[base + 2], ARGV[base + 3]
  if op == 'RPUSH' then return redis.call('RPUSH', key, a) end
  if op == 'LREM' then return redis.call('LREM', key, 1, a) end
  if op == 'ZADD' then return redis.call('ZADD', key, b, a) end
  if op == 'ZREM' then return redis.call('ZREM', key, a) end
  if op == 'HINCRBY' then return redis.call('HINCRBY', key, a, b) end
  return redis.error_reply('unknown op ' .. tostring(op))
end
local guard = run(1)
if (ARGV[1] == 'LREM' or ARGV[1] == 'ZREM') and guard == 0 then
  return 0
end
for index = 2, #KEYS do
  run(index)
end
return 1
"#;

/// [`BackingStore`] implementation over a Redis server
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis at `url` (e.g. `redis://localhost:6379`)
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Unavailable {
            message: format!("invalid redis url: {}", e),
        })?;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Unavailable {
                message: e.to_string(),
            })?;

        info!(url = %redact_url(url), "Connected to redis backing store");
        Ok(Self { connection })
    }

    fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

/// Strip credentials from a connection URL before logging it
fn redact_url(url: &str) -> String {
    match url.split_once('@') {
        Some((scheme_and_auth, host)) => {
            let scheme = scheme_and_auth.split("://").next().unwrap_or("redis");
            format!("{}://***@{}", scheme, host)
        }
        None => url.to_string(),
    }
}

fn map_error(command: &str, error: redis::RedisError) -> StoreError {
    if error.is_timeout() {
        StoreError::Timeout {
            duration: std::time::Duration::ZERO,
        }
    } else if error.is_io_error() || error.is_connection_dropped() || error.is_connection_refusal()
    {
        StoreError::Unavailable {
            message: error.to_string(),
        }
    } else {
        StoreError::Command {
            command: command.to_string(),
            message: error.to_string(),
        }
    }
}

#[async_trait]
impl BackingStore for RedisStore {
    async fn list_push(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.connection();
        let _: i64 = redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_error("RPUSH", e))?;
        Ok(())
    }

    async fn list_move_leased(
        &self,
        source: &str,
        destination: &str,
        lease_key: &str,
        lease_score: f64,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection();
        let value: Option<String> = redis::Script::new(MOVE_LEASED_SCRIPT)
            .key(source)
            .key(destination)
            .key(lease_key)
            .arg(lease_score)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_error("LMOVE", e))?;
        Ok(value)
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let mut conn = self.connection();
        let removed: usize = redis::cmd("LREM")
            .arg(key)
            .arg(1)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_error("LREM", e))?;
        Ok(removed)
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.connection();
        let len: usize = redis::cmd("LLEN")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_error("LLEN", e))?;
        Ok(len)
    }

    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection();
        let values: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(limit as i64 - 1)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_error("LRANGE", e))?;
        Ok(values)
    }

    async fn sorted_set_add(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut conn = self.connection();
        let _: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_error("ZADD", e))?;
        Ok(())
    }

    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        max_score: f64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection();
        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max_score)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_error("ZRANGEBYSCORE", e))?;
        Ok(members)
    }

    async fn sorted_set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection();
        let removed: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_error("ZREM", e))?;
        Ok(removed > 0)
    }

    async fn sorted_set_len(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.connection();
        let len: usize = redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_error("ZCARD", e))?;
        Ok(len)
    }

    async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.connection();
        let value: i64 = redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_error("HINCRBY", e))?;
        Ok(value)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, i64>, StoreError> {
        let mut conn = self.connection();
        let values: HashMap<String, i64> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_error("HGETALL", e))?;
        Ok(values)
    }

    async fn apply_batch(&self, ops: &[StoreOp]) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                StoreOp::ListPush { key, value } => {
                    pipe.cmd("RPUSH").arg(key).arg(value).ignore();
                }
                StoreOp::ListRemove { key, value } => {
                    pipe.cmd("LREM").arg(key).arg(1).arg(value).ignore();
                }
                StoreOp::SortedSetAdd { key, member, score } => {
                    pipe.cmd("ZADD").arg(key).arg(*score).arg(member).ignore();
                }
                StoreOp::SortedSetRemove { key, member } => {
                    pipe.cmd("ZREM").arg(key).arg(member).ignore();
                }
                StoreOp::HashIncrement { key, field, delta } => {
                    pipe.cmd("HINCRBY").arg(key).arg(field).arg(*delta).ignore();
                }
            }
        }

        let mut conn = self.connection();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| map_error("MULTI", e))?;
        Ok(())
    }

    async fn apply_guarded(&self, guard: &StoreOp, ops: &[StoreOp]) -> Result<bool, StoreError> {
        let script = redis::Script::new(GUARDED_BATCH_SCRIPT);
        let mut invocation = script.prepare_invoke();
        for op in std::iter::once(guard).chain(ops) {
            let (opcode, key, a, b) = script_args(op);
            invocation.key(key).arg(opcode).arg(a).arg(b);
        }

        let mut conn = self.connection();
        let applied: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_error("EVALSHA", e))?;
        Ok(applied == 1)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection();
        let _: i64 = redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_error("DEL", e))?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| map_error("PING", e))?;
        Ok(())
    }
}

/// Opcode, key and the two operands of an op in guarded-batch script form
fn script_args(op: &StoreOp) -> (&'static str, &str, String, String) {
    match op {
        StoreOp::ListPush { key, value } => ("RPUSH", key, value.clone(), String::new()),
        StoreOp::ListRemove { key, value } => ("LREM", key, value.clone(), String::new()),
        StoreOp::SortedSetAdd { key, member, score } => {
            ("ZADD", key, member.clone(), score.to_string())
        }
        StoreOp::SortedSetRemove { key, member } => ("ZREM", key, member.clone(), String::new()),
        StoreOp::HashIncrement { key, field, delta } => {
            ("HINCRBY", key, field.clone(), delta.to_string())
        }
    }
}
