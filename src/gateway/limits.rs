//! Distributed sliding-window admission control.
//!
//! Consumption per caller is a redis sorted set: score is a millisecond
//! timestamp, member is `"{timestamp}-{nonce}:{tokens}"` so the token
//! weight rides along in the member itself. One Lua script per check keeps
//! the prune + sum + insert atomic in a single round trip. Two concurrent
//! admissions may each observe the pre-insert sum; the resulting slight
//! over-admission is bounded by the caller's concurrency and accepted.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;

const WINDOW_MS: i64 = 60_000;
// Window entries expire with the key well after they stop counting.
const WINDOW_TTL_MS: i64 = 2 * WINDOW_MS;

const SLIDING_WINDOW_SCRIPT: &str = r#"
local budget = tonumber(ARGV[1])
local tokens = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local member = ARGV[4]
local window_ms = tonumber(ARGV[5])
local ttl_ms = tonumber(ARGV[6])

redis.call("ZREMRANGEBYSCORE", KEYS[1], 0, now_ms - window_ms)

local sum = 0
for _, entry in ipairs(redis.call("ZRANGE", KEYS[1], 0, -1)) do
  local weight = string.match(entry, ":(%d+)$")
  if weight then
    sum = sum + tonumber(weight)
  end
end

if sum + tokens > budget then
  return 0
end

redis.call("ZADD", KEYS[1], now_ms, member)
redis.call("PEXPIRE", KEYS[1], ttl_ms)
return 1
"#;

#[derive(Debug, Error)]
pub enum LimitsError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("clock error: {0}")]
    Clock(#[from] std::time::SystemTimeError),
}

/// Admission check seam. The orchestrator fails open when `allow` errors:
/// an unreachable limiter store degrades enforcement, not availability.
#[async_trait]
pub trait AdmissionControl: Send + Sync {
    async fn allow(&self, caller_id: &str, estimated_tokens: u32) -> Result<bool, LimitsError>;
}

#[derive(Clone, Debug)]
pub struct RateLimiter {
    client: Option<redis::Client>,
    prefix: String,
    tokens_per_minute: i64,
}

impl RateLimiter {
    pub fn new(url: impl AsRef<str>, tokens_per_minute: i64) -> Result<Self, LimitsError> {
        Ok(Self {
            client: Some(redis::Client::open(url.as_ref())?),
            prefix: "relay".to_string(),
            tokens_per_minute,
        })
    }

    /// A limiter that admits everything. Used when redis is not available
    /// at startup and limiting is consciously disabled.
    pub fn disabled() -> Self {
        Self {
            client: None,
            prefix: "relay".to_string(),
            tokens_per_minute: 0,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn key_window(&self, caller_id: &str) -> String {
        format!("{}:ratelimit:{caller_id}", self.prefix)
    }
}

#[async_trait]
impl AdmissionControl for RateLimiter {
    async fn allow(&self, caller_id: &str, estimated_tokens: u32) -> Result<bool, LimitsError> {
        if self.tokens_per_minute <= 0 {
            return Ok(true);
        }
        let Some(client) = self.client.as_ref() else {
            return Ok(true);
        };

        let tokens = i64::from(estimated_tokens.max(1));
        let now_ms = epoch_millis()?;
        let member = window_member(now_ms, tokens);

        let mut conn = client.get_multiplexed_async_connection().await?;
        let admitted: i64 = redis::Script::new(SLIDING_WINDOW_SCRIPT)
            .key(self.key_window(caller_id))
            .arg(self.tokens_per_minute)
            .arg(tokens)
            .arg(now_ms)
            .arg(member)
            .arg(WINDOW_MS)
            .arg(WINDOW_TTL_MS)
            .invoke_async(&mut conn)
            .await?;

        Ok(admitted == 1)
    }
}

fn epoch_millis() -> Result<i64, std::time::SystemTimeError> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as i64)
}

fn window_member(now_ms: i64, tokens: i64) -> String {
    let nonce = uuid::Uuid::new_v4().simple();
    format!("{now_ms}-{nonce}:{tokens}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_carries_weight_suffix() {
        let member = window_member(1_700_000_000_000, 42);
        let (tag, weight) = member.rsplit_once(':').expect("weight suffix");
        assert!(tag.starts_with("1700000000000-"));
        assert_eq!(weight, "42");
    }

    #[test]
    fn members_are_unique_per_call() {
        assert_ne!(window_member(1, 1), window_member(1, 1));
    }

    #[tokio::test]
    async fn disabled_limiter_admits_everything() {
        let limiter = RateLimiter::disabled();
        assert!(limiter.allow("tenant-a", u32::MAX).await.expect("allow"));
    }

    #[tokio::test]
    async fn zero_budget_disables_limiting() {
        let limiter = RateLimiter::new("redis://localhost:6379/0", 0).expect("limiter");
        assert!(limiter.allow("tenant-a", 10).await.expect("allow"));
    }
}
