//! Fixed-window rate limiting backed by the shared store
//!
//! Counters live in Redis when it is configured and in the `api_usage`
//! table otherwise, so every API instance sees the same counts and a
//! restart doesn't reset them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;

const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for RateLimitError {
    fn from(e: redis::RedisError) -> Self {
        RateLimitError::Backend(e.to_string())
    }
}

impl From<sqlx::Error> for RateLimitError {
    fn from(e: sqlx::Error) -> Self {
        RateLimitError::Backend(e.to_string())
    }
}

/// Shared counter storage
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add one to the counter of `key` for the window starting at
    /// `window_start` and return the new count.
    async fn increment(
        &self,
        key: &str,
        window_start: OffsetDateTime,
        window: Duration,
    ) -> Result<i64, RateLimitError>;
}

/// Redis-backed counters (`INCR` + `EXPIRE` in one MULTI block)
pub struct RedisCounterStore {
    conn: ConnectionManager,
}

impl RedisCounterStore {
    pub async fn connect(redis_url: &str) -> Result<Self, RateLimitError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(
        &self,
        key: &str,
        window_start: OffsetDateTime,
        window: Duration,
    ) -> Result<i64, RateLimitError> {
        let redis_key = format!("ratelimit:{}:{}", key, window_start.unix_timestamp());
        let mut conn = self.conn.clone();
        let (count, _): (i64, i64) = redis::pipe()
            .atomic()
            .incr(&redis_key, 1)
            .expire(&redis_key, window.as_secs() as i64)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }
}

/// Postgres-backed counters in the `api_usage` table
pub struct PgCounterStore {
    pool: PgPool,
}

impl PgCounterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Drop windows that ended before `before`
    pub async fn purge_expired(&self, before: OffsetDateTime) -> Result<u64, RateLimitError> {
        let result = sqlx::query("DELETE FROM api_usage WHERE window_end < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn increment(
        &self,
        key: &str,
        window_start: OffsetDateTime,
        window: Duration,
    ) -> Result<i64, RateLimitError> {
        let window_end = window_start + window;
        let (count,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO api_usage (key, window_start, window_end, request_count)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (key, window_start)
            DO UPDATE SET request_count = api_usage.request_count + 1
            RETURNING request_count
            "#,
        )
        .bind(key)
        .bind(window_start)
        .bind(window_end)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the current window closes (set when rejected)
    pub retry_after_seconds: Option<u64>,
    #[serde(with = "time::serde::rfc3339")]
    pub reset_at: OffsetDateTime,
}

/// Start and end of the fixed window containing `now`
///
/// Windows are aligned to the Unix epoch, so daily windows start at UTC
/// midnight.
pub fn window_bounds(now: OffsetDateTime, window: Duration) -> (OffsetDateTime, OffsetDateTime) {
    let secs = window.as_secs().max(1) as i64;
    let ts = now.unix_timestamp();
    let start_ts = ts - ts.rem_euclid(secs);
    let start = OffsetDateTime::from_unix_timestamp(start_ts).unwrap_or(now);
    (start, start + window)
}

/// Rate limiter over a shared counter store
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    pub async fn redis(redis_url: &str) -> Result<Self, RateLimitError> {
        let store = RedisCounterStore::connect(redis_url).await?;
        Ok(Self::new(Arc::new(store)))
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self::new(Arc::new(PgCounterStore::new(pool)))
    }

    /// Count one request against a per-day limit
    pub async fn check_daily(&self, key: &str, limit: u32) -> Result<RateLimitResult, RateLimitError> {
        self.check_window(key, limit, ONE_DAY, OffsetDateTime::now_utc())
            .await
    }

    /// Count one request against `limit` requests per `window`
    pub async fn check_window(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: OffsetDateTime,
    ) -> Result<RateLimitResult, RateLimitError> {
        let (window_start, window_end) = window_bounds(now, window);
        let count = self.store.increment(key, window_start, window).await?;

        let allowed = count <= i64::from(limit);
        let remaining = (i64::from(limit) - count).max(0) as u32;
        let retry_after_seconds = if allowed {
            None
        } else {
            Some((window_end - now).whole_seconds().max(1) as u64)
        };

        if !allowed {
            tracing::debug!(key = %key, count = count, limit = limit, "Rate limit exceeded");
        }

        Ok(RateLimitResult {
            allowed,
            limit,
            remaining,
            retry_after_seconds,
            reset_at: window_end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use time::macros::datetime;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct MapCounterStore {
        counts: Mutex<HashMap<(String, i64), i64>>,
    }

    #[async_trait]
    impl CounterStore for MapCounterStore {
        async fn increment(
            &self,
            key: &str,
            window_start: OffsetDateTime,
            _window: Duration,
        ) -> Result<i64, RateLimitError> {
            let mut counts = self.counts.lock().await;
            let count = counts
                .entry((key.to_string(), window_start.unix_timestamp()))
                .or_insert(0);
            *count += 1;
            Ok(*count)
        }
    }

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MapCounterStore::default()))
    }

    #[test]
    fn test_daily_window_starts_at_midnight() {
        let now = datetime!(2026-03-14 15:09:26 UTC);
        let (start, end) = window_bounds(now, ONE_DAY);
        assert_eq!(start, datetime!(2026-03-14 00:00:00 UTC));
        assert_eq!(end, datetime!(2026-03-15 00:00:00 UTC));
    }

    #[tokio::test]
    async fn test_limit_rejects_after_quota() {
        let limiter = limiter();
        let now = datetime!(2026-03-14 10:00:00 UTC);

        for i in 0..3 {
            let result = limiter.check_window("key-a", 3, ONE_DAY, now).await.unwrap();
            assert!(result.allowed, "Request {} should be allowed", i);
        }

        let result = limiter.check_window("key-a", 3, ONE_DAY, now).await.unwrap();
        assert!(!result.allowed, "4th request should be rejected");
        assert_eq!(result.remaining, 0);
        assert_eq!(result.retry_after_seconds, Some(14 * 60 * 60));
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let limiter = limiter();
        let now = datetime!(2026-03-14 10:00:00 UTC);

        limiter.check_window("key-a", 1, ONE_DAY, now).await.unwrap();
        let blocked = limiter.check_window("key-a", 1, ONE_DAY, now).await.unwrap();
        let other = limiter.check_window("key-b", 1, ONE_DAY, now).await.unwrap();

        assert!(!blocked.allowed);
        assert!(other.allowed);
    }

    #[tokio::test]
    async fn test_new_window_resets_count() {
        let limiter = limiter();
        let today = datetime!(2026-03-14 23:59:00 UTC);
        let tomorrow = datetime!(2026-03-15 00:01:00 UTC);

        limiter.check_window("key-a", 1, ONE_DAY, today).await.unwrap();
        let result = limiter.check_window("key-a", 1, ONE_DAY, tomorrow).await.unwrap();
        assert!(result.allowed, "Next day should start a fresh window");
    }
}
