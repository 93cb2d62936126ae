/* Copyright 2026- The Courier team. All rights reserved.
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *     http://www.apache.org/licenses/LICENSE-2.0
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Fixed-window rate limiting, in two variants.
//!
//! The in-process variant counts hits in a mutex-guarded map that is
//! dropped wholesale when the wall-clock window rolls. The shared variant
//! counts in the `rate_limit_windows` table with short transactions, so
//! one window spans every instance on the same store. Window starts are
//! aligned (`floor(now / W) * W`), which makes them reproducible across
//! instances.
//!
//! The shared variant fails OPEN: a storage failure allows the request.
//! Failing closed would turn a store outage into a full outage of every
//! rate-limited surface.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::warn;

use crate::error::ApiError;

/// The default window width.
pub const WINDOW: Duration = Duration::from_secs(60);

/// One hit-counting strategy behind the middleware.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one attempt for `bucket` and decide whether it passes.
    async fn allow(&self, bucket: &str) -> bool;
}

/// The client bucket key: the first `X-Forwarded-For` entry when present,
/// else the remote host, else `"unknown"`.
pub fn client_bucket(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    match remote {
        Some(addr) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}

/// Reject requests over the limit with 429 and the documented JSON body.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<dyn RateLimiter>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let bucket = client_bucket(request.headers(), remote);

    if limiter.allow(&bucket).await {
        Ok(next.run(request).await)
    } else {
        Err(ApiError::RateLimited)
    }
}

struct WindowState {
    hits: HashMap<String, u32>,
    until: Instant,
}

/// The single-process variant: one mutex, one map, dropped on window roll.
pub struct FixedWindowLimiter {
    limit: u32,
    window: Duration,
    state: Mutex<WindowState>,
}

impl FixedWindowLimiter {
    /// A limiter allowing `limit` hits per bucket per `window`. A zero
    /// limit disables limiting.
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(WindowState {
                hits: HashMap::new(),
                until: Instant::now() + window,
            }),
        }
    }
}

#[async_trait::async_trait]
impl RateLimiter for FixedWindowLimiter {
    async fn allow(&self, bucket: &str) -> bool {
        if self.limit == 0 {
            return true;
        }

        let now = Instant::now();
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        if now > state.until {
            state.hits = HashMap::new();
            state.until = now + self.window;
        }

        let hits = state.hits.entry(bucket.to_string()).or_insert(0);
        *hits += 1;
        *hits <= self.limit
    }
}

/// The cross-process variant, counting hits in `rate_limit_windows`.
pub struct SharedWindowLimiter {
    pool: SqlitePool,
    limit: u32,
    window_secs: i64,
}

impl SharedWindowLimiter {
    /// A limiter over the given store. A zero limit disables limiting.
    pub fn new(pool: SqlitePool, limit: u32, window: Duration) -> Self {
        Self {
            pool,
            limit,
            window_secs: window.as_secs().max(1) as i64,
        }
    }

    /// Insert-or-ignore, increment, read back, all in one short transaction.
    async fn count_hit(&self, bucket: &str, now_epoch: i64) -> Result<i64, sqlx::Error> {
        let window_start = now_epoch - now_epoch.rem_euclid(self.window_secs);
        let now = OffsetDateTime::from_unix_timestamp(now_epoch)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO rate_limit_windows (bucket, window_start_epoch, hits, updated_at) \
             VALUES (?, ?, 0, ?) \
             ON CONFLICT(bucket, window_start_epoch) DO NOTHING",
        )
        .bind(bucket)
        .bind(window_start)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE rate_limit_windows SET hits = hits + 1, updated_at = ? \
             WHERE bucket = ? AND window_start_epoch = ?",
        )
        .bind(now)
        .bind(bucket)
        .bind(window_start)
        .execute(&mut *tx)
        .await?;

        let hits: i64 = sqlx::query_scalar(
            "SELECT hits FROM rate_limit_windows WHERE bucket = ? AND window_start_epoch = ?",
        )
        .bind(bucket)
        .bind(window_start)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(hits)
    }

    /// Drop windows old enough that no instance can still be counting in
    /// them.
    async fn collect_expired(&self, now_epoch: i64) -> Result<u64, sqlx::Error> {
        let horizon = now_epoch - 2 * self.window_secs;
        let result = sqlx::query("DELETE FROM rate_limit_windows WHERE window_start_epoch < ?")
            .bind(horizon)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait::async_trait]
impl RateLimiter for SharedWindowLimiter {
    async fn allow(&self, bucket: &str) -> bool {
        if self.limit == 0 {
            return true;
        }

        let now_epoch = OffsetDateTime::now_utc().unix_timestamp();
        let allowed = match self.count_hit(bucket, now_epoch).await {
            Ok(hits) => hits <= i64::from(self.limit),
            Err(err) => {
                warn!("rate limiter store failure, allowing request: {err}");
                true
            }
        };

        // Probabilistic garbage collection, roughly one sweep per 256
        // attempts. Best effort.
        if rand::random::<u8>() == 0 {
            if let Err(err) = self.collect_expired(now_epoch).await {
                warn!("rate limiter garbage collection failed: {err}");
            }
        }

        allowed
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use axum::http::HeaderValue;

    use crate::repository::connect_memory;

    #[test]
    fn bucket_prefers_the_first_forwarded_entry() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(" 203.0.113.9 , 10.0.0.1"),
        );
        let remote: SocketAddr = "192.0.2.1:9999".parse().unwrap();
        assert_eq!(client_bucket(&headers, Some(remote)), "203.0.113.9");
    }

    #[test]
    fn bucket_falls_back_to_the_remote_host_then_unknown() {
        let remote: SocketAddr = "192.0.2.1:9999".parse().unwrap();
        assert_eq!(client_bucket(&HeaderMap::new(), Some(remote)), "192.0.2.1");
        assert_eq!(client_bucket(&HeaderMap::new(), None), "unknown");

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("  "));
        assert_eq!(client_bucket(&headers, None), "unknown");
    }

    #[tokio::test]
    async fn fixed_window_blocks_over_the_limit() {
        let limiter = FixedWindowLimiter::new(2, WINDOW);
        assert!(limiter.allow("a").await);
        assert!(limiter.allow("a").await);
        assert!(!limiter.allow("a").await);
        // Other buckets have their own count.
        assert!(limiter.allow("b").await);
    }

    #[tokio::test]
    async fn fixed_window_zero_limit_disables() {
        let limiter = FixedWindowLimiter::new(0, WINDOW);
        for _ in 0..100 {
            assert!(limiter.allow("a").await);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_window_resets_on_roll() {
        let limiter = FixedWindowLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.allow("a").await);
        assert!(!limiter.allow("a").await);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(limiter.allow("a").await);
    }

    #[tokio::test]
    async fn shared_window_spans_instances_on_one_store() {
        let pool = connect_memory().await.unwrap();
        let instance_a = SharedWindowLimiter::new(pool.clone(), 2, WINDOW);
        let instance_b = SharedWindowLimiter::new(pool, 2, WINDOW);

        assert!(instance_a.allow("203.0.113.9").await);
        assert!(instance_a.allow("203.0.113.9").await);
        assert!(!instance_b.allow("203.0.113.9").await);
    }

    #[tokio::test]
    async fn shared_window_counts_buckets_independently() {
        let pool = connect_memory().await.unwrap();
        let limiter = SharedWindowLimiter::new(pool, 1, WINDOW);

        assert!(limiter.allow("a").await);
        assert!(limiter.allow("b").await);
        assert!(!limiter.allow("a").await);
    }

    #[tokio::test]
    async fn shared_window_rolls_with_aligned_starts() {
        let pool = connect_memory().await.unwrap();
        let limiter = SharedWindowLimiter::new(pool, 1, WINDOW);

        let epoch = 1_700_000_000;
        assert!(limiter.count_hit("a", epoch).await.unwrap() == 1);
        assert!(limiter.count_hit("a", epoch + 1).await.unwrap() == 2);
        // Next window: the counter starts over.
        assert!(limiter.count_hit("a", epoch + 60).await.unwrap() == 1);
    }

    #[tokio::test]
    async fn shared_window_fails_open_on_store_failure() {
        let pool = connect_memory().await.unwrap();
        let limiter = SharedWindowLimiter::new(pool.clone(), 1, WINDOW);
        pool.close().await;

        assert!(limiter.allow("a").await);
        assert!(limiter.allow("a").await);
    }

    #[tokio::test]
    async fn garbage_collection_drops_stale_windows_only() {
        let pool = connect_memory().await.unwrap();
        let limiter = SharedWindowLimiter::new(pool.clone(), 10, WINDOW);

        let now = 1_700_000_000;
        limiter.count_hit("old", now - 200).await.unwrap();
        limiter.count_hit("recent", now - 60).await.unwrap();
        limiter.count_hit("current", now).await.unwrap();

        let dropped = limiter.collect_expired(now).await.unwrap();
        assert_eq!(dropped, 1);

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rate_limit_windows")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining, 2);
    }
}
