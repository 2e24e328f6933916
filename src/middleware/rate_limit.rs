use async_trait::async_trait;
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::RateLimitConfig;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::AppState;

/// Fixed-window request counters, shareable between processes
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Count one hit for `key` in the window containing `now` and return
    /// the running total for that window.
    async fn hit(&self, key: &str, window_secs: u64, now: i64) -> Result<u32>;
}

/// Counters in the shared SQLite database
pub struct SqliteCounterStore {
    db: Database,
}

impl SqliteCounterStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CounterStore for SqliteCounterStore {
    async fn hit(&self, key: &str, window_secs: u64, now: i64) -> Result<u32> {
        let window = window_secs.max(1) as i64;
        let window_start = now - now.rem_euclid(window);

        let (count,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO rate_limit_counters (bucket_key, window_start, count)
            VALUES (?, ?, 1)
            ON CONFLICT (bucket_key) DO UPDATE SET
                count = CASE
                    WHEN rate_limit_counters.window_start = excluded.window_start
                    THEN rate_limit_counters.count + 1
                    ELSE 1
                END,
                window_start = excluded.window_start
            RETURNING count
            "#,
        )
        .bind(key)
        .bind(window_start)
        .fetch_one(self.db.pool())
        .await?;

        // First hit of a fresh window: counters from earlier windows are dead
        if count == 1 {
            let pruned = sqlx::query("DELETE FROM rate_limit_counters WHERE window_start < ?")
                .bind(window_start)
                .execute(self.db.pool())
                .await?
                .rows_affected();
            if pruned > 0 {
                tracing::debug!("Pruned {} expired rate limit counters", pruned);
            }
        }

        Ok(count.max(0) as u32)
    }
}

/// Per-client request budget
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    limit: u32,
    window_secs: u64,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: &RateLimitConfig) -> Self {
        Self {
            store,
            limit: config.requests_per_window,
            window_secs: config.window_secs,
        }
    }

    /// Whether `client` may make another request at `now`. A failing
    /// counter store lets traffic through.
    pub async fn check(&self, client: &str, now: i64) -> bool {
        match self.store.hit(client, self.window_secs, now).await {
            Ok(count) => count <= self.limit,
            Err(e) => {
                tracing::warn!("Rate limit store unavailable: {}", e);
                true
            }
        }
    }
}

/// Rate limiting middleware, keyed by client IP
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> std::result::Result<Response, AppError> {
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    if !state.rate_limiter.check(&client, Utc::now().timestamp()).await {
        tracing::warn!("Rate limit exceeded for {}", client);
        return Err(AppError::RateLimited);
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixed_window() {
        let db = Database::in_memory().await.unwrap();
        let store = SqliteCounterStore::new(db);

        assert_eq!(store.hit("1.2.3.4", 60, 120).await.unwrap(), 1);
        assert_eq!(store.hit("1.2.3.4", 60, 150).await.unwrap(), 2);
        assert_eq!(store.hit("5.6.7.8", 60, 150).await.unwrap(), 1);
        // next window starts over
        assert_eq!(store.hit("1.2.3.4", 60, 180).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_counters_are_pruned() {
        let db = Database::in_memory().await.unwrap();
        let store = SqliteCounterStore::new(db.clone());

        for client in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            store.hit(client, 60, 10).await.unwrap();
        }
        store.hit("10.0.0.4", 60, 130).await.unwrap();

        let (rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM rate_limit_counters")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn test_limiter_blocks_over_budget() {
        let db = Database::in_memory().await.unwrap();
        let limiter = RateLimiter::new(
            Arc::new(SqliteCounterStore::new(db)),
            &RateLimitConfig {
                requests_per_window: 2,
                window_secs: 60,
            },
        );

        assert!(limiter.check("client", 0).await);
        assert!(limiter.check("client", 1).await);
        assert!(!limiter.check("client", 2).await);
        assert!(limiter.check("client", 61).await);
    }

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn hit(&self, _key: &str, _window_secs: u64, _now: i64) -> Result<u32> {
            Err(AppError::Internal("down".into()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore), &RateLimitConfig::default());
        assert!(limiter.check("client", 0).await);
    }
}
