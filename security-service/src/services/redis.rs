use async_trait::async_trait;
use dashmap::DashMap;
use redis::{aio::ConnectionManager, Client};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use uuid::Uuid;

use super::error::StoreError;
use crate::config::RedisConfig;

/// Shared sliding-window counters.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomically drop every timestamp at or before `now_ms - window_ms`,
    /// record `now_ms`, refresh the key TTL to the window, and return the
    /// number of timestamps left in the window (including this one).
    async fn record_hit(&self, key: &str, now_ms: i64, window_ms: i64) -> Result<u64, StoreError>;
}

/// Shared token revocation list.
#[async_trait]
pub trait RevocationStore: Send + Sync {
    /// Mark `fingerprint` revoked for `ttl_seconds`. Re-revoking is harmless.
    async fn revoke(&self, fingerprint: &str, ttl_seconds: u64) -> Result<(), StoreError>;
    async fn is_revoked(&self, fingerprint: &str) -> Result<bool, StoreError>;
    async fn health_check(&self) -> Result<(), StoreError>;
}

/// Redis-backed store. The connection is established lazily so a Redis
/// outage at startup degrades the limiter instead of preventing boot.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    manager: std::sync::Arc<OnceCell<ConnectionManager>>,
    timeout: Duration,
}

impl RedisStore {
    pub fn new(config: &RedisConfig) -> Result<Self, anyhow::Error> {
        let client = Client::open(config.url.clone())
            .map_err(|e| anyhow::anyhow!("Invalid Redis URL: {}", e))?;

        Ok(Self {
            client,
            manager: std::sync::Arc::new(OnceCell::new()),
            timeout: Duration::from_millis(config.timeout_ms),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                tracing::info!("Connecting to Redis");
                let manager = self.client.get_connection_manager().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to get Redis connection manager");
                    StoreError::from(e)
                })?;
                tracing::info!("Successfully connected to Redis");
                Ok::<_, StoreError>(manager)
            });

        // Bound the initial connect as well as the command itself.
        let manager = self.bounded(manager).await??;
        Ok(manager.clone())
    }

    async fn bounded<F, T>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = T>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout.as_millis() as u64))
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn record_hit(&self, key: &str, now_ms: i64, window_ms: i64) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        // Same-millisecond hits from one client must stay distinct members.
        let member = format!("{}-{}", now_ms, Uuid::new_v4().simple());

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(now_ms - window_ms)
            .ignore()
            .cmd("ZADD")
            .arg(key)
            .arg(now_ms)
            .arg(&member)
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(window_ms)
            .ignore()
            .cmd("ZCARD")
            .arg(key);
        let query = pipe.query_async::<_, (u64,)>(&mut conn);

        let (count,) = self.bounded(query).await??;
        Ok(count)
    }
}

#[async_trait]
impl RevocationStore for RedisStore {
    async fn revoke(&self, fingerprint: &str, ttl_seconds: u64) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let key = format!("revoked:{}", fingerprint);

        let mut cmd = redis::cmd("SET");
        cmd.arg(&key).arg("revoked").arg("EX").arg(ttl_seconds.max(1));
        let query = cmd.query_async::<_, ()>(&mut conn);

        self.bounded(query).await??;
        Ok(())
    }

    async fn is_revoked(&self, fingerprint: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let key = format!("revoked:{}", fingerprint);

        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(&key);
        let query = cmd.query_async::<_, bool>(&mut conn);

        Ok(self.bounded(query).await??)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let cmd = redis::cmd("PING");
        let query = cmd.query_async::<_, ()>(&mut conn);
        self.bounded(query).await??;
        Ok(())
    }
}

/// Process-local store for development and tests. Correct for a single
/// instance only; multi-instance deployments need [`RedisStore`].
///
/// Idle windows and expired revocations are swept every `sweep_every`
/// operations so the maps stay bounded by live clients and live tokens.
pub struct InMemoryStore {
    windows: DashMap<String, Window>,
    revoked: DashMap<String, i64>,
    ops: AtomicU64,
    sweep_every: u64,
}

struct Window {
    hits: VecDeque<i64>,
    window_ms: i64,
}

const DEFAULT_SWEEP_EVERY: u64 = 256;

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_EVERY)
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sweep_interval(sweep_every: u64) -> Self {
        Self {
            windows: DashMap::new(),
            revoked: DashMap::new(),
            ops: AtomicU64::new(0),
            sweep_every: sweep_every.max(1),
        }
    }

    /// Drop windows whose newest hit has aged out and revocations past
    /// their expiry. Must not be called while holding a map guard.
    fn maybe_sweep(&self, now_ms: i64) {
        if self.ops.fetch_add(1, Ordering::Relaxed) % self.sweep_every != 0 {
            return;
        }
        self.windows.retain(|_, w| {
            w.hits
                .back()
                .is_some_and(|last| *last > now_ms - w.window_ms)
        });
        self.revoked.retain(|_, expires_at| *expires_at > now_ms);
    }

    pub fn tracked_windows(&self) -> usize {
        self.windows.len()
    }

    pub fn tracked_revocations(&self) -> usize {
        self.revoked.len()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryStore {
    async fn record_hit(&self, key: &str, now_ms: i64, window_ms: i64) -> Result<u64, StoreError> {
        self.maybe_sweep(now_ms);

        // The entry guard holds the shard lock for the whole prune/add/count.
        let mut window = self.windows.entry(key.to_string()).or_insert_with(|| Window {
            hits: VecDeque::new(),
            window_ms,
        });
        window.window_ms = window_ms;
        let cutoff = now_ms - window_ms;

        while window.hits.front().is_some_and(|ts| *ts <= cutoff) {
            window.hits.pop_front();
        }
        window.hits.push_back(now_ms);

        Ok(window.hits.len() as u64)
    }
}

#[async_trait]
impl RevocationStore for InMemoryStore {
    async fn revoke(&self, fingerprint: &str, ttl_seconds: u64) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp_millis();
        self.maybe_sweep(now);

        let expires_at = now + (ttl_seconds.max(1) as i64) * 1000;
        self.revoked.insert(fingerprint.to_string(), expires_at);
        Ok(())
    }

    async fn is_revoked(&self, fingerprint: &str) -> Result<bool, StoreError> {
        let now = chrono::Utc::now().timestamp_millis();
        self.maybe_sweep(now);

        let live = self
            .revoked
            .get(fingerprint)
            .map(|expires_at| *expires_at > now)
            .unwrap_or(false);

        if !live {
            self.revoked.remove_if(fingerprint, |_, expires_at| *expires_at <= now);
        }

        Ok(live)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
