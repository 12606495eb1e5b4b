use async_trait::async_trait;
use jsonwebtoken::jwk::{JwkSet, PublicKeyUse};
use jsonwebtoken::DecodingKey;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::error::JwksError;

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Floor between refetches triggered by an unknown `kid`, so tokens with
/// made-up key ids cannot drive traffic to the issuer.
const DEFAULT_MIN_REFETCH_INTERVAL: Duration = Duration::from_secs(30);

/// Where a JWKS document comes from.
#[async_trait]
pub trait JwksFetcher: Send + Sync {
    async fn fetch(&self) -> Result<JwkSet, JwksError>;
}

/// Fetches the JWKS document over HTTP(S).
pub struct HttpJwksFetcher {
    client: reqwest::Client,
    url: String,
}

impl HttpJwksFetcher {
    pub fn new(url: impl Into<String>) -> Result<Self, JwksError> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| JwksError::Fetch(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl JwksFetcher for HttpJwksFetcher {
    async fn fetch(&self) -> Result<JwkSet, JwksError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| JwksError::Fetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(JwksError::Fetch(format!(
                "{} returned {}",
                self.url,
                response.status()
            )));
        }

        response
            .json::<JwkSet>()
            .await
            .map_err(|e| JwksError::Fetch(format!("Invalid JWKS document: {}", e)))
    }
}

struct CachedKeys {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Instant,
}

/// Verification keys from a JWKS document, cached by `kid` for a TTL.
///
/// A stale cache or an unknown `kid` triggers a refetch. Concurrent misses
/// share one fetch.
pub struct JwksKeySource {
    fetcher: Arc<dyn JwksFetcher>,
    ttl: Duration,
    min_refetch_interval: Duration,
    cache: RwLock<Option<CachedKeys>>,
}

impl JwksKeySource {
    pub fn new(fetcher: Arc<dyn JwksFetcher>, ttl: Duration) -> Self {
        Self {
            fetcher,
            ttl,
            min_refetch_interval: DEFAULT_MIN_REFETCH_INTERVAL,
            cache: RwLock::new(None),
        }
    }

    pub fn with_min_refetch_interval(mut self, interval: Duration) -> Self {
        self.min_refetch_interval = interval;
        self
    }

    pub async fn decoding_key(&self, kid: &str) -> Result<DecodingKey, JwksError> {
        if let Some(found) = self.cached(self.cache.read().await.as_ref(), kid) {
            return found;
        }

        let mut cache = self.cache.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(found) = self.cached(cache.as_ref(), kid) {
            return found;
        }

        let fetched = self.fetch_keys().await?;
        let found = fetched.keys.get(kid).cloned();
        *cache = Some(fetched);

        found.ok_or_else(|| JwksError::UnknownKey(kid.to_string()))
    }

    /// Drop the cached keys; the next lookup refetches.
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
        tracing::info!("JWKS cache invalidated");
    }

    pub async fn cached_key_ids(&self) -> Vec<String> {
        let cache = self.cache.read().await;
        let mut ids: Vec<String> = cache
            .as_ref()
            .map(|c| c.keys.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// `None` means the cache cannot answer and a fetch is due.
    fn cached(
        &self,
        cache: Option<&CachedKeys>,
        kid: &str,
    ) -> Option<Result<DecodingKey, JwksError>> {
        let cache = cache?;
        let age = cache.fetched_at.elapsed();
        if age >= self.ttl {
            return None;
        }

        match cache.keys.get(kid) {
            Some(key) => Some(Ok(key.clone())),
            None if age < self.min_refetch_interval => {
                Some(Err(JwksError::UnknownKey(kid.to_string())))
            }
            None => None,
        }
    }

    async fn fetch_keys(&self) -> Result<CachedKeys, JwksError> {
        let set = self.fetcher.fetch().await.map_err(|e| {
            tracing::error!(error = %e, "JWKS fetch failed");
            e
        })?;

        let mut keys = HashMap::new();
        for jwk in &set.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                tracing::debug!("Skipping JWK without kid");
                continue;
            };
            if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
                continue;
            }
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => {
                    keys.insert(kid, key);
                }
                Err(e) => tracing::warn!(kid = %kid, error = %e, "Skipping unusable JWK"),
            }
        }

        tracing::info!(keys = keys.len(), "JWKS refreshed");
        Ok(CachedKeys {
            keys,
            fetched_at: Instant::now(),
        })
    }
}
