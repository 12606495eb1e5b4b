use axum::http::HeaderMap;
use chrono::Utc;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use super::redis::RateLimitStore;
use crate::config::{LimitSpec, RateLimitConfig};

/// The limit that applies to one request, with the scope it was chosen from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRule {
    pub scope: String,
    pub limit: u32,
    pub window_seconds: u64,
}

impl RateLimitRule {
    fn new(scope: String, spec: LimitSpec) -> Self {
        Self {
            scope,
            limit: spec.requests,
            window_seconds: spec.period_seconds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Epoch seconds at which the current window fully clears.
    pub reset: i64,
    /// Seconds to wait before retrying; set on rejections only.
    pub retry_after: Option<u64>,
}

/// Sliding-window limiter over a shared [`RateLimitStore`].
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    config: RateLimitConfig,
    /// Prefix overrides, longest first.
    prefixes: Vec<(String, LimitSpec)>,
    /// Method overrides keyed by upper-case method.
    methods: HashMap<String, LimitSpec>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, store: Arc<dyn RateLimitStore>) -> Self {
        let mut prefixes: Vec<(String, LimitSpec)> = config
            .prefix_limits
            .iter()
            .map(|(prefix, spec)| (prefix.clone(), *spec))
            .collect();
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        // Config sources may lowercase map keys.
        let methods = config
            .method_limits
            .iter()
            .map(|(method, spec)| (method.to_uppercase(), *spec))
            .collect();

        Self {
            store,
            config,
            prefixes,
            methods,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.config.exempt_paths.iter().any(|p| p == path)
    }

    /// Narrowest matching rule: exact path, then longest prefix, then
    /// method, then the global default.
    pub fn rule_for(&self, method: &str, path: &str) -> RateLimitRule {
        if let Some(spec) = self.config.path_limits.get(path) {
            return RateLimitRule::new(format!("path:{}", path), *spec);
        }

        if let Some((prefix, spec)) = self
            .prefixes
            .iter()
            .find(|(p, _)| path.starts_with(p.as_str()))
        {
            return RateLimitRule::new(format!("prefix:{}", prefix), *spec);
        }

        let method = method.to_uppercase();
        if let Some(spec) = self.methods.get(&method) {
            return RateLimitRule::new(format!("method:{}", method), *spec);
        }

        RateLimitRule::new(
            "global".to_string(),
            LimitSpec {
                requests: self.config.requests,
                period_seconds: self.config.period_seconds,
            },
        )
    }

    pub async fn check(&self, identity: &str, method: &str, path: &str) -> RateLimitDecision {
        self.check_at(identity, method, path, Utc::now().timestamp_millis())
            .await
    }

    /// Record a request made at `now_ms` and decide whether it is admitted.
    ///
    /// Rejected requests are recorded too, so a client that keeps hammering
    /// stays limited. If the store is unreachable the request is admitted.
    pub async fn check_at(
        &self,
        identity: &str,
        method: &str,
        path: &str,
        now_ms: i64,
    ) -> RateLimitDecision {
        let rule = self.rule_for(method, path);
        let window_ms = (rule.window_seconds as i64) * 1000;
        let reset = (now_ms + window_ms + 999) / 1000;
        let key = format!("ratelimit:{}:{}", rule.scope, identity);

        let count = match self.store.record_hit(&key, now_ms, window_ms).await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    scope = %rule.scope,
                    "Rate limit store unavailable, admitting request"
                );
                metrics::counter!("rate_limit_store_errors_total").increment(1);
                return RateLimitDecision {
                    allowed: true,
                    limit: rule.limit,
                    remaining: rule.limit,
                    reset,
                    retry_after: None,
                };
            }
        };

        let allowed = count <= rule.limit as u64;
        let remaining = (rule.limit as u64).saturating_sub(count) as u32;

        if !allowed {
            tracing::warn!(
                identity = %identity,
                scope = %rule.scope,
                count,
                limit = rule.limit,
                "Rate limit exceeded"
            );
            metrics::counter!("rate_limit_rejections_total", "scope" => rule.scope.clone())
                .increment(1);
        }

        RateLimitDecision {
            allowed,
            limit: rule.limit,
            remaining,
            reset,
            retry_after: (!allowed).then_some(rule.window_seconds),
        }
    }
}

/// Identity a client is limited under: the first `X-Forwarded-For` entry,
/// else the socket peer address, else `"unknown"`.
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}
