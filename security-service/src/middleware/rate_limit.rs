use async_trait::async_trait;
use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    response::{IntoResponse, Response},
};
use service_core::error::AppError;
use std::ops::ControlFlow;
use std::sync::Arc;

use super::pipeline::{Interceptor, StageContext};
use crate::services::rate_limiter::{client_identity, RateLimitDecision, RateLimiter};

pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Enforces per-client request quotas.
pub struct RateLimitStage {
    limiter: Arc<RateLimiter>,
}

impl RateLimitStage {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

fn record_headers(ctx: &mut StageContext, decision: &RateLimitDecision) {
    let headers = &mut ctx.response_headers;
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(decision.reset));
}

#[async_trait]
impl Interceptor for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn intercept(
        &self,
        request: Request,
        ctx: &mut StageContext,
    ) -> ControlFlow<Response, Request> {
        // Owned copies: the request body is not Sync, so no borrow of the
        // request may be held across the store call.
        let path = request.uri().path().to_string();
        if !self.limiter.is_enabled() || self.limiter.is_exempt(&path) {
            return ControlFlow::Continue(request);
        }

        let method = request.method().clone();
        let identity = client_identity(request.headers(), ctx.peer);
        let decision = self.limiter.check(&identity, method.as_str(), &path).await;

        record_headers(ctx, &decision);

        if decision.allowed {
            ControlFlow::Continue(request)
        } else {
            ControlFlow::Break(
                AppError::TooManyRequests("Too many requests".to_string(), decision.retry_after)
                    .into_response(),
            )
        }
    }
}
